//! Typed errors for the ingestion request path.
//!
//! Resolution never errors for expected outcomes: "not found" and access
//! denials are result values (see [`crate::resolve`]). Only failures the
//! caller must act on are represented here.

use crate::rate_limit::RateLimitDecision;

/// Problems with the shape of an upload batch.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("No files provided")]
    NoFiles,

    #[error("Too many files. Maximum {max} files allowed per upload.")]
    TooManyFiles { count: usize, max: usize },

    /// Every file failed its per-file checks.
    #[error("No valid files to process")]
    NoValidFiles { errors: Vec<String> },
}

/// Why an ingestion request was rejected before any file was processed.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("developmentId is required")]
    MissingDevelopment,

    #[error("Development not found")]
    DevelopmentNotFound(String),

    #[error("Development has no associated tenant")]
    NoTenant(String),

    #[error("Unit {0} does not belong to this development")]
    UnitNotInDevelopment(String),

    #[error("Rate limit exceeded. Maximum {max_requests} training operations per window.")]
    RateLimited {
        decision: RateLimitDecision,
        max_requests: u32,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
