//! Relational store for developments, units, documents and training jobs.
//!
//! The [`Store`] trait is what the orchestrator and the resolvers depend on.
//! [`SqliteStore`] is the production backend; [`MemoryStore`] backs unit
//! tests and can simulate an unavailable store.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`add_development`](Store::add_development) | Register a development and its tenant |
//! | [`development`](Store::development) | Look up a development |
//! | [`add_unit`](Store::add_unit) | Register a unit and its house type |
//! | [`unit_identity`](Store::unit_identity) | Resolve a unit's development and house type |
//! | [`replace_document`](Store::replace_document) | Insert a document, replacing one with the same file name |
//! | [`project_documents`](Store::project_documents) | All documents of a development |
//! | [`insert_job`](Store::insert_job) / [`finish_job`](Store::finish_job) | Training job audit trail |
//! | [`jobs_for`](Store::jobs_for) | Recent jobs of a tenant's development |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Development, DocumentMetadata, JobStatus, TrainingJob, UnitIdentity};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates a development.
    async fn add_development(&self, development: &Development) -> Result<()>;

    async fn development(&self, id: &str) -> Result<Option<Development>>;

    /// Inserts or updates a unit.
    async fn add_unit(&self, unit: &UnitIdentity) -> Result<()>;

    async fn unit_identity(&self, unit_id: &str) -> Result<Option<UnitIdentity>>;

    /// Stores `doc` and its chunks. An existing document with the same
    /// `(development_id, file_name)` is removed together with its chunks.
    ///
    /// Returns the number of chunks inserted.
    async fn replace_document(&self, doc: &DocumentMetadata, chunks: &[Chunk]) -> Result<usize>;

    /// Documents of a development, oldest first.
    async fn project_documents(&self, development_id: &str) -> Result<Vec<DocumentMetadata>>;

    async fn insert_job(&self, job: &TrainingJob) -> Result<()>;

    async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        chunks: i64,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<()>;

    /// Most recent jobs first.
    async fn jobs_for(
        &self,
        tenant_id: &str,
        development_id: &str,
        limit: i64,
    ) -> Result<Vec<TrainingJob>>;
}
