//! # unitdocs
//!
//! Document ingestion, drawing classification and access-safe resolution
//! for property developer portals.
//!
//! Developers upload batches of documents for a development. Each file is
//! stored in a blob store, its text extracted and chunked, and the drawing
//! classified by house type and drawing type. Homeowners later ask for
//! documents through their unit; resolution only ever returns documents of
//! the unit's own house type (or shared documents with no house type).
//!
//! ## Architecture
//!
//! ```text
//!  POST /train ──▶ FileValidator ──▶ TrainingOrchestrator ──▶ BlobStore
//!                                      │  extract · classify · chunk
//!                                      ▼
//!                                   SQLite ◀── DocumentResolver ◀── POST /resolve
//!                                      ▲   ◀── FloorPlanFallbackResolver
//!                      RateLimiter ────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed request errors |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`store`] | Development, unit, document and job persistence |
//! | [`rate_limit`] | Fixed-window rate limiting |
//! | [`validate`] | Upload batch validation |
//! | [`extract`] | Text extraction (PDF, DOCX, text formats) |
//! | [`chunk`] | Text chunking |
//! | [`oracle`] | AI completion oracle |
//! | [`classify`] | Drawing classification |
//! | [`blob`] | Blob storage and signed URLs |
//! | [`train`] | Batch ingestion |
//! | [`resolve`] | Document resolution for a unit |
//! | [`floor_plan`] | Floor plan lookup with tiered fallback |
//! | [`server`] | HTTP API |
//! | [`cli`] | CLI command implementations |

pub mod blob;
pub mod chunk;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod floor_plan;
pub mod migrate;
pub mod models;
pub mod oracle;
pub mod rate_limit;
pub mod resolve;
pub mod server;
pub mod store;
pub mod train;
pub mod validate;
