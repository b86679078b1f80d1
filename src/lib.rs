//! repo-scout: repository discovery queue and rate-limited enrichment pipeline.
//!
//! Candidates are harvested from GH Archive and repository search into a
//! durable work queue, enriched through the GitHub GraphQL API under a token
//! bucket, and persisted idempotently with their languages, topics and
//! dependencies.

pub mod cache;
pub mod cli;
pub mod discovery;
pub mod enrich;
pub mod error;
pub mod github;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod ratelimit;
pub mod storage;

// Re-export commonly used error types
pub use error::{ErrorKind, FetchError, StorageError};
