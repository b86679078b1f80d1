//! Error types shared across the discovery and enrichment pipeline.
//!
//! Two families live here because every layer touches them:
//! - [`FetchError`]: per-item failures from the detail API and response parsing.
//!   These never unwind past a single item; they become queue status transitions.
//! - [`StorageError`]: persistence failures. These abort the current batch and
//!   propagate to the pipeline loop, which backs off and retries the cycle.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// How a per-item failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, timeout, rate-limit or server-side failure. Worth retrying.
    Transient,
    /// Not found, malformed identifier, rejected request. Retrying will not help.
    Permanent,
    /// The response arrived but did not have the expected shape.
    Parse,
}

impl ErrorKind {
    /// Whether an item failing with this kind may be requeued.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Parse => "parse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while fetching or parsing the detail for one work item.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by upstream (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("timed out waiting for a rate-limiter permit")]
    PermitTimeout,

    #[error("upstream server error ({status})")]
    Server { status: u16 },

    #[error("repository not found")]
    NotFound,

    #[error("invalid repository identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response shape: {0}")]
    Parse(String),
}

impl FetchError {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout(_)
            | FetchError::Transport(_)
            | FetchError::RateLimited { .. }
            | FetchError::PermitTimeout
            | FetchError::Server { .. } => ErrorKind::Transient,
            FetchError::NotFound
            | FetchError::InvalidIdentifier(_)
            | FetchError::Rejected { .. } => ErrorKind::Permanent,
            FetchError::Parse(_) => ErrorKind::Parse,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Transport(format!("timeout: {err}"))
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Storage call '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Invalid stored value in column '{column}': {value}")]
    InvalidValue { column: &'static str, value: String },
}

/// Run a storage future under an explicit deadline.
pub async fn with_db_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, StorageError>
where
    F: std::future::Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout { operation, timeout }),
    }
}
