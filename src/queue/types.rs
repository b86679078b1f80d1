//! Queue record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::from_millis;

/// Lifecycle state of a work item.
///
/// `pending -> in_progress -> {completed, failed, skipped}`; `failed` returns
/// to `pending` while the retry budget allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// The detail API answered but had nothing to enrich.
    Skipped,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::Pending,
        WorkStatus::InProgress,
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Skipped)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown work status '{s}'"))
    }
}

/// A candidate produced by discovery, not yet queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: i64,
    pub external_name: String,
    /// Evidence of relevance, e.g. number of events seen. Added to the
    /// item's activity score on every enqueue.
    pub signal_count: i64,
}

impl Candidate {
    pub fn new(external_id: i64, external_name: impl Into<String>, signal_count: i64) -> Self {
        Self {
            external_id,
            external_name: external_name.into(),
            signal_count,
        }
    }
}

/// A unit of pending enrichment work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub external_id: i64,
    pub external_name: String,
    pub status: WorkStatus,
    pub activity_score: i64,
    pub retry_count: u32,
    /// False once a permanent or parse failure has been recorded.
    pub retryable: bool,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// A failed item that will never be attempted again.
    pub fn is_poisoned(&self, max_retries: u32) -> bool {
        self.status == WorkStatus::Failed && (!self.retryable || self.retry_count >= max_retries)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkItemRow {
    external_id: i64,
    external_name: String,
    status: String,
    activity_score: i64,
    retry_count: i64,
    retryable: bool,
    last_error: Option<String>,
    claimed_by: Option<String>,
    discovered_at: i64,
    updated_at: i64,
    last_attempt_at: Option<i64>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StorageError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|_| StorageError::InvalidValue {
                column: "status",
                value: row.status.clone(),
            })?;
        Ok(WorkItem {
            external_id: row.external_id,
            external_name: row.external_name,
            status,
            activity_score: row.activity_score,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            retryable: row.retryable,
            last_error: row.last_error,
            claimed_by: row.claimed_by,
            discovered_at: from_millis("discovered_at", row.discovered_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            last_attempt_at: row
                .last_attempt_at
                .map(|ms| from_millis("last_attempt_at", ms))
                .transpose()?,
        })
    }
}

/// A source file or page to harvest candidates from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReference {
    pub locator: String,
    pub done: bool,
    pub scraped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceReferenceRow {
    locator: String,
    done: bool,
    scraped_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<SourceReferenceRow> for SourceReference {
    type Error = StorageError;

    fn try_from(row: SourceReferenceRow) -> Result<Self, Self::Error> {
        Ok(SourceReference {
            locator: row.locator,
            done: row.done,
            scraped_at: row
                .scraped_at
                .map(|ms| from_millis("scraped_at", ms))
                .transpose()?,
            created_at: from_millis("created_at", row.created_at)?,
        })
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    /// Subset of `failed` that has exhausted its retries or is not retryable.
    pub poisoned: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }

    pub fn count(&self, status: WorkStatus) -> i64 {
        match status {
            WorkStatus::Pending => self.pending,
            WorkStatus::InProgress => self.in_progress,
            WorkStatus::Completed => self.completed,
            WorkStatus::Failed => self.failed,
            WorkStatus::Skipped => self.skipped,
        }
    }
}
