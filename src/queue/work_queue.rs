//! Durable work queue backed by the `work_items` table.
//!
//! Claims are a single `UPDATE ... RETURNING` statement. SQLite runs it under
//! its database write lock, so two workers (or two processes sharing the
//! file) can never claim the same row in the same cycle.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transition::Transition;
use super::types::{Candidate, QueueStats, WorkItem, WorkItemRow, WorkStatus};
use crate::error::{ErrorKind, StorageError};
use crate::storage::{to_millis, Store};

const ENQUEUE_CHUNK: usize = 500;

const CLAIM_SQL: &str = r#"
UPDATE work_items
SET status = 'in_progress',
    last_attempt_at = ?1,
    updated_at = ?1,
    claimed_by = ?2
WHERE external_id IN (
    SELECT external_id FROM work_items
    WHERE status = 'pending'
       OR (status = 'in_progress' AND (last_attempt_at IS NULL OR last_attempt_at < ?3))
    ORDER BY activity_score DESC, external_id
    LIMIT ?4
)
RETURNING *
"#;

/// Counts from applying a batch of transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Items no longer claimed by this worker when the batch settled.
    pub lost: u64,
}

/// Handle to the discovery queue.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    store: Store,
    worker_id: String,
    in_progress_timeout: Duration,
}

impl WorkQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            in_progress_timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// How long an `in_progress` item may sit before another claim may take it.
    pub fn with_in_progress_timeout(mut self, timeout: Duration) -> Self {
        self.in_progress_timeout = timeout;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Insert candidates as `pending`, merging with existing rows.
    ///
    /// Duplicate ids within `candidates` are collapsed first (signal counts
    /// summed). An id already in the table keeps its status and has its
    /// activity score increased. Returns the number of distinct ids written.
    pub async fn enqueue(&self, candidates: &[Candidate]) -> Result<usize, StorageError> {
        self.enqueue_at(candidates, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let merged = merge_candidates(candidates);
        if merged.is_empty() {
            return Ok(0);
        }
        let now = to_millis(now);

        let mut tx = self.store.pool().begin().await?;
        for chunk in merged.chunks(ENQUEUE_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO work_items (external_id, external_name, status, activity_score, \
                 discovered_at, updated_at) ",
            );
            qb.push_values(chunk, |mut row, c| {
                row.push_bind(c.external_id)
                    .push_bind(&c.external_name)
                    .push_bind(WorkStatus::Pending.as_str())
                    .push_bind(c.signal_count)
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT(external_id) DO UPDATE SET \
                 activity_score = work_items.activity_score + excluded.activity_score, \
                 external_name = excluded.external_name, \
                 updated_at = excluded.updated_at",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(count = merged.len(), "Enqueued candidates");
        Ok(merged.len())
    }

    /// Claim up to `limit` items, highest activity score first.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<WorkItem>, StorageError> {
        self.claim_batch_at(limit, Utc::now()).await
    }

    pub async fn claim_batch_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_millis(now);
        let stale_before = now_ms - self.in_progress_timeout.as_millis() as i64;

        let rows: Vec<WorkItemRow> = sqlx::query_as(CLAIM_SQL)
            .bind(now_ms)
            .bind(&self.worker_id)
            .bind(stale_before)
            .bind(limit as i64)
            .fetch_all(self.store.pool())
            .await?;

        // RETURNING does not preserve the subquery's order.
        let mut items = rows
            .into_iter()
            .map(WorkItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| {
            b.activity_score
                .cmp(&a.activity_score)
                .then(a.external_id.cmp(&b.external_id))
        });

        if !items.is_empty() {
            debug!(worker_id = %self.worker_id, count = items.len(), "Claimed batch");
        }
        Ok(items)
    }

    pub async fn mark_completed(&self, ids: &[i64]) -> Result<u64, StorageError> {
        self.set_terminal(ids, WorkStatus::Completed, None).await
    }

    pub async fn mark_skipped(&self, ids: &[i64], reason: &str) -> Result<u64, StorageError> {
        self.set_terminal(ids, WorkStatus::Skipped, Some(reason)).await
    }

    /// Record a failed attempt. Permanent and parse failures are stored as
    /// not retryable and will never be requeued.
    ///
    /// Like every settling write, this only applies while the item is still
    /// `in_progress` under this worker's claim. Returns the rows updated.
    pub async fn mark_failed(
        &self,
        id: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<u64, StorageError> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            "UPDATE work_items SET status = 'failed', retry_count = retry_count + 1, \
             last_error = ?, retryable = ?, claimed_by = NULL, last_attempt_at = ?, \
             updated_at = ? WHERE external_id = ? AND status = 'in_progress' AND claimed_by = ?",
        )
        .bind(message)
        .bind(kind.is_retryable())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(&self.worker_id)
        .execute(self.store.pool())
        .await?;

        let affected = result.rows_affected();
        if affected == 0 {
            warn!(worker_id = %self.worker_id, id, "Claim lost before failure was recorded");
        }
        Ok(affected)
    }

    /// Apply every transition in one transaction.
    ///
    /// A transition is applied only if the item is still `in_progress` and
    /// claimed by this worker. Items whose claim went stale and were taken
    /// over by another worker are left untouched and counted as `lost`.
    pub async fn settle(&self, transitions: &[(i64, Transition)]) -> Result<SettleReport, StorageError> {
        let mut report = SettleReport::default();
        if transitions.is_empty() {
            return Ok(report);
        }
        let now = to_millis(Utc::now());
        let mut lost = Vec::new();

        let mut tx = self.store.pool().begin().await?;
        for (id, transition) in transitions {
            let id = *id;
            let query = match transition {
                Transition::Complete => sqlx::query(
                    "UPDATE work_items SET status = 'completed', last_error = NULL, \
                     claimed_by = NULL, updated_at = ? \
                     WHERE external_id = ? AND status = 'in_progress' AND claimed_by = ?",
                )
                .bind(now)
                .bind(id),
                Transition::Skip { reason } => sqlx::query(
                    "UPDATE work_items SET status = 'skipped', last_error = ?, \
                     claimed_by = NULL, updated_at = ? \
                     WHERE external_id = ? AND status = 'in_progress' AND claimed_by = ?",
                )
                .bind(reason)
                .bind(now)
                .bind(id),
                Transition::Fail { kind, message } => sqlx::query(
                    "UPDATE work_items SET status = 'failed', retry_count = retry_count + 1, \
                     last_error = ?, retryable = ?, claimed_by = NULL, last_attempt_at = ?, \
                     updated_at = ? \
                     WHERE external_id = ? AND status = 'in_progress' AND claimed_by = ?",
                )
                .bind(message)
                .bind(kind.is_retryable())
                .bind(now)
                .bind(now)
                .bind(id),
            };
            let applied = query
                .bind(&self.worker_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            if applied == 0 {
                lost.push(id);
                continue;
            }
            match transition {
                Transition::Complete => report.completed += 1,
                Transition::Skip { .. } => report.skipped += 1,
                Transition::Fail { .. } => report.failed += 1,
            }
        }
        tx.commit().await?;

        if !lost.is_empty() {
            warn!(
                worker_id = %self.worker_id,
                ids = ?lost,
                "Claims lost before settle, results discarded"
            );
            report.lost = lost.len() as u64;
        }
        Ok(report)
    }

    /// Move retryable failures back to `pending`.
    ///
    /// Only items with `retry_count < max_retries` whose last attempt is at
    /// least `backoff` old are eligible.
    pub async fn requeue_failed(
        &self,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<u64, StorageError> {
        self.requeue_failed_at(max_retries, backoff, Utc::now()).await
    }

    pub async fn requeue_failed_at(
        &self,
        max_retries: u32,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let now_ms = to_millis(now);
        let cutoff = now_ms - backoff.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE work_items SET status = 'pending', updated_at = ? \
             WHERE status = 'failed' AND retryable = 1 AND retry_count < ? \
             AND (last_attempt_at IS NULL OR last_attempt_at <= ?)",
        )
        .bind(now_ms)
        .bind(i64::from(max_retries))
        .bind(cutoff)
        .execute(self.store.pool())
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            info!(requeued, "Requeued failed items for retry");
        }
        Ok(requeued)
    }

    pub async fn get(&self, id: i64) -> Result<Option<WorkItem>, StorageError> {
        let row: Option<WorkItemRow> =
            sqlx::query_as("SELECT * FROM work_items WHERE external_id = ?")
                .bind(id)
                .fetch_optional(self.store.pool())
                .await?;
        row.map(WorkItem::try_from).transpose()
    }

    pub async fn stats(&self, max_retries: u32) -> Result<QueueStats, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM work_items GROUP BY status")
                .fetch_all(self.store.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<WorkStatus>() {
                Ok(WorkStatus::Pending) => stats.pending = count,
                Ok(WorkStatus::InProgress) => stats.in_progress = count,
                Ok(WorkStatus::Completed) => stats.completed = count,
                Ok(WorkStatus::Failed) => stats.failed = count,
                Ok(WorkStatus::Skipped) => stats.skipped = count,
                Err(_) => warn!(status = %status, count, "Unknown status in work_items"),
            }
        }

        stats.poisoned = sqlx::query_scalar(
            "SELECT COUNT(*) FROM work_items \
             WHERE status = 'failed' AND (retryable = 0 OR retry_count >= ?)",
        )
        .bind(i64::from(max_retries))
        .fetch_one(self.store.pool())
        .await?;

        Ok(stats)
    }

    async fn set_terminal(
        &self,
        ids: &[i64],
        status: WorkStatus,
        reason: Option<&str>,
    ) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = to_millis(Utc::now());
        let mut affected = 0;
        for chunk in ids.chunks(ENQUEUE_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE work_items SET status = ");
            qb.push_bind(status.as_str())
                .push(", last_error = ")
                .push_bind(reason)
                .push(", claimed_by = NULL, updated_at = ")
                .push_bind(now)
                .push(" WHERE status = 'in_progress' AND claimed_by = ")
                .push_bind(&self.worker_id)
                .push(" AND external_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            affected += qb.build().execute(self.store.pool()).await?.rows_affected();
        }
        if affected < ids.len() as u64 {
            warn!(
                worker_id = %self.worker_id,
                requested = ids.len(),
                affected,
                "Some claims were lost before they could be settled"
            );
        }
        Ok(affected)
    }
}

/// Collapse duplicate ids, summing signal counts. Every candidate counts as
/// at least one signal so re-discovery always raises the score.
fn merge_candidates(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut order: Vec<i64> = Vec::new();
    let mut merged: HashMap<i64, Candidate> = HashMap::new();
    for candidate in candidates {
        let signal = candidate.signal_count.max(1);
        merged
            .entry(candidate.external_id)
            .and_modify(|existing| {
                existing.signal_count += signal;
                existing.external_name = candidate.external_name.clone();
            })
            .or_insert_with(|| {
                order.push(candidate.external_id);
                Candidate {
                    signal_count: signal,
                    ..candidate.clone()
                }
            });
    }
    order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::storage::test_support::temp_store;
    use std::collections::HashSet;

    async fn queue() -> (tempfile::TempDir, WorkQueue) {
        let (dir, store) = temp_store().await;
        (dir, WorkQueue::new(store))
    }

    #[test]
    fn test_merge_candidates_sums_signals() {
        let merged = merge_candidates(&[
            Candidate::new(1, "a/x", 2),
            Candidate::new(2, "a/y", 0),
            Candidate::new(1, "a/x2", 3),
        ]);
        assert_eq!(
            merged,
            vec![Candidate::new(1, "a/x2", 5), Candidate::new(2, "a/y", 1)]
        );
    }

    #[tokio::test]
    async fn test_enqueue_is_unique_and_additive() {
        let (_dir, queue) = queue().await;
        queue.enqueue(&[Candidate::new(1, "a/x", 2)]).await.unwrap();
        queue.enqueue(&[Candidate::new(1, "a/x", 3)]).await.unwrap();
        queue.enqueue(&[Candidate::new(1, "a/x", 0)]).await.unwrap();

        let item = queue.get(1).await.unwrap().unwrap();
        assert_eq!(item.activity_score, 6);
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(queue.stats(3).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_resurrect_completed() {
        let (_dir, queue) = queue().await;
        queue.enqueue(&[Candidate::new(1, "a/x", 1)]).await.unwrap();
        queue.claim_batch(1).await.unwrap();
        queue.mark_completed(&[1]).await.unwrap();

        queue.enqueue(&[Candidate::new(1, "a/x", 4)]).await.unwrap();
        let item = queue.get(1).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.activity_score, 5);
    }

    #[tokio::test]
    async fn test_claim_orders_by_activity_score() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue(&[
                Candidate::new(1, "a/low", 1),
                Candidate::new(2, "a/high", 50),
                Candidate::new(3, "a/mid", 10),
            ])
            .await
            .unwrap();

        let claimed = queue.claim_batch(2).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|i| i.external_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(claimed.iter().all(|i| i.status == WorkStatus::InProgress));
        assert!(claimed.iter().all(|i| i.last_attempt_at.is_some()));
        assert!(claimed
            .iter()
            .all(|i| i.claimed_by.as_deref() == Some(queue.worker_id())));

        let rest = queue.claim_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].external_id, 1);
        assert!(queue.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let (_dir, store) = temp_store().await;
        let candidates: Vec<_> = (1..=60).map(|i| Candidate::new(i, format!("o/r{i}"), i)).collect();
        WorkQueue::new(store.clone()).enqueue(&candidates).await.unwrap();

        let handles: Vec<_> = (0..6)
            .map(|n| {
                let queue = WorkQueue::new(store.clone()).with_worker_id(format!("w{n}"));
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    loop {
                        let batch = queue.claim_batch(4).await.unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|i| i.external_id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "id {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 60);
    }

    #[tokio::test]
    async fn test_stale_in_progress_is_reclaimable() {
        let (_dir, store) = temp_store().await;
        let timeout = Duration::from_secs(600);
        let crashed = WorkQueue::new(store.clone()).with_in_progress_timeout(timeout);
        let rescuer = WorkQueue::new(store)
            .with_worker_id("rescuer")
            .with_in_progress_timeout(timeout);

        crashed.enqueue(&[Candidate::new(9, "a/z", 1)]).await.unwrap();
        let start = Utc::now();
        assert_eq!(crashed.claim_batch_at(1, start).await.unwrap().len(), 1);

        let soon = start + chrono::Duration::seconds(60);
        assert!(rescuer.claim_batch_at(1, soon).await.unwrap().is_empty());

        let later = start + chrono::Duration::seconds(601);
        let reclaimed = rescuer.claim_batch_at(1, later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("rescuer"));
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_overwrite_reclaimed_item() {
        let (_dir, store) = temp_store().await;
        let timeout = Duration::from_secs(600);
        let slow = WorkQueue::new(store.clone())
            .with_worker_id("slow")
            .with_in_progress_timeout(timeout);
        let rescuer = WorkQueue::new(store)
            .with_worker_id("rescuer")
            .with_in_progress_timeout(timeout);

        slow.enqueue(&[Candidate::new(1, "a/x", 1)]).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::seconds(700);
        assert_eq!(slow.claim_batch_at(1, long_ago).await.unwrap().len(), 1);

        assert_eq!(rescuer.claim_batch(1).await.unwrap().len(), 1);
        let rescued = rescuer.settle(&[(1, Transition::Complete)]).await.unwrap();
        assert_eq!(rescued.completed, 1);

        let late = slow
            .settle(&[(1, Transition::from_error(&FetchError::Timeout(timeout)))])
            .await
            .unwrap();
        assert_eq!(
            late,
            SettleReport {
                lost: 1,
                ..SettleReport::default()
            }
        );
        assert_eq!(slow.mark_failed(1, ErrorKind::Transient, "late").await.unwrap(), 0);
        assert_eq!(slow.mark_skipped(&[1], "late").await.unwrap(), 0);

        let item = slow.get(1).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.retry_count, 0);
        assert!(item.claimed_by.is_none());

        // Completed stays terminal through the retry path.
        let later = Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(
            rescuer
                .requeue_failed_at(3, Duration::ZERO, later)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_mark_failed_increments_retry_count() {
        let (_dir, queue) = queue().await;
        queue.enqueue(&[Candidate::new(2, "a/y", 1)]).await.unwrap();
        queue.claim_batch(1).await.unwrap();
        queue
            .mark_failed(2, ErrorKind::Transient, "request timed out")
            .await
            .unwrap();

        let item = queue.get(2).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert!(item.retryable);
        assert_eq!(item.last_error.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_settle_applies_each_transition() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue(&[
                Candidate::new(1, "a/ok", 1),
                Candidate::new(2, "a/gone", 1),
                Candidate::new(3, "a/empty", 1),
            ])
            .await
            .unwrap();
        queue.claim_batch(3).await.unwrap();

        let report = queue
            .settle(&[
                (1, Transition::Complete),
                (2, Transition::from_error(&FetchError::NotFound)),
                (
                    3,
                    Transition::Skip {
                        reason: "empty".into(),
                    },
                ),
            ])
            .await
            .unwrap();
        assert_eq!(
            report,
            SettleReport {
                completed: 1,
                failed: 1,
                skipped: 1,
                lost: 0,
            }
        );

        assert_eq!(queue.get(1).await.unwrap().unwrap().status, WorkStatus::Completed);
        let gone = queue.get(2).await.unwrap().unwrap();
        assert_eq!(gone.status, WorkStatus::Failed);
        assert!(!gone.retryable);
        assert_eq!(queue.get(3).await.unwrap().unwrap().status, WorkStatus::Skipped);

        let stats = queue.stats(3).await.unwrap();
        assert_eq!(stats.poisoned, 1);
    }

    #[tokio::test]
    async fn test_requeue_respects_cap_backoff_and_kind() {
        let (_dir, queue) = queue().await;
        queue
            .enqueue(&[Candidate::new(1, "a/t", 1), Candidate::new(2, "a/p", 1)])
            .await
            .unwrap();
        queue.claim_batch(2).await.unwrap();
        queue.mark_failed(1, ErrorKind::Transient, "timeout").await.unwrap();
        queue.mark_failed(2, ErrorKind::Permanent, "not found").await.unwrap();

        let backoff = Duration::from_secs(300);
        let now = Utc::now();
        assert_eq!(queue.requeue_failed_at(3, backoff, now).await.unwrap(), 0);

        let later = now + chrono::Duration::seconds(301);
        assert_eq!(queue.requeue_failed_at(3, backoff, later).await.unwrap(), 1);
        assert_eq!(queue.get(1).await.unwrap().unwrap().status, WorkStatus::Pending);
        assert_eq!(queue.get(2).await.unwrap().unwrap().status, WorkStatus::Failed);

        // Exhaust the budget: a third failure leaves the item poisoned.
        for _ in 0..2 {
            queue.claim_batch(1).await.unwrap();
            queue.mark_failed(1, ErrorKind::Transient, "timeout").await.unwrap();
            let later = Utc::now() + chrono::Duration::seconds(301);
            queue.requeue_failed_at(3, backoff, later).await.unwrap();
        }
        let item = queue.get(1).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.status, WorkStatus::Failed);
        assert!(item.is_poisoned(3));
    }
}
