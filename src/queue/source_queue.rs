//! Secondary queue of source references (archive files, search pages).
//!
//! Same claim discipline as the work queue with a binary `done` flag. A
//! claim stamps `claimed_at`; a reference whose claim is older than the
//! lease is treated as unclaimed again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use super::types::{SourceReference, SourceReferenceRow};
use crate::error::StorageError;
use crate::storage::{to_millis, Store};

const CHUNK: usize = 500;

#[derive(Clone, Debug)]
pub struct SourceQueue {
    store: Store,
    lease: Duration,
}

impl SourceQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            lease: Duration::from_secs(600),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Register locators. Existing ones are left as they are.
    ///
    /// `created_at` is offset by one millisecond per position so that claim
    /// order and [`SourceQueue::latest_locator`] follow the input order.
    pub async fn enqueue_locators(&self, locators: &[String]) -> Result<u64, StorageError> {
        if locators.is_empty() {
            return Ok(0);
        }
        let now = to_millis(Utc::now());
        let mut inserted = 0;

        let mut tx = self.store.pool().begin().await?;
        for (chunk_index, chunk) in locators.chunks(CHUNK).enumerate() {
            let base = now + (chunk_index * CHUNK) as i64;
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO source_refs (locator, done, created_at) ");
            qb.push_values(chunk.iter().enumerate(), |mut row, (i, locator)| {
                row.push_bind(locator).push_bind(false).push_bind(base + i as i64);
            });
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(inserted, "Registered source references");
        Ok(inserted)
    }

    /// Claim up to `limit` undone references, oldest first.
    pub async fn claim(&self, limit: usize) -> Result<Vec<SourceReference>, StorageError> {
        self.claim_at(limit, Utc::now()).await
    }

    pub async fn claim_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceReference>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_millis(now);
        let stale_before = now_ms - self.lease.as_millis() as i64;

        let rows: Vec<SourceReferenceRow> = sqlx::query_as(
            r#"
            UPDATE source_refs SET claimed_at = ?1
            WHERE locator IN (
                SELECT locator FROM source_refs
                WHERE done = 0 AND (claimed_at IS NULL OR claimed_at < ?2)
                ORDER BY created_at, locator
                LIMIT ?3
            )
            RETURNING locator, done, scraped_at, created_at
            "#,
        )
        .bind(now_ms)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(self.store.pool())
        .await?;

        let mut refs = rows
            .into_iter()
            .map(SourceReference::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        refs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.locator.cmp(&b.locator))
        });
        Ok(refs)
    }

    /// Give a claimed reference back without marking it done.
    pub async fn release(&self, locator: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE source_refs SET claimed_at = NULL WHERE locator = ?")
            .bind(locator)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_done(&self, locators: &[String]) -> Result<u64, StorageError> {
        if locators.is_empty() {
            return Ok(0);
        }
        let now = to_millis(Utc::now());
        let mut affected = 0;
        for chunk in locators.chunks(CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE source_refs SET done = 1, claimed_at = NULL, scraped_at = ");
            qb.push_bind(now).push(" WHERE locator IN (");
            let mut separated = qb.separated(", ");
            for locator in chunk {
                separated.push_bind(locator);
            }
            separated.push_unseparated(")");
            affected += qb.build().execute(self.store.pool()).await?.rows_affected();
        }
        Ok(affected)
    }

    pub async fn remaining(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM source_refs WHERE done = 0")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }

    /// The most recently registered locator, used to resume generation.
    pub async fn latest_locator(&self) -> Result<Option<String>, StorageError> {
        let locator = sqlx::query_scalar(
            "SELECT locator FROM source_refs ORDER BY created_at DESC, locator DESC LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?;
        Ok(locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_store;

    fn locators(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_ignores_duplicates() {
        let (_dir, store) = temp_store().await;
        let queue = SourceQueue::new(store);
        assert_eq!(queue.enqueue_locators(&locators(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(queue.enqueue_locators(&locators(&["b", "c"])).await.unwrap(), 1);
        assert_eq!(queue.remaining().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_then_done() {
        let (_dir, store) = temp_store().await;
        let queue = SourceQueue::new(store);
        queue.enqueue_locators(&locators(&["a", "b", "c"])).await.unwrap();

        let first = queue.claim(2).await.unwrap();
        let names: Vec<_> = first.iter().map(|r| r.locator.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // Claimed references are not handed out twice.
        let second = queue.claim(5).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].locator, "c");

        queue.mark_done(&locators(&["a", "b"])).await.unwrap();
        queue.release("c").await.unwrap();
        assert_eq!(queue.remaining().await.unwrap(), 1);

        let again = queue.claim(5).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].locator, "c");
        assert!(!again[0].done);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (_dir, store) = temp_store().await;
        let queue = SourceQueue::new(store).with_lease(Duration::from_secs(60));
        queue.enqueue_locators(&locators(&["a"])).await.unwrap();

        let now = Utc::now();
        assert_eq!(queue.claim_at(1, now).await.unwrap().len(), 1);
        assert!(queue.claim_at(1, now).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(queue.claim_at(1, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_locator_follows_input_order() {
        let (_dir, store) = temp_store().await;
        let queue = SourceQueue::new(store);
        assert!(queue.latest_locator().await.unwrap().is_none());

        queue
            .enqueue_locators(&locators(&["2024-06-01-9", "2024-06-01-10", "2024-06-01-11"]))
            .await
            .unwrap();
        assert_eq!(
            queue.latest_locator().await.unwrap().as_deref(),
            Some("2024-06-01-11")
        );

        let claimed = queue.claim(2).await.unwrap();
        assert_eq!(claimed[0].locator, "2024-06-01-9");
        assert_eq!(claimed[1].locator, "2024-06-01-10");
    }
}
