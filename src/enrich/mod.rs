//! Bounded-concurrency enrichment of claimed work items.
//!
//! Every item in a batch resolves to exactly one [`ItemResult`]: a record,
//! an explicit "no data", or a classified [`FetchError`]. One item failing
//! never affects its siblings. At most `max_concurrency` detail requests are
//! in flight and each one takes a rate-limiter permit first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::github::{parse_repository, split_full_name, DetailApi};
use crate::metrics::MetricsCollector;
use crate::queue::{Transition, WorkItem};
use crate::ratelimit::TokenBucket;
use crate::storage::EnrichedRecord;

/// The resolution of one claimed item.
#[derive(Debug)]
pub struct ItemResult {
    pub item: WorkItem,
    pub outcome: Result<Option<EnrichedRecord>, FetchError>,
}

impl ItemResult {
    pub fn transition(&self) -> Transition {
        Transition::from_outcome(&self.outcome)
    }
}

/// Results for a whole batch, in completion order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<ItemResult>,
    pub elapsed: Duration,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Successfully enriched records, ready for bulk persistence.
    pub fn records(&self) -> Vec<EnrichedRecord> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().and_then(|o| o.clone()))
            .collect()
    }

    pub fn transitions(&self) -> Vec<(i64, Transition)> {
        self.results
            .iter()
            .map(|r| (r.item.external_id, r.transition()))
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_err()).count()
    }
}

/// Lifetime counters for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub items_enriched: u64,
    pub items_empty: u64,
    pub items_failed: u64,
    pub active_fetches: u64,
}

#[derive(Debug, Default)]
struct SharedPoolStats {
    items_enriched: AtomicU64,
    items_empty: AtomicU64,
    items_failed: AtomicU64,
    active_fetches: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &Result<Option<EnrichedRecord>, FetchError>) {
        let counter = match outcome {
            Ok(Some(_)) => &self.items_enriched,
            Ok(None) => &self.items_empty,
            Err(_) => &self.items_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_fetches.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_fetches.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            items_enriched: self.items_enriched.load(Ordering::SeqCst),
            items_empty: self.items_empty.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
            active_fetches: self.active_fetches.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the active-fetch gauges when a fetch finishes or is dropped.
struct ActiveFetch<'a> {
    stats: &'a SharedPoolStats,
    metrics: MetricsCollector,
}

impl<'a> ActiveFetch<'a> {
    fn start(stats: &'a SharedPoolStats, metrics: MetricsCollector) -> Self {
        stats.increment_active();
        metrics.inc_active_fetches();
        Self { stats, metrics }
    }
}

impl Drop for ActiveFetch<'_> {
    fn drop(&mut self) {
        self.stats.decrement_active();
        self.metrics.dec_active_fetches();
    }
}

#[derive(Clone)]
pub struct EnrichmentPool {
    api: Arc<dyn DetailApi>,
    limiter: Arc<TokenBucket>,
    max_concurrency: usize,
    fetch_timeout: Duration,
    permit_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl EnrichmentPool {
    pub fn new(api: Arc<dyn DetailApi>, limiter: Arc<TokenBucket>) -> Self {
        Self {
            api,
            limiter,
            max_concurrency: 10,
            fetch_timeout: Duration::from_secs(30),
            permit_timeout: Duration::from_secs(120),
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_permit_timeout(mut self, timeout: Duration) -> Self {
        self.permit_timeout = timeout;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Enrich every item, at most `max_concurrency` at a time.
    pub async fn process_batch(&self, items: Vec<WorkItem>) -> BatchOutcome {
        let started = Instant::now();
        let results: Vec<ItemResult> = stream::iter(items)
            .map(|item| async move {
                let outcome = self.enrich(&item).await;
                self.stats.record(&outcome);
                ItemResult { item, outcome }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        BatchOutcome {
            results,
            elapsed: started.elapsed(),
        }
    }

    async fn enrich(&self, item: &WorkItem) -> Result<Option<EnrichedRecord>, FetchError> {
        // Malformed names fail before they cost a permit.
        let (owner, name) = split_full_name(&item.external_name)?;

        let waited = Instant::now();
        self.limiter
            .acquire(1, self.permit_timeout)
            .await
            .map_err(|_| FetchError::PermitTimeout)?;
        self.metrics.record_permit_wait(waited.elapsed());

        let payload = {
            let _active = ActiveFetch::start(&self.stats, self.metrics);
            let fetch_started = Instant::now();
            let response =
                tokio::time::timeout(self.fetch_timeout, self.api.fetch_detail(owner, name)).await;
            self.metrics.record_fetch_latency(fetch_started.elapsed());
            response.map_err(|_| FetchError::Timeout(self.fetch_timeout))??
        };

        match parse_repository(item.external_id, &item.external_name, &payload) {
            Ok(Some(mut record)) => {
                record.activity_score = item.activity_score;
                Ok(Some(record))
            }
            Ok(None) => {
                debug!(external_id = item.external_id, "Detail response carried no repository");
                Ok(None)
            }
            Err(err) => {
                warn!(
                    external_id = item.external_id,
                    external_name = %item.external_name,
                    error = %err,
                    "Unexpected detail response shape"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::queue::WorkStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    enum Reply {
        Detail(Value),
        Fail(fn() -> FetchError),
        Hang,
    }

    struct FakeApi {
        replies: HashMap<String, Reply>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeApi {
        fn new(replies: Vec<(&str, Reply)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DetailApi for FakeApi {
        async fn fetch_detail(&self, owner: &str, name: &str) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.replies.get(&format!("{owner}/{name}")) {
                Some(Reply::Detail(v)) => Ok(v.clone()),
                Some(Reply::Fail(make)) => Err(make()),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(FetchError::Transport("unreachable".to_string()))
                }
                None => Ok(json!({ "data": { "repository": null } })),
            }
        }
    }

    fn item(id: i64, name: &str, score: i64) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            external_id: id,
            external_name: name.to_string(),
            status: WorkStatus::InProgress,
            activity_score: score,
            retry_count: 0,
            retryable: true,
            last_error: None,
            claimed_by: Some("test".to_string()),
            discovered_at: now,
            updated_at: now,
            last_attempt_at: None,
        }
    }

    fn detail(stars: i64) -> Value {
        json!({ "data": { "repository": {
            "stargazerCount": stars,
            "forkCount": 1,
            "languages": { "edges": [{ "size": 100, "node": { "name": "Go" } }] }
        } } })
    }

    fn pool(api: Arc<FakeApi>, concurrency: usize) -> EnrichmentPool {
        EnrichmentPool::new(api, Arc::new(TokenBucket::new(100, 100.0)))
            .with_max_concurrency(concurrency)
            .with_fetch_timeout(Duration::from_millis(200))
            .with_permit_timeout(Duration::from_millis(200))
    }

    fn result_for(outcome: &BatchOutcome, id: i64) -> &ItemResult {
        outcome
            .results
            .iter()
            .find(|r| r.item.external_id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let api = Arc::new(FakeApi::new(vec![
            ("a/ok", Reply::Detail(detail(5))),
            ("a/gone", Reply::Fail(|| FetchError::NotFound)),
            ("a/bad", Reply::Detail(json!({ "data": { "repository": { "forkCount": 1 } } }))),
        ]));
        let outcome = pool(api, 4)
            .process_batch(vec![
                item(1, "a/ok", 7),
                item(2, "a/gone", 1),
                item(3, "a/bad", 1),
                item(4, "a/empty", 1),
            ])
            .await;

        assert_eq!(outcome.len(), 4);
        assert_eq!(outcome.failed(), 2);

        let records = outcome.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, 1);
        assert_eq!(records[0].stars, 5);
        assert_eq!(records[0].activity_score, 7);

        assert_eq!(result_for(&outcome, 1).transition(), Transition::Complete);
        assert_eq!(
            result_for(&outcome, 2).transition().target_status(),
            WorkStatus::Failed
        );
        assert!(matches!(
            result_for(&outcome, 3).outcome,
            Err(FetchError::Parse(_))
        ));
        assert_eq!(
            result_for(&outcome, 4).transition().target_status(),
            WorkStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_invalid_name_consumes_no_permit() {
        let api = Arc::new(FakeApi::new(vec![]));
        let limiter = Arc::new(TokenBucket::new(1, 0.001));
        let pool = EnrichmentPool::new(api.clone(), limiter.clone())
            .with_permit_timeout(Duration::from_millis(50));

        let outcome = pool
            .process_batch(vec![item(1, "not a repo", 1), item(2, "a/x", 1)])
            .await;

        assert!(matches!(
            result_for(&outcome, 1).outcome,
            Err(FetchError::InvalidIdentifier(_))
        ));
        assert_eq!(
            result_for(&outcome, 1).transition(),
            Transition::Fail {
                kind: ErrorKind::Permanent,
                message: "invalid repository identifier 'not a repo'".to_string(),
            }
        );
        // The single permit went to the valid item.
        assert!(result_for(&outcome, 2).outcome.is_ok());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let api = Arc::new(FakeApi::new(vec![
            ("a/x", Reply::Detail(detail(1))),
            ("a/y", Reply::Hang),
        ]));
        let pool = pool(api, 2);
        let outcome = pool
            .process_batch(vec![item(1, "a/x", 1), item(2, "a/y", 1)])
            .await;

        let hung = result_for(&outcome, 2);
        assert!(matches!(hung.outcome, Err(FetchError::Timeout(_))));
        assert!(hung.transition().retryable());
        assert!(result_for(&outcome, 1).outcome.is_ok());

        let stats = pool.stats();
        assert_eq!(stats.items_enriched, 1);
        assert_eq!(stats.items_failed, 1);
        assert_eq!(stats.active_fetches, 0);
    }

    #[tokio::test]
    async fn test_permit_timeout() {
        let api = Arc::new(FakeApi::new(vec![]));
        let limiter = Arc::new(TokenBucket::new(1, 0.001));
        assert!(limiter.try_acquire(1));
        let pool = EnrichmentPool::new(api.clone(), limiter)
            .with_permit_timeout(Duration::from_millis(30));

        let outcome = pool.process_batch(vec![item(1, "a/x", 1)]).await;
        assert!(matches!(
            result_for(&outcome, 1).outcome,
            Err(FetchError::PermitTimeout)
        ));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let api = Arc::new(FakeApi::new(vec![]));
        let items = (1..=12).map(|i| item(i, "a/x", 1)).collect();
        let outcome = pool(api.clone(), 3).process_batch(items).await;

        assert_eq!(outcome.len(), 12);
        assert!(api.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(api.calls.load(Ordering::SeqCst), 12);
    }
}
