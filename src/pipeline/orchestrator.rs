//! Pipeline orchestrator.
//!
//! One cycle: requeue eligible failures, claim a batch, enrich it, persist
//! the records, settle every claimed item. Storage errors abort the cycle
//! before settlement, so claimed items stay `in_progress` and are reclaimed
//! once their claim goes stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{
    ArchiveSource, DiscoveryProducer, DiscoveryReport, DiscoverySource, SearchSource,
};
use crate::enrich::EnrichmentPool;
use crate::error::{with_db_timeout, StorageError};
use crate::github::{ArchiveClient, DetailApi, SearchClient};
use crate::metrics::MetricsCollector;
use crate::queue::{SettleReport, SourceQueue, WorkQueue};
use crate::ratelimit::TokenBucket;
use crate::storage::{RecordStore, Store};

use super::config::{ConfigError, PipelineConfig};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was claimable.
    Idle,
    Processed(CycleReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub requeued: u64,
    pub claimed: usize,
    pub records_stored: usize,
    pub settled: SettleReport,
}

/// Lifetime counters for a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cycles: u64,
    pub idle_cycles: u64,
    pub items_settled: u64,
    pub records_stored: u64,
    pub storage_errors: u64,
    pub discovery_runs: u64,
}

#[derive(Debug, Default)]
struct SharedPipelineStats {
    cycles: AtomicU64,
    idle_cycles: AtomicU64,
    items_settled: AtomicU64,
    records_stored: AtomicU64,
    storage_errors: AtomicU64,
    discovery_runs: AtomicU64,
}

impl SharedPipelineStats {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            cycles: self.cycles.load(Ordering::SeqCst),
            idle_cycles: self.idle_cycles.load(Ordering::SeqCst),
            items_settled: self.items_settled.load(Ordering::SeqCst),
            records_stored: self.records_stored.load(Ordering::SeqCst),
            storage_errors: self.storage_errors.load(Ordering::SeqCst),
            discovery_runs: self.discovery_runs.load(Ordering::SeqCst),
        }
    }
}

/// Stops a running pipeline after its in-flight batch.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Clears the discovery flag when a background pass ends, panics included.
struct DiscoveryGuard(Arc<AtomicBool>);

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Build the discovery sources enabled in `config`.
pub fn sources_from_config(config: &PipelineConfig, store: &Store) -> Vec<Arc<dyn DiscoverySource>> {
    let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();
    if config.archive_enabled {
        let client = ArchiveClient::new(Duration::from_secs(120));
        let refs = SourceQueue::new(store.clone()).with_lease(config.in_progress_timeout);
        sources.push(Arc::new(ArchiveSource::new(
            client,
            refs,
            config.archive_lookback_hours,
            config.archive_hours_per_run,
        )));
    }
    if config.search_enabled {
        let client = SearchClient::new(config.github_token.clone(), config.fetch_timeout);
        sources.push(Arc::new(SearchSource::new(
            client,
            config.search_lookback_days,
            config.search_window_days,
            config.search_min_stars,
        )));
    }
    sources
}

pub struct Pipeline {
    config: PipelineConfig,
    queue: WorkQueue,
    records: RecordStore,
    pool: EnrichmentPool,
    discovery: DiscoveryProducer,
    metrics: MetricsCollector,
    stats: Arc<SharedPipelineStats>,
    discovery_running: Arc<AtomicBool>,
    shutdown: ShutdownHandle,
}

impl Pipeline {
    /// Validates `config` and wires the queue, pool and record store.
    pub fn new(
        config: PipelineConfig,
        store: Store,
        api: Arc<dyn DetailApi>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let queue = WorkQueue::new(store.clone()).with_in_progress_timeout(config.in_progress_timeout);
        let limiter = Arc::new(TokenBucket::from_rate_limit(config.rate_limit));
        let pool = EnrichmentPool::new(api, limiter)
            .with_max_concurrency(config.max_concurrency)
            .with_fetch_timeout(config.fetch_timeout)
            .with_permit_timeout(config.permit_timeout);
        let discovery = DiscoveryProducer::new(queue.clone(), config.discovery_flush_size)
            .with_db_timeout(config.db_timeout);
        let (tx, _) = broadcast::channel(1);

        info!(
            worker_id = queue.worker_id(),
            batch_size = config.batch_size,
            max_concurrency = config.max_concurrency,
            "Pipeline initialized"
        );

        Ok(Self {
            records: RecordStore::new(store),
            queue,
            pool,
            discovery,
            metrics: MetricsCollector::new(),
            stats: Arc::new(SharedPipelineStats::default()),
            discovery_running: Arc::new(AtomicBool::new(false)),
            shutdown: ShutdownHandle {
                tx,
                requested: Arc::new(AtomicBool::new(false)),
            },
            config,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = self.discovery.with_source(source);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn DiscoverySource>>) -> Self {
        for source in sources {
            self.discovery = self.discovery.with_source(source);
        }
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run every discovery source once in the foreground.
    pub async fn discover_once(&self) -> DiscoveryReport {
        self.stats.discovery_runs.fetch_add(1, Ordering::SeqCst);
        self.discovery.run_once().await
    }

    /// Execute one claim, enrich, persist, settle cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, PipelineError> {
        let db_timeout = self.config.db_timeout;
        self.stats.cycles.fetch_add(1, Ordering::SeqCst);

        let requeued = with_db_timeout(
            "requeue_failed",
            db_timeout,
            self.queue
                .requeue_failed(self.config.max_retries, self.config.retry_backoff),
        )
        .await?;

        let items = with_db_timeout(
            "claim_batch",
            db_timeout,
            self.queue.claim_batch(self.config.batch_size),
        )
        .await?;
        if items.is_empty() {
            self.stats.idle_cycles.fetch_add(1, Ordering::SeqCst);
            return Ok(CycleOutcome::Idle);
        }
        let claimed = items.len();
        debug!(claimed, "Claimed batch");

        let batch = self.pool.process_batch(items).await;
        let records = batch.records();

        let persisted = match with_db_timeout(
            "store_records",
            db_timeout,
            self.records.store(&records),
        )
        .await
        {
            Ok(report) => report,
            Err(err) => {
                self.stats.storage_errors.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_batch("storage_error", None);
                return Err(err.into());
            }
        };

        let transitions = batch.transitions();
        let settled = match with_db_timeout("settle", db_timeout, self.queue.settle(&transitions)).await
        {
            Ok(report) => report,
            Err(err) => {
                self.stats.storage_errors.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_batch("storage_error", None);
                return Err(err.into());
            }
        };

        for (_, transition) in &transitions {
            self.metrics.record_item(transition.label());
        }
        self.metrics.record_batch("ok", Some(batch.elapsed));
        self.stats.items_settled.fetch_add(
            settled.completed + settled.failed + settled.skipped,
            Ordering::SeqCst,
        );
        self.stats
            .records_stored
            .fetch_add(persisted.records as u64, Ordering::SeqCst);

        info!(
            claimed,
            completed = settled.completed,
            failed = settled.failed,
            skipped = settled.skipped,
            lost = settled.lost,
            elapsed_ms = batch.elapsed.as_millis() as u64,
            "Batch settled"
        );

        Ok(CycleOutcome::Processed(CycleReport {
            requeued,
            claimed,
            records_stored: persisted.records,
            settled,
        }))
    }

    /// Start a background discovery pass unless one is already running.
    fn spawn_discovery(&self) -> Option<JoinHandle<()>> {
        if self.discovery.source_count() == 0 {
            return None;
        }
        if self
            .discovery_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let guard = DiscoveryGuard(self.discovery_running.clone());
        let producer = self.discovery.clone();
        let stats = self.stats.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            stats.discovery_runs.fetch_add(1, Ordering::SeqCst);
            let report = producer.run_once().await;
            info!(
                enqueued = report.total_enqueued(),
                failed_sources = report.failed_sources(),
                "Discovery pass finished"
            );
        }))
    }

    async fn refresh_queue_depth(&self) {
        match with_db_timeout(
            "queue_stats",
            self.config.db_timeout,
            self.queue.stats(self.config.max_retries),
        )
        .await
        {
            Ok(stats) => self.metrics.update_queue_depth(&stats),
            Err(err) => debug!(error = %err, "Could not refresh queue depth"),
        }
    }

    /// Run cycles until shutdown is requested.
    ///
    /// Discovery runs in the background whenever a cycle finds nothing to
    /// claim and otherwise every `discovery_interval`. Shutdown is honored
    /// between cycles, so an in-flight batch is always settled first.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let mut shutdown_rx = self.shutdown.tx.subscribe();
        let mut last_discovery: Option<Instant> = None;
        let mut discovery_task: Option<JoinHandle<()>> = None;

        info!(worker_id = self.queue.worker_id(), "Pipeline started");

        while !self.shutdown.is_requested() {
            let (idle, pause) = match self.run_cycle().await {
                Ok(CycleOutcome::Idle) => (true, Some(self.config.idle_interval)),
                Ok(CycleOutcome::Processed(_)) => (false, None),
                Err(err) => {
                    error!(error = %err, "Cycle failed, backing off");
                    (false, Some(self.config.error_backoff))
                }
            };

            let due = last_discovery
                .map_or(true, |at| at.elapsed() >= self.config.discovery_interval);
            if idle || due {
                if let Some(handle) = self.spawn_discovery() {
                    discovery_task = Some(handle);
                    last_discovery = Some(Instant::now());
                }
            }

            self.refresh_queue_depth().await;

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        if let Some(mut handle) = discovery_task {
            if !handle.is_finished() {
                info!("Waiting for background discovery to finish");
                if tokio::time::timeout(self.config.db_timeout, &mut handle)
                    .await
                    .is_err()
                {
                    warn!("Background discovery did not finish in time, aborting");
                    handle.abort();
                }
            }
        }

        info!(stats = ?self.stats(), "Pipeline stopped");
        Ok(())
    }
}
