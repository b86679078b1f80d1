//! Discovery producer.
//!
//! Sources push [`Candidate`]s into a [`CandidateSink`], which buffers them
//! and enqueues in bulk. The producer runs every configured source once per
//! pass; a failing source is logged and the remaining sources still run.

mod archive;
mod search;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{with_db_timeout, FetchError, StorageError};
use crate::metrics::MetricsCollector;
use crate::queue::{Candidate, WorkQueue};

pub use archive::ArchiveSource;
pub use search::SearchSource;

const DEFAULT_DB_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Source error: {0}")]
    Source(String),
}

/// A place candidates come from.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Harvest one pass worth of candidates into `sink`.
    async fn discover(&self, sink: &mut CandidateSink) -> Result<(), DiscoveryError>;
}

/// Buffers candidates and enqueues them every `flush_size` entries.
pub struct CandidateSink {
    queue: WorkQueue,
    buffer: Vec<Candidate>,
    flush_size: usize,
    enqueued: usize,
    db_timeout: Duration,
}

impl CandidateSink {
    pub fn new(queue: WorkQueue, flush_size: usize) -> Self {
        let flush_size = flush_size.max(1);
        Self {
            queue,
            buffer: Vec::with_capacity(flush_size),
            flush_size,
            enqueued: 0,
            db_timeout: DEFAULT_DB_TIMEOUT,
        }
    }

    pub fn with_db_timeout(mut self, timeout: Duration) -> Self {
        self.db_timeout = timeout;
        self
    }

    /// Bound for every storage call made during this pass. Sources apply it
    /// to their own bookkeeping writes too.
    pub fn db_timeout(&self) -> Duration {
        self.db_timeout
    }

    pub async fn push(&mut self, candidate: Candidate) -> Result<(), StorageError> {
        self.buffer.push(candidate);
        if self.buffer.len() >= self.flush_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn extend(
        &mut self,
        candidates: impl IntoIterator<Item = Candidate>,
    ) -> Result<(), StorageError> {
        for candidate in candidates {
            self.push(candidate).await?;
        }
        Ok(())
    }

    /// Enqueue whatever is buffered. Sources call this before marking a
    /// source reference done so a crash never loses acknowledged work.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.enqueued +=
            with_db_timeout("enqueue", self.db_timeout, self.queue.enqueue(&self.buffer)).await?;
        self.buffer.clear();
        Ok(())
    }

    /// Distinct ids written per flush, summed.
    pub fn enqueued(&self) -> usize {
        self.enqueued
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Outcome of one source in a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: &'static str,
    pub enqueued: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub sources: Vec<SourceReport>,
}

impl DiscoveryReport {
    pub fn total_enqueued(&self) -> usize {
        self.sources.iter().map(|s| s.enqueued).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

#[derive(Clone)]
pub struct DiscoveryProducer {
    queue: WorkQueue,
    sources: Vec<Arc<dyn DiscoverySource>>,
    flush_size: usize,
    db_timeout: Duration,
    metrics: MetricsCollector,
}

impl DiscoveryProducer {
    pub fn new(queue: WorkQueue, flush_size: usize) -> Self {
        Self {
            queue,
            sources: Vec::new(),
            flush_size,
            db_timeout: DEFAULT_DB_TIMEOUT,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_db_timeout(mut self, timeout: Duration) -> Self {
        self.db_timeout = timeout;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Run every source once.
    ///
    /// Candidates a failing source buffered before the failure are still
    /// enqueued.
    pub async fn run_once(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for source in &self.sources {
            let started = Instant::now();
            let mut sink = CandidateSink::new(self.queue.clone(), self.flush_size)
                .with_db_timeout(self.db_timeout);
            let mut error = source.discover(&mut sink).await.err().map(|e| e.to_string());
            if let Err(e) = sink.flush().await {
                error.get_or_insert_with(|| e.to_string());
            }

            let enqueued = sink.enqueued();
            self.metrics.record_discovered(source.name(), enqueued);
            match &error {
                None => info!(
                    source = source.name(),
                    enqueued,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Discovery source finished"
                ),
                Some(err) => warn!(
                    source = source.name(),
                    enqueued,
                    error = %err,
                    "Discovery source failed"
                ),
            }

            report.sources.push(SourceReport {
                source: source.name(),
                enqueued,
                error,
            });
        }

        report
    }
}
