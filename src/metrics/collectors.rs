//! Recording helpers for pipeline metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus statics. Every method is a
//! no-op until `init_metrics()` has run, so library code records freely and
//! tests never need a registry.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_FETCHES, BATCHES_TOTAL, BATCH_DURATION, CACHE_LOOKUPS, CANDIDATES_DISCOVERED,
    FETCH_LATENCY, ITEMS_TOTAL, PERMIT_WAIT, QUEUE_DEPTH,
};
use crate::queue::{QueueStats, WorkStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the resolution of one work item.
    pub fn record_item(&self, outcome: &str) {
        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&[outcome]).inc();
        }
        tracing::trace!(outcome = outcome, "Recorded item metric");
    }

    /// Record one enrichment cycle.
    ///
    /// # Arguments
    ///
    /// * `result` - "processed", "idle" or "persist_failed"
    /// * `duration` - wall time of the cycle; idle cycles are not timed
    pub fn record_batch(&self, result: &str, duration: Option<Duration>) {
        if let Some(batches) = BATCHES_TOTAL.get() {
            batches.with_label_values(&[result]).inc();
        }
        if let (Some(hist), Some(duration)) = (BATCH_DURATION.get(), duration) {
            hist.observe(duration.as_secs_f64());
        }
    }

    pub fn record_fetch_latency(&self, latency: Duration) {
        if let Some(hist) = FETCH_LATENCY.get() {
            hist.observe(latency.as_secs_f64());
        }
    }

    pub fn record_permit_wait(&self, wait: Duration) {
        if let Some(hist) = PERMIT_WAIT.get() {
            hist.observe(wait.as_secs_f64());
        }
    }

    pub fn record_discovered(&self, source: &str, count: usize) {
        if let Some(discovered) = CANDIDATES_DISCOVERED.get() {
            discovered.with_label_values(&[source]).inc_by(count as f64);
        }
        tracing::trace!(source = source, count = count, "Recorded discovery metric");
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if let Some(lookups) = CACHE_LOOKUPS.get() {
            let result = if hit { "hit" } else { "miss" };
            lookups.with_label_values(&[result]).inc();
        }
    }

    /// Publish the per-status queue gauges.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            for status in WorkStatus::ALL {
                depth
                    .with_label_values(&[status.as_str()])
                    .set(stats.count(status) as f64);
            }
        }
    }

    pub fn inc_active_fetches(&self) {
        if let Some(active) = ACTIVE_FETCHES.get() {
            active.inc();
        }
    }

    pub fn dec_active_fetches(&self) {
        if let Some(active) = ACTIVE_FETCHES.get() {
            active.dec();
        }
    }
}
