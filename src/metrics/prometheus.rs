//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by repo-scout and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all repo-scout metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Work items resolved, labeled by outcome (completed, skipped, failed_*).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Enrichment cycles, labeled by result (processed, idle, persist_failed).
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time of one claim-fetch-persist cycle in seconds.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Detail API latency in seconds.
pub static FETCH_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Time spent waiting for a rate-limiter permit in seconds.
pub static PERMIT_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Candidates handed to the work queue, labeled by discovery source.
pub static CANDIDATES_DISCOVERED: OnceLock<CounterVec> = OnceLock::new();

/// Query cache lookups, labeled by result (hit, miss).
pub static CACHE_LOOKUPS: OnceLock<CounterVec> = OnceLock::new();

/// Work items per status.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Detail requests currently in flight.
pub static ACTIVE_FETCHES: OnceLock<Gauge> = OnceLock::new();

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("repo_scout_items_total", "Work items resolved by outcome"),
        &["outcome"],
    )?;

    let batches_total = CounterVec::new(
        Opts::new("repo_scout_batches_total", "Enrichment cycles by result"),
        &["result"],
    )?;

    let batch_duration = Histogram::with_opts(
        HistogramOpts::new(
            "repo_scout_batch_duration_seconds",
            "Duration of one claim-fetch-persist cycle",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let fetch_latency = Histogram::with_opts(
        HistogramOpts::new(
            "repo_scout_fetch_latency_seconds",
            "Detail API request latency",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )?;

    let permit_wait = Histogram::with_opts(
        HistogramOpts::new(
            "repo_scout_permit_wait_seconds",
            "Time spent waiting for a rate-limiter permit",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0]),
    )?;

    let candidates_discovered = CounterVec::new(
        Opts::new(
            "repo_scout_candidates_discovered_total",
            "Candidates enqueued by discovery source",
        ),
        &["source"],
    )?;

    let cache_lookups = CounterVec::new(
        Opts::new("repo_scout_cache_lookups_total", "Query cache lookups"),
        &["result"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("repo_scout_queue_depth", "Work items per status"),
        &["status"],
    )?;

    let active_fetches = Gauge::new(
        "repo_scout_active_fetches",
        "Detail requests currently in flight",
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;
    registry.register(Box::new(fetch_latency.clone()))?;
    registry.register(Box::new(permit_wait.clone()))?;
    registry.register(Box::new(candidates_discovered.clone()))?;
    registry.register(Box::new(cache_lookups.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_fetches.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = BATCH_DURATION.set(batch_duration);
    let _ = FETCH_LATENCY.set(fetch_latency);
    let _ = PERMIT_WAIT.set(permit_wait);
    let _ = CANDIDATES_DISCOVERED.set(candidates_discovered);
    let _ = CACHE_LOOKUPS.set(cache_lookups);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_FETCHES.set(active_fetches);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&["completed"]).inc();
        }
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("repo_scout_items_total"));
    }
}
