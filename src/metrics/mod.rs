//! Prometheus metrics for the discovery and enrichment pipeline.
//!
//! # Example
//!
//! ```ignore
//! use repo_scout::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_item("completed");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_FETCHES, BATCHES_TOTAL, BATCH_DURATION, CACHE_LOOKUPS, CANDIDATES_DISCOVERED,
    FETCH_LATENCY, ITEMS_TOTAL, PERMIT_WAIT, QUEUE_DEPTH, REGISTRY,
};
