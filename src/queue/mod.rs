//! Durable queues driving the pipeline.
//!
//! - [`WorkQueue`]: discovered repositories awaiting enrichment, with the
//!   `pending -> in_progress -> completed | failed | skipped` state machine,
//!   retry bookkeeping and stale-claim recovery.
//! - [`SourceQueue`]: source references (archive hours) awaiting harvest.
//! - [`Transition`]: the single mapping from a per-item result to a status
//!   change.

pub mod source_queue;
pub mod transition;
pub mod types;
pub mod work_queue;

pub use source_queue::SourceQueue;
pub use transition::Transition;
pub use types::{Candidate, QueueStats, SourceReference, WorkItem, WorkStatus};
pub use work_queue::{SettleReport, WorkQueue};
