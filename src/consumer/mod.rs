//! Consumer side of the pipeline.
//!
//! - `ConsumerGroupManager`: member tasks, range assignment, cooperative rebalance
//! - `RecordPipeline`: decode, classify, persist, hand off per record
//! - `OffsetTracker` / `PartitionCursor`: persist-then-commit bookkeeping
//! - `BackpressureGate`: pauses pulling while downstream work piles up
//! - `PipelineHealth`: which partitions are halted and why

mod assignment;
mod backpressure;
mod health;
mod manager;
mod offsets;
mod pipeline;
mod stats;

pub use assignment::{Assignment, MemberId, PartitionMove};
pub use backpressure::{BackpressureGate, DepthGuard};
pub use health::{HaltedPartition, PartitionStatus, PipelineHealth, PipelineHealthSnapshot};
pub use manager::{ConsumerGroupConfig, ConsumerGroupManager, RebalanceSummary};
pub use offsets::{ConsumerOffset, OffsetTracker, PartitionCursor};
pub use pipeline::{upsert_retry_policy, PipelineError, RecordOutcome, RecordPipeline};
pub use stats::{ConsumerStats, ConsumerStatsSnapshot};
