//! Per-partition health signal.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::broker::TopicPartition;
use crate::metrics::ConsumerMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStatus {
    Running,
    /// Stopped at the first record that could not be persisted
    Halted {
        reason: String,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct HaltedPartition {
    pub topic: String,
    pub partition: u32,
    pub reason: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealthSnapshot {
    /// `healthy` or `degraded`
    pub status: &'static str,
    pub assigned_partitions: usize,
    pub halted: Vec<HaltedPartition>,
}

#[derive(Default)]
pub struct PipelineHealth {
    partitions: DashMap<TopicPartition, PartitionStatus>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, tp: &TopicPartition) {
        let previous = self.partitions.insert(tp.clone(), PartitionStatus::Running);
        if matches!(previous, Some(PartitionStatus::Halted { .. })) {
            ConsumerMetrics::partition_resumed();
            tracing::info!(topic_partition = %tp, "Partition resumed");
        }
    }

    pub fn set_halted(&self, tp: &TopicPartition, reason: impl Into<String>) {
        let reason = reason.into();
        let previous = self.partitions.insert(
            tp.clone(),
            PartitionStatus::Halted {
                reason: reason.clone(),
                since: Utc::now(),
            },
        );
        match previous {
            // Keep the original halt time across repeated failures
            Some(PartitionStatus::Halted { since, .. }) => {
                self.partitions
                    .insert(tp.clone(), PartitionStatus::Halted { reason, since });
            }
            _ => {
                ConsumerMetrics::partition_halted();
                tracing::error!(topic_partition = %tp, reason = %reason, "Partition halted");
            }
        }
    }

    /// Forget a partition that was revoked from this process.
    pub fn remove(&self, tp: &TopicPartition) {
        if let Some((_, PartitionStatus::Halted { .. })) = self.partitions.remove(tp) {
            ConsumerMetrics::partition_resumed();
        }
    }

    pub fn status(&self, tp: &TopicPartition) -> Option<PartitionStatus> {
        self.partitions.get(tp).map(|s| s.clone())
    }

    pub fn is_healthy(&self) -> bool {
        self.partitions
            .iter()
            .all(|entry| *entry.value() == PartitionStatus::Running)
    }

    pub fn snapshot(&self) -> PipelineHealthSnapshot {
        let mut halted: Vec<HaltedPartition> = self
            .partitions
            .iter()
            .filter_map(|entry| match entry.value() {
                PartitionStatus::Halted { reason, since } => Some(HaltedPartition {
                    topic: entry.key().topic.clone(),
                    partition: entry.key().partition,
                    reason: reason.clone(),
                    since: *since,
                }),
                PartitionStatus::Running => None,
            })
            .collect();
        halted.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        PipelineHealthSnapshot {
            status: if halted.is_empty() { "healthy" } else { "degraded" },
            assigned_partitions: self.partitions.len(),
            halted,
        }
    }
}
