//! Per-partition offset bookkeeping.
//!
//! A [`PartitionCursor`] tracks how far a member has processed a partition
//! and what it last committed. The committed offset only moves after the
//! records up to it were persisted, skipped, or dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::broker::{with_timeout, Broker, BrokerError, Offset, TopicPartition};
use crate::metrics::ConsumerMetrics;

/// Committed position of a consumer group on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOffset {
    pub topic: String,
    pub partition: u32,
    pub committed_offset: Option<Offset>,
}

#[derive(Debug, Clone)]
pub struct PartitionCursor {
    topic_partition: TopicPartition,
    committed: Option<Offset>,
    processed: Option<Offset>,
}

impl PartitionCursor {
    pub fn new(topic_partition: TopicPartition, committed: Option<Offset>) -> Self {
        Self {
            topic_partition,
            committed,
            processed: committed,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn committed(&self) -> Option<Offset> {
        self.committed
    }

    /// Where the next fetch starts (exclusive).
    pub fn position(&self) -> Option<Offset> {
        self.processed
    }

    /// Record that everything up to `offset` is done. Never moves backwards.
    pub fn mark_processed(&mut self, offset: Offset) {
        if self.processed.map_or(true, |p| offset > p) {
            self.processed = Some(offset);
        }
    }

    /// Offset to commit, if processing moved past the last commit.
    pub fn commit_candidate(&self) -> Option<Offset> {
        match (self.processed, self.committed) {
            (Some(p), Some(c)) if p > c => Some(p),
            (Some(p), None) => Some(p),
            _ => None,
        }
    }

    pub fn on_committed(&mut self, offset: Offset) {
        if self.committed.map_or(true, |c| offset > c) {
            self.committed = Some(offset);
        }
    }

    /// Forget uncommitted progress so the next fetch replays from the commit.
    pub fn rewind(&mut self) {
        self.processed = self.committed;
    }

    pub fn to_offset(&self) -> ConsumerOffset {
        ConsumerOffset {
            topic: self.topic_partition.topic.clone(),
            partition: self.topic_partition.partition,
            committed_offset: self.committed,
        }
    }
}

/// Loads and commits group offsets through the broker.
#[derive(Clone)]
pub struct OffsetTracker {
    broker: Arc<dyn Broker>,
    group: String,
    timeout: Duration,
}

impl OffsetTracker {
    pub fn new(broker: Arc<dyn Broker>, group: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker,
            group: group.into(),
            timeout,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Cursor positioned at the group's committed offset.
    pub async fn load(&self, tp: &TopicPartition) -> Result<PartitionCursor, BrokerError> {
        let committed = with_timeout(self.timeout, self.broker.committed(&self.group, tp)).await?;
        Ok(PartitionCursor::new(tp.clone(), committed))
    }

    /// Commit the cursor's processed offset. Returns whether anything moved.
    pub async fn commit(&self, cursor: &mut PartitionCursor) -> Result<bool, BrokerError> {
        let Some(offset) = cursor.commit_candidate() else {
            return Ok(false);
        };

        with_timeout(
            self.timeout,
            self.broker.commit(&self.group, cursor.topic_partition(), offset),
        )
        .await?;
        cursor.on_committed(offset);
        ConsumerMetrics::record_commit();
        tracing::trace!(topic_partition = %cursor.topic_partition(), offset = %offset, "Offset committed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn tp() -> TopicPartition {
        TopicPartition::new("notifications.user", 0)
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut cursor = PartitionCursor::new(tp(), None);
        assert_eq!(cursor.commit_candidate(), None);

        cursor.mark_processed(Offset::new(0, 3));
        cursor.mark_processed(Offset::new(0, 1));
        assert_eq!(cursor.position(), Some(Offset::new(0, 3)));
        assert_eq!(cursor.commit_candidate(), Some(Offset::new(0, 3)));

        cursor.on_committed(Offset::new(0, 3));
        assert_eq!(cursor.commit_candidate(), None);
        cursor.on_committed(Offset::new(0, 2));
        assert_eq!(cursor.committed(), Some(Offset::new(0, 3)));
    }

    #[test]
    fn test_rewind_returns_to_commit() {
        let mut cursor = PartitionCursor::new(tp(), Some(Offset::new(0, 4)));
        cursor.mark_processed(Offset::new(0, 9));
        cursor.rewind();
        assert_eq!(cursor.position(), Some(Offset::new(0, 4)));
        assert_eq!(cursor.to_offset().committed_offset, Some(Offset::new(0, 4)));
    }

    #[tokio::test]
    async fn test_tracker_round_trip() {
        let broker = Arc::new(MemoryBroker::new(1));
        let tracker = OffsetTracker::new(broker.clone(), "group-a", Duration::from_secs(1));

        let mut cursor = tracker.load(&tp()).await.unwrap();
        assert_eq!(cursor.committed(), None);
        assert!(!tracker.commit(&mut cursor).await.unwrap());

        cursor.mark_processed(Offset::new(0, 5));
        assert!(tracker.commit(&mut cursor).await.unwrap());

        let reloaded = tracker.load(&tp()).await.unwrap();
        assert_eq!(reloaded.committed(), Some(Offset::new(0, 5)));
        assert_eq!(reloaded.position(), Some(Offset::new(0, 5)));

        // Another group starts from scratch
        let other = OffsetTracker::new(broker, "group-b", Duration::from_secs(1));
        assert_eq!(other.load(&tp()).await.unwrap().committed(), None);
    }
}
