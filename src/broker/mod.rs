//! Partitioned publish/subscribe broker abstraction.
//!
//! A topic is split into a fixed number of partitions. Records within a
//! partition are totally ordered by [`Offset`]; a consumer group tracks one
//! committed offset per partition. Two implementations exist:
//!
//! - [`MemoryBroker`]: process-local, for development and tests
//! - [`RedisStreamBroker`]: one Redis stream per partition, offsets in a hash

mod factory;
mod memory;
mod producer;
mod redis_streams;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redis::PoolError;
use crate::resilience::Retryable;

pub use factory::create_broker;
pub use memory::MemoryBroker;
pub use producer::Producer;
pub use redis_streams::RedisStreamBroker;

/// Position of a record within a partition.
///
/// Same layout as a Redis stream entry id (`ms-seq`), ordered by `ms` then `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset {
    pub ms: u64,
    pub seq: u64,
}

impl Offset {
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for Offset {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let corrupt = || BrokerError::Corrupt(format!("invalid offset '{}'", s));
        let (ms, seq) = s.split_once('-').ok_or_else(corrupt)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| corrupt())?,
            seq: seq.parse().map_err(|_| corrupt())?,
        })
    }
}

impl Serialize for Offset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// One record as fetched from a partition.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic_partition: TopicPartition,
    pub offset: Offset,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// Temporarily unreachable (also used by fault-injecting test brokers)
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt broker data: {0}")]
    Corrupt(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Redis(e) => e.is_transient(),
            BrokerError::Timeout(_) | BrokerError::Unavailable(_) => true,
            BrokerError::Corrupt(_) | BrokerError::Encode(_) => false,
        }
    }
}

impl Retryable for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        BrokerError::Timeout(after)
    }
}

/// Partitioned log with per-group committed offsets.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend identifier for logs and metrics
    fn name(&self) -> &'static str;

    /// Partitions per topic
    fn partitions(&self) -> u32;

    /// Append a record; the partition is derived from `key`.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(TopicPartition, Offset), BrokerError>;

    /// Up to `max` records with offsets strictly after `after`, in order.
    /// `None` reads from the beginning of the partition.
    async fn fetch(
        &self,
        tp: &TopicPartition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Persist the last fully processed offset of a partition for a group.
    async fn commit(
        &self,
        group: &str,
        tp: &TopicPartition,
        offset: Offset,
    ) -> Result<(), BrokerError>;

    async fn committed(
        &self,
        group: &str,
        tp: &TopicPartition,
    ) -> Result<Option<Offset>, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Stable partition for a key (32-bit FNV-1a).
///
/// Every producer must agree on this mapping, so it cannot depend on the
/// process-seeded std hasher.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(FNV_PRIME)
    });
    hash % partitions.max(1)
}

/// Bound a broker call; an elapsed timeout becomes a transient error.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(BrokerError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ordering() {
        assert!(Offset::new(1, 5) < Offset::new(2, 0));
        assert!(Offset::new(2, 0) < Offset::new(2, 1));
    }

    #[test]
    fn test_offset_parse() {
        let offset: Offset = "1700000000000-3".parse().unwrap();
        assert_eq!(offset, Offset::new(1_700_000_000_000, 3));
        assert_eq!(offset.to_string(), "1700000000000-3");
        assert!("garbage".parse::<Offset>().is_err());
        assert!("1-x".parse::<Offset>().is_err());
    }

    #[test]
    fn test_partition_for_is_stable() {
        let key = "6f1c1b8e-6a07-4a39-9d8e-1f7f2f4b2c11";
        let first = partition_for(key, 12);
        for _ in 0..10 {
            assert_eq!(partition_for(key, 12), first);
        }
        assert!(first < 12);
        assert_eq!(partition_for(key, 1), 0);
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let used: std::collections::HashSet<u32> = (0..200)
            .map(|i| partition_for(&format!("recipient-{}", i), 8))
            .collect();
        assert_eq!(used.len(), 8);
    }

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(!BrokerError::Corrupt("bad id".into()).is_transient());
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }
}
