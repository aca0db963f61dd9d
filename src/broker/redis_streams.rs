//! Redis Streams broker.
//!
//! Each partition is a stream at `{prefix}:{topic}:{partition}`; records carry
//! `key` and `payload` fields. Committed offsets for a group live in the hash
//! `{prefix}:offsets:{group}` under the field `{topic}:{partition}`.

use std::sync::Arc;

use async_trait::async_trait;
use redis::streams::StreamId;

use crate::config::BrokerConfig;
use crate::redis::RedisPool;

use super::{partition_for, Broker, BrokerError, BrokerRecord, Offset, TopicPartition};

pub struct RedisStreamBroker {
    pool: Arc<RedisPool>,
    prefix: String,
    partitions: u32,
    max_len: usize,
}

impl RedisStreamBroker {
    pub fn new(pool: Arc<RedisPool>, config: &BrokerConfig) -> Self {
        Self {
            pool,
            prefix: config.stream_prefix.clone(),
            partitions: config.partitions.max(1),
            max_len: config.stream_max_len,
        }
    }

    fn stream_key(&self, tp: &TopicPartition) -> String {
        format!("{}:{}:{}", self.prefix, tp.topic, tp.partition)
    }

    fn offsets_key(&self, group: &str) -> String {
        format!("{}:offsets:{}", self.prefix, group)
    }

    fn to_record(tp: &TopicPartition, entry: &StreamId) -> Result<BrokerRecord, BrokerError> {
        let offset: Offset = entry.id.parse()?;
        Ok(BrokerRecord {
            topic_partition: tp.clone(),
            offset,
            key: entry.get::<String>("key"),
            // A missing payload decodes as malformed and is dead-lettered downstream
            payload: entry.get::<Vec<u8>>("payload").unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(TopicPartition, Offset), BrokerError> {
        let tp = TopicPartition::new(topic, partition_for(key, self.partitions));
        let stream = self.stream_key(&tp);

        let id = self
            .pool
            .xadd_maxlen(&stream, self.max_len, &[("key", key.as_bytes()), ("payload", payload)])
            .await?;

        tracing::trace!(stream = %stream, id = %id, "Record appended");
        Ok((tp, id.parse()?))
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        // "(" makes the XRANGE start exclusive
        let start = after
            .map(|offset| format!("({}", offset))
            .unwrap_or_else(|| "-".to_string());

        let reply = self
            .pool
            .xrange_from(&self.stream_key(tp), &start, max)
            .await?;

        reply
            .ids
            .iter()
            .map(|entry| Self::to_record(tp, entry))
            .collect()
    }

    async fn commit(
        &self,
        group: &str,
        tp: &TopicPartition,
        offset: Offset,
    ) -> Result<(), BrokerError> {
        self.pool
            .hset(&self.offsets_key(group), &tp.to_string(), &offset.to_string())
            .await?;
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        tp: &TopicPartition,
    ) -> Result<Option<Offset>, BrokerError> {
        let raw = self
            .pool
            .hget(&self.offsets_key(group), &tp.to_string())
            .await?;
        raw.map(|value| value.parse()).transpose()
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.pool.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::resilience::CircuitBreaker;

    fn broker() -> RedisStreamBroker {
        let pool = RedisPool::new(
            RedisConfig::default(),
            Arc::new(CircuitBreaker::new("redis")),
        )
        .unwrap();
        RedisStreamBroker::new(Arc::new(pool), &BrokerConfig::default())
    }

    #[test]
    fn test_key_layout() {
        let broker = broker();
        let tp = TopicPartition::new("safety.alerts", 3);
        assert_eq!(broker.stream_key(&tp), "ara:pipeline:safety.alerts:3");
        assert_eq!(
            broker.offsets_key("notification-pipeline"),
            "ara:pipeline:offsets:notification-pipeline"
        );
    }

    #[test]
    fn test_to_record_parses_entry() {
        let mut map = std::collections::HashMap::new();
        map.insert("key".to_string(), redis::Value::BulkString(b"alice".to_vec()));
        map.insert("payload".to_string(), redis::Value::BulkString(b"{}".to_vec()));
        let entry = StreamId {
            id: "1700000000000-2".to_string(),
            map,
        };

        let tp = TopicPartition::new("t", 0);
        let record = RedisStreamBroker::to_record(&tp, &entry).unwrap();
        assert_eq!(record.offset, Offset::new(1_700_000_000_000, 2));
        assert_eq!(record.key.as_deref(), Some("alice"));
        assert_eq!(record.payload, b"{}");
    }
}
