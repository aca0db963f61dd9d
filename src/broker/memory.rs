//! In-memory broker using DashMap.
//!
//! Each partition is a `Vec` of records; a record's offset is its position
//! (`0-<index>`). Data is lost on restart.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{partition_for, Broker, BrokerError, BrokerRecord, Offset, TopicPartition};

struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

pub struct MemoryBroker {
    partitions: u32,
    logs: DashMap<TopicPartition, Vec<StoredRecord>>,
    /// (group, partition) -> committed offset
    committed: DashMap<(String, TopicPartition), Offset>,
    available: AtomicBool,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            logs: DashMap::new(),
            committed: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with a transient error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Every record of a topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        (0..self.partitions)
            .flat_map(|partition| {
                let tp = TopicPartition::new(topic, partition);
                self.logs
                    .get(&tp)
                    .map(|log| {
                        log.iter()
                            .enumerate()
                            .map(|(index, record)| to_record(&tp, index, record))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn len(&self, tp: &TopicPartition) -> usize {
        self.logs.get(tp).map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.logs.iter().all(|log| log.is_empty())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker offline".into()))
        }
    }
}

fn to_record(tp: &TopicPartition, index: usize, record: &StoredRecord) -> BrokerRecord {
    BrokerRecord {
        topic_partition: tp.clone(),
        offset: Offset::new(0, index as u64),
        key: Some(record.key.clone()),
        payload: record.payload.clone(),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
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
        self.check_available()?;

        let tp = TopicPartition::new(topic, partition_for(key, self.partitions));
        let mut log = self.logs.entry(tp.clone()).or_default();
        let offset = Offset::new(0, log.len() as u64);
        log.push(StoredRecord {
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        drop(log);

        Ok((tp, offset))
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        self.check_available()?;

        let start = after.map(|o| o.seq as usize + 1).unwrap_or(0);
        let Some(log) = self.logs.get(tp) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(index, record)| to_record(tp, index, record))
            .collect())
    }

    async fn commit(
        &self,
        group: &str,
        tp: &TopicPartition,
        offset: Offset,
    ) -> Result<(), BrokerError> {
        self.check_available()?;

        self.committed
            .entry((group.to_string(), tp.clone()))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        tp: &TopicPartition,
    ) -> Result<Option<Offset>, BrokerError> {
        self.check_available()?;
        Ok(self
            .committed
            .get(&(group.to_string(), tp.clone()))
            .map(|o| *o))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_available()
    }
}
