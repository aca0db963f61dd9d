//! Envelope producer: channel to topic, recipient to partition.

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{encode, Envelope};
use crate::router::{Channel, TopicMap};

use super::{with_timeout, Broker, BrokerError, Offset, TopicPartition};

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    topics: TopicMap,
    timeout: Duration,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, topics: TopicMap, timeout: Duration) -> Self {
        Self {
            broker,
            topics,
            timeout,
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    /// Publish an envelope keyed by its recipient, so every event for one
    /// recipient lands on the same partition.
    #[tracing::instrument(
        name = "producer.publish",
        skip(self, envelope),
        fields(channel = %channel, envelope_id = %envelope.id, correlation_id = %envelope.trace_id())
    )]
    pub async fn publish_envelope(
        &self,
        channel: Channel,
        envelope: &Envelope,
    ) -> Result<(TopicPartition, Offset), BrokerError> {
        let payload = encode(envelope)?;
        self.publish_raw(channel, &envelope.partition_key(), &payload)
            .await
    }

    /// Publish pre-encoded bytes (dead letters, replays).
    pub async fn publish_raw(
        &self,
        channel: Channel,
        key: &str,
        payload: &[u8],
    ) -> Result<(TopicPartition, Offset), BrokerError> {
        let topic = self.topics.topic(channel);
        let (tp, offset) =
            with_timeout(self.timeout, self.broker.publish(topic, key, payload)).await?;

        tracing::debug!(topic_partition = %tp, offset = %offset, "Published record");
        Ok((tp, offset))
    }
}
