//! Dead-letter records and the sink that publishes them.
//!
//! Anything the pipeline gives up on (poison records, classification
//! failures, permanent store errors, exhausted deliveries) is published to the
//! dead-letter channel with enough context to replay it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerRecord, Offset, Producer};
use crate::metrics::DeliveryMetrics;
use crate::notification::Notification;
use crate::router::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Bytes did not decode into an envelope
    MalformedPayload,
    /// Envelope could not become a notification (missing or invalid recipient)
    Unclassifiable,
    /// The store rejected the record permanently
    PersistenceFailed,
    /// Every delivery attempt failed
    DeliveryExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MalformedPayload => "malformed_payload",
            DeadLetterReason::Unclassifiable => "unclassifiable",
            DeadLetterReason::PersistenceFailed => "persistence_failed",
            DeadLetterReason::DeliveryExhausted => "delivery_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: Uuid,
    pub reason: DeadLetterReason,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<Offset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<Uuid>,
    pub attempts: u32,
    /// Raw record bytes (lossy UTF-8) or the serialized notification
    pub payload: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for a broker record that never became a notification.
    pub fn from_record(
        record: &BrokerRecord,
        reason: DeadLetterReason,
        detail: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            detail: detail.into(),
            source_topic: Some(record.topic_partition.topic.clone()),
            source_partition: Some(record.topic_partition.partition),
            source_offset: Some(record.offset),
            notification_id: None,
            recipient_id: None,
            attempts,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Dead letter for a stored notification the dispatcher gave up on.
    pub fn from_notification(
        notification: &Notification,
        reason: DeadLetterReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            detail: detail.into(),
            source_topic: None,
            source_partition: None,
            source_offset: None,
            notification_id: Some(notification.id),
            recipient_id: Some(notification.recipient_id),
            attempts: notification.delivery_attempts,
            payload: serde_json::to_string(notification).unwrap_or_default(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn with_notification_id(mut self, id: Uuid) -> Self {
        self.notification_id = Some(id);
        self
    }

    pub fn with_recipient(mut self, recipient_id: Option<Uuid>) -> Self {
        self.recipient_id = recipient_id;
        self
    }

    fn partition_key(&self) -> String {
        self.recipient_id
            .or(self.notification_id)
            .unwrap_or(self.id)
            .to_string()
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), BrokerError>;
}

/// Publishes dead letters to the dead-letter channel.
pub struct BrokerDeadLetterSink {
    producer: Producer,
}

impl BrokerDeadLetterSink {
    pub fn new(producer: Producer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(letter)?;
        self.producer
            .publish_raw(Channel::DeadLetter, &letter.partition_key(), &bytes)
            .await?;

        DeliveryMetrics::record_dead_letter(letter.reason.as_str());
        tracing::warn!(
            dead_letter_id = %letter.id,
            reason = letter.reason.as_str(),
            detail = %letter.detail,
            notification_id = ?letter.notification_id,
            source_topic = ?letter.source_topic,
            source_offset = ?letter.source_offset,
            "Dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, TopicPartition};
    use crate::router::TopicMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_dead_letter_keeps_raw_bytes() {
        let broker = Arc::new(MemoryBroker::new(2));
        let producer = Producer::new(broker.clone(), TopicMap::default(), Duration::from_secs(1));
        let sink = BrokerDeadLetterSink::new(producer);

        let record = BrokerRecord {
            topic_partition: TopicPartition::new("safety.alerts", 1),
            offset: Offset::new(0, 7),
            key: None,
            payload: b"{not json".to_vec(),
        };
        let letter = DeadLetter::from_record(&record, DeadLetterReason::MalformedPayload, "eof", 0);
        sink.publish(&letter).await.unwrap();

        let published = broker.records("notifications.dead-letter");
        assert_eq!(published.len(), 1);
        let decoded: DeadLetter = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(decoded.payload, "{not json");
        assert_eq!(decoded.source_offset, Some(Offset::new(0, 7)));
        assert_eq!(decoded.reason, DeadLetterReason::MalformedPayload);
    }
}
