//! Per-record processing: decode, classify, persist, hand off for delivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::broker::{BrokerError, BrokerRecord, Offset, TopicPartition};
use crate::config::ConsumerConfig;
use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::{decode, DecodeError, Envelope};
use crate::metrics::{ConsumerMetrics, StoreMetrics};
use crate::notification::{DispatchHandle, Notification, NotificationKind};
use crate::resilience::{BackoffConfig, RetryError, RetryPolicy};
use crate::router::{classify, kid_policy, KidDecision, Route, TopicMap};
use crate::store::{NotificationStore, StoreError, UpsertOutcome};

use super::{BackpressureGate, ConsumerStats};

/// How a record left the pipeline. Every variant allows the offset to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored for the first time and queued for delivery
    Persisted,
    /// Already stored; replay of a delivered record
    Duplicate,
    /// Dropped by the kid safety policy
    Filtered,
    /// Unroutable or unsupported version
    Skipped,
    DeadLettered,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Persisted => "persisted",
            RecordOutcome::Duplicate => "duplicate",
            RecordOutcome::Filtered => "filtered",
            RecordOutcome::Skipped => "skipped",
            RecordOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// A record the partition cannot move past.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store unavailable at {topic_partition}@{offset}: {source}")]
    StoreUnavailable {
        topic_partition: TopicPartition,
        offset: Offset,
        #[source]
        source: StoreError,
    },

    #[error("dead letter publish failed at {topic_partition}@{offset}: {source}")]
    DeadLetterFailed {
        topic_partition: TopicPartition,
        offset: Offset,
        #[source]
        source: BrokerError,
    },
}

impl PipelineError {
    pub fn offset(&self) -> Offset {
        match self {
            PipelineError::StoreUnavailable { offset, .. }
            | PipelineError::DeadLetterFailed { offset, .. } => *offset,
        }
    }
}

/// Retry policy for upserts derived from consumer settings.
pub fn upsert_retry_policy(consumer: &ConsumerConfig, store_timeout: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts: consumer.retry_attempts.max(1),
        backoff: BackoffConfig {
            initial_delay_ms: consumer.retry_initial_delay_ms,
            max_delay_ms: consumer.retry_max_delay_ms,
            ..BackoffConfig::default()
        },
        attempt_timeout: store_timeout,
    }
}

pub struct RecordPipeline {
    store: Arc<dyn NotificationStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    dispatch: DispatchHandle,
    backpressure: Arc<BackpressureGate>,
    retry: RetryPolicy,
    topics: TopicMap,
    stats: Arc<ConsumerStats>,
}

impl RecordPipeline {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        dispatch: DispatchHandle,
        backpressure: Arc<BackpressureGate>,
        retry: RetryPolicy,
        topics: TopicMap,
    ) -> Self {
        Self {
            store,
            dead_letters,
            dispatch,
            backpressure,
            retry,
            topics,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    pub fn backpressure(&self) -> &Arc<BackpressureGate> {
        &self.backpressure
    }

    /// Process one record. `Ok` means the offset may advance past it.
    pub async fn process(&self, record: &BrokerRecord) -> Result<RecordOutcome, PipelineError> {
        let start = Instant::now();
        let outcome = self.process_inner(record).await?;

        ConsumerMetrics::record_outcome(outcome.as_str(), start.elapsed().as_secs_f64());
        self.stats.record_outcome(outcome);
        Ok(outcome)
    }

    /// Metric label for the record's channel.
    pub fn channel_label(&self, topic: &str) -> &'static str {
        self.topics
            .channel_of(topic)
            .map(|c| c.as_str())
            .unwrap_or("unknown")
    }

    async fn process_inner(&self, record: &BrokerRecord) -> Result<RecordOutcome, PipelineError> {
        let envelope = match decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(DecodeError::UnsupportedVersion(version)) => {
                tracing::warn!(
                    topic_partition = %record.topic_partition,
                    offset = %record.offset,
                    version = %version,
                    "Skipping envelope with unsupported version"
                );
                return Ok(RecordOutcome::Skipped);
            }
            Err(DecodeError::MalformedPayload(detail)) => {
                let letter =
                    DeadLetter::from_record(record, DeadLetterReason::MalformedPayload, detail, 0);
                self.dead_letter(record, letter).await?;
                return Ok(RecordOutcome::DeadLettered);
            }
        };

        self.handle_envelope(record, envelope).await
    }

    #[tracing::instrument(
        name = "pipeline.record",
        skip_all,
        fields(
            correlation_id = %envelope.trace_id(),
            event_type = %envelope.event_type,
            envelope_id = %envelope.id,
            topic_partition = %record.topic_partition,
            offset = %record.offset,
        )
    )]
    async fn handle_envelope(
        &self,
        record: &BrokerRecord,
        envelope: Envelope,
    ) -> Result<RecordOutcome, PipelineError> {
        let mut kind = match classify(&envelope) {
            Route::Kind(kind) => kind,
            Route::Unroutable => {
                tracing::info!("Skipping unroutable event type");
                return Ok(RecordOutcome::Skipped);
            }
        };

        let mut parent = None;
        if kind == NotificationKind::KidNotification {
            match kid_policy(&envelope) {
                KidDecision::Allow => {}
                KidDecision::ParentApproval(parent_id) => {
                    tracing::info!(parent_id = %parent_id, "Kid event routed to parent for approval");
                    kind = NotificationKind::ParentNotification;
                    parent = Some(parent_id);
                }
                KidDecision::Filter(reason) => {
                    tracing::info!(reason = reason, "Kid notification filtered by safety policy");
                    return Ok(RecordOutcome::Filtered);
                }
            }
        }

        let built = Notification::from_envelope(&envelope, kind, envelope.timestamp);
        let notification = match built {
            Ok(mut notification) => {
                if let Some(parent_id) = parent {
                    notification.recipient_id = parent_id;
                }
                notification
            }
            Err(e) => {
                let letter = DeadLetter::from_record(
                    record,
                    DeadLetterReason::Unclassifiable,
                    e.to_string(),
                    0,
                )
                .with_notification_id(envelope.id)
                .with_recipient(envelope.recipient_id());
                self.dead_letter(record, letter).await?;
                return Ok(RecordOutcome::DeadLettered);
            }
        };

        self.persist(record, notification).await
    }

    async fn persist(
        &self,
        record: &BrokerRecord,
        notification: Notification,
    ) -> Result<RecordOutcome, PipelineError> {
        let depth = self.backpressure.acquire();

        let result = self
            .retry
            .run("store.upsert", || {
                let store = self.store.clone();
                let notification = notification.clone();
                async move { store.upsert(notification).await }
            })
            .await;

        match result {
            Ok(outcome) => {
                StoreMetrics::record_upsert(outcome.as_str());
                match outcome {
                    UpsertOutcome::Inserted => {
                        tracing::debug!(
                            notification_id = %notification.id,
                            kind = %notification.kind,
                            "Notification persisted"
                        );
                        self.dispatch.submit(notification, Some(depth));
                        Ok(RecordOutcome::Persisted)
                    }
                    UpsertOutcome::Existing => {
                        tracing::debug!(notification_id = %notification.id, "Duplicate record");
                        Ok(RecordOutcome::Duplicate)
                    }
                }
            }
            Err(RetryError::Permanent { attempts, error }) => {
                let letter = DeadLetter::from_record(
                    record,
                    DeadLetterReason::PersistenceFailed,
                    error.to_string(),
                    attempts,
                )
                .with_notification_id(notification.id)
                .with_recipient(Some(notification.recipient_id));
                self.dead_letter(record, letter).await?;
                Ok(RecordOutcome::DeadLettered)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(
                    attempts = attempts,
                    error = %last,
                    "Upsert retries exhausted, halting partition"
                );
                Err(PipelineError::StoreUnavailable {
                    topic_partition: record.topic_partition.clone(),
                    offset: record.offset,
                    source: last,
                })
            }
        }
    }

    async fn dead_letter(&self, record: &BrokerRecord, letter: DeadLetter) -> Result<(), PipelineError> {
        self.dead_letters
            .publish(&letter)
            .await
            .map_err(|source| PipelineError::DeadLetterFailed {
                topic_partition: record.topic_partition.clone(),
                offset: record.offset,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Producer};
    use crate::envelope::encode;
    use crate::deadletter::BrokerDeadLetterSink;
    use crate::notification::{DeliveryDispatcher, DispatcherConfig, LogChannel};
    use crate::store::MemoryNotificationStore;
    use serde_json::json;
    use uuid::Uuid;

    struct Harness {
        pipeline: RecordPipeline,
        store: Arc<MemoryNotificationStore>,
        broker: Arc<MemoryBroker>,
        dispatcher: Arc<DeliveryDispatcher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryNotificationStore::new());
        let broker = Arc::new(MemoryBroker::new(1));
        let producer = Producer::new(broker.clone(), TopicMap::default(), Duration::from_secs(1));
        let sink = Arc::new(BrokerDeadLetterSink::new(producer));
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            Arc::new(LogChannel),
            sink.clone(),
            DispatcherConfig::default(),
        );
        let pipeline = RecordPipeline::new(
            store.clone(),
            sink,
            dispatcher.handle(),
            BackpressureGate::new(100),
            RetryPolicy::default(),
            TopicMap::default(),
        );
        Harness {
            pipeline,
            store,
            broker,
            dispatcher,
        }
    }

    fn record(seq: u64, payload: Vec<u8>) -> BrokerRecord {
        BrokerRecord {
            topic_partition: TopicPartition::new("safety.alerts", 0),
            offset: Offset::new(0, seq),
            key: None,
            payload,
        }
    }

    fn envelope_bytes(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
        encode(&Envelope::builder(event_type, "test").payload(payload).build()).unwrap()
    }

    #[tokio::test]
    async fn test_persists_and_queues_delivery() {
        let h = harness();
        let bytes = envelope_bytes(
            "safety.alert",
            json!({ "recipientId": Uuid::new_v4().to_string(), "title": "Check in" }),
        );

        let outcome = h.pipeline.process(&record(0, bytes.clone())).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Persisted);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.dispatcher.handle().in_flight(), 1);
        // Queued delivery counts as pending depth
        assert_eq!(h.pipeline.backpressure().depth(), 1);

        let replay = h.pipeline.process(&record(0, bytes)).await.unwrap();
        assert_eq!(replay, RecordOutcome::Duplicate);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_dead_lettered() {
        let h = harness();
        let outcome = h.pipeline.process(&record(3, b"{not json".to_vec())).await.unwrap();
        assert_eq!(outcome, RecordOutcome::DeadLettered);

        let letters = h.broker.records("notifications.dead-letter");
        assert_eq!(letters.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&letters[0].payload).unwrap();
        assert_eq!(letter.reason, DeadLetterReason::MalformedPayload);
        assert_eq!(letter.source_offset, Some(Offset::new(0, 3)));
        assert_eq!(letter.payload, "{not json");
    }

    #[tokio::test]
    async fn test_missing_recipient_dead_lettered() {
        let h = harness();
        let bytes = envelope_bytes("user.followed", json!({ "title": "hi" }));
        let outcome = h.pipeline.process(&record(0, bytes)).await.unwrap();
        assert_eq!(outcome, RecordOutcome::DeadLettered);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_unroutable_and_unsupported_are_skipped() {
        let h = harness();
        let unroutable = envelope_bytes("billing.invoice", json!({}));
        assert_eq!(
            h.pipeline.process(&record(0, unroutable)).await.unwrap(),
            RecordOutcome::Skipped
        );

        let future = encode(
            &Envelope::builder("safety.alert", "test").version("2").build(),
        )
        .unwrap();
        assert_eq!(
            h.pipeline.process(&record(1, future)).await.unwrap(),
            RecordOutcome::Skipped
        );
        assert!(h.broker.records("notifications.dead-letter").is_empty());
    }

    #[tokio::test]
    async fn test_kid_policy_filters() {
        let h = harness();
        let bytes = envelope_bytes(
            "kid.notification",
            json!({ "recipientId": Uuid::new_v4().to_string(), "eventType": "stranger_request" }),
        );
        assert_eq!(
            h.pipeline.process(&record(0, bytes)).await.unwrap(),
            RecordOutcome::Filtered
        );
        assert!(h.store.is_empty());
        assert_eq!(h.pipeline.stats().snapshot().filtered, 1);
    }

    #[tokio::test]
    async fn test_kid_safety_screens_filter() {
        let h = harness();
        let recipient = Uuid::new_v4().to_string();
        let low_score = envelope_bytes(
            "kid.notification",
            json!({ "recipientId": recipient, "eventType": "direct_message", "safetyScore": 0.5 }),
        );
        let blocked = envelope_bytes(
            "kid.direct_message",
            json!({ "recipientId": recipient, "message": "some violence here" }),
        );
        let clean = envelope_bytes(
            "kid.direct_message",
            json!({ "recipientId": recipient, "message": "hello", "safetyScore": 0.95 }),
        );

        for (seq, bytes) in [low_score, blocked].into_iter().enumerate() {
            assert_eq!(
                h.pipeline.process(&record(seq as u64, bytes)).await.unwrap(),
                RecordOutcome::Filtered
            );
        }
        assert!(h.store.is_empty());
        assert_eq!(
            h.pipeline.process(&record(2, clean)).await.unwrap(),
            RecordOutcome::Persisted
        );
        assert_eq!(h.pipeline.stats().snapshot().filtered, 2);
    }

    #[tokio::test]
    async fn test_kid_approval_request_goes_to_parent() {
        let h = harness();
        let kid = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let envelope = Envelope::builder("kid.notification", "follow")
            .payload(json!({
                "recipientId": kid.to_string(),
                "parentId": parent.to_string(),
                "eventType": "follow_request",
            }))
            .build();

        let outcome = h.pipeline.process(&record(0, encode(&envelope).unwrap())).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Persisted);

        let stored = h.store.get(envelope.id).await.unwrap().unwrap();
        assert_eq!(stored.recipient_id, parent);
        assert_eq!(stored.kind, NotificationKind::ParentNotification);
        assert_eq!(stored.payload.data["recipientId"], kid.to_string());

        // Without a parent to ask, the request is withheld
        let orphan = envelope_bytes(
            "kid.message_request",
            json!({ "recipientId": kid.to_string() }),
        );
        assert_eq!(
            h.pipeline.process(&record(1, orphan)).await.unwrap(),
            RecordOutcome::Filtered
        );
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_created_at_is_event_time() {
        let h = harness();
        let emitted = chrono::Utc::now() - chrono::Duration::hours(2);
        let envelope = Envelope::builder("safety.alert", "test")
            .timestamp(emitted)
            .payload(json!({ "recipientId": Uuid::new_v4().to_string() }))
            .build();

        h.pipeline.process(&record(0, encode(&envelope).unwrap())).await.unwrap();
        let stored = h.store.get(envelope.id).await.unwrap().unwrap();
        assert_eq!(stored.created_at, emitted);
        assert_eq!(
            stored.expires_at,
            Some(emitted + NotificationKind::SafetyAlert.default_retention())
        );
    }

    #[test]
    fn test_upsert_policy_from_settings() {
        let policy = upsert_retry_policy(&ConsumerConfig::default(), Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(2));
    }
}
