//! End-to-end pipeline tests
//!
//! Every component runs for real on the in-memory broker and store. Faults
//! are injected through thin wrappers around those backends.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ara_notification_pipeline::broker::{
    Broker, BrokerError, BrokerRecord, MemoryBroker, Offset, Producer, TopicPartition,
};
use ara_notification_pipeline::consumer::{
    BackpressureGate, ConsumerGroupConfig, ConsumerGroupManager, PipelineHealth, RecordPipeline,
};
use ara_notification_pipeline::deadletter::{BrokerDeadLetterSink, DeadLetter, DeadLetterReason};
use ara_notification_pipeline::envelope::{decode, Envelope};
use ara_notification_pipeline::notification::{
    DeliveryChannel, DeliveryDispatcher, DeliveryError, DispatcherConfig, Notification,
};
use ara_notification_pipeline::resilience::{BackoffConfig, RetryPolicy};
use ara_notification_pipeline::router::{Channel, TopicMap};
use ara_notification_pipeline::store::{
    MemoryNotificationStore, NotificationStore, Pagination, StoreError, StoreStats, UpsertOutcome,
};

// ============================================================================
// Fault-injecting backends
// ============================================================================

/// Memory store whose upserts can be switched to fail transiently.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryNotificationStore,
    failing: AtomicBool,
    upserts: Mutex<Vec<Uuid>>,
}

impl FaultyStore {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn upsert_order(&self) -> Vec<Uuid> {
        self.upserts.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl NotificationStore for FaultyStore {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    async fn upsert(&self, notification: Notification) -> Result<UpsertOutcome, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        let id = notification.id;
        let outcome = self.inner.upsert(notification).await?;
        if outcome == UpsertOutcome::Inserted {
            self.upserts.lock().unwrap().push(id);
        }
        Ok(outcome)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_unread(&self, recipient_id: Uuid, page: Pagination) -> Result<Vec<Notification>, StoreError> {
        self.inner.list_unread(recipient_id, page).await
    }

    async fn unread_count(&self, recipient_id: Uuid) -> Result<u64, StoreError> {
        self.inner.unread_count(recipient_id).await
    }

    async fn list_undelivered(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        self.inner.list_undelivered(created_before, max_attempts, limit).await
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_delivered(id, at).await
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_read(id, at).await
    }

    async fn mark_all_read(&self, recipient_id: Uuid, at: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.mark_all_read(recipient_id, at).await
    }

    async fn record_delivery_attempt(&self, id: Uuid) -> Result<u32, StoreError> {
        self.inner.record_delivery_attempt(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_expired(now).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Memory broker that checks, on every commit, that each committed record
/// is already in the store or on the dead-letter topic.
struct CommitCheckingBroker {
    inner: Arc<MemoryBroker>,
    store: Arc<FaultyStore>,
    dead_letter_topic: String,
    violations: AtomicUsize,
}

impl CommitCheckingBroker {
    fn dead_lettered(&self, tp: &TopicPartition) -> Vec<Offset> {
        self.inner
            .records(&self.dead_letter_topic)
            .iter()
            .filter_map(|r| serde_json::from_slice::<DeadLetter>(&r.payload).ok())
            .filter(|l| l.source_topic.as_deref() == Some(tp.topic.as_str()))
            .filter(|l| l.source_partition == Some(tp.partition))
            .filter_map(|l| l.source_offset)
            .collect()
    }
}

#[async_trait]
impl Broker for CommitCheckingBroker {
    fn name(&self) -> &'static str {
        "commit-checking"
    }

    fn partitions(&self) -> u32 {
        self.inner.partitions()
    }

    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(TopicPartition, Offset), BrokerError> {
        self.inner.publish(topic, key, payload).await
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        self.inner.fetch(tp, after, max).await
    }

    async fn commit(&self, group: &str, tp: &TopicPartition, offset: Offset) -> Result<(), BrokerError> {
        let records = self.inner.fetch(tp, None, usize::MAX).await?;
        let dead_lettered = self.dead_lettered(tp);
        for record in records
            .iter()
            .filter(|r| r.offset <= offset && !dead_lettered.contains(&r.offset))
        {
            let Ok(envelope) = decode(&record.payload) else {
                continue;
            };
            if matches!(self.store.get(envelope.id).await, Ok(None)) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.commit(group, tp, offset).await
    }

    async fn committed(&self, group: &str, tp: &TopicPartition) -> Result<Option<Offset>, BrokerError> {
        self.inner.committed(group, tp).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.inner.ping().await
    }
}

/// Records every successful send; can fail every send or hold them behind a
/// semaphore.
struct RecordingChannel {
    sent: Mutex<Vec<Uuid>>,
    failing: AtomicBool,
    gate: Semaphore,
}

impl RecordingChannel {
    fn new(open: bool) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
        }
    }

    fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().unwrap().clone()
    }

    fn release(&self) {
        self.gate.add_permits(10_000);
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, _recipient_id: Uuid, notification: &Notification) -> Result<(), DeliveryError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| DeliveryError::Unavailable("gate closed".into()))?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Unavailable("injected failure".into()));
        }
        self.sent.lock().unwrap().push(notification.id);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Options {
    partitions: u32,
    members: usize,
    batch_size: usize,
    max_pending: usize,
    max_delivery_attempts: u32,
    send_timeout: Duration,
    channel_open: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            partitions: 4,
            members: 2,
            batch_size: 50,
            max_pending: 1_000,
            max_delivery_attempts: 3,
            send_timeout: Duration::from_millis(500),
            channel_open: true,
        }
    }
}

struct Harness {
    broker: Arc<CommitCheckingBroker>,
    memory: Arc<MemoryBroker>,
    store: Arc<FaultyStore>,
    channel: Arc<RecordingChannel>,
    producer: Producer,
    topics: TopicMap,
    dispatcher: Arc<DeliveryDispatcher>,
    consumer: Arc<ConsumerGroupManager>,
    gate: Arc<BackpressureGate>,
    shutdown_tx: broadcast::Sender<()>,
    dispatcher_task: JoinHandle<()>,
}

fn fast_backoff(initial_delay_ms: u64, max_delay_ms: u64) -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms,
        max_delay_ms,
        multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

impl Harness {
    async fn start(options: Options) -> Self {
        let memory = Arc::new(MemoryBroker::new(options.partitions));
        let store = Arc::new(FaultyStore::default());
        let topics = TopicMap::default();
        let broker = Arc::new(CommitCheckingBroker {
            inner: memory.clone(),
            store: store.clone(),
            dead_letter_topic: topics.topic(Channel::DeadLetter).to_string(),
            violations: AtomicUsize::new(0),
        });
        let producer = Producer::new(broker.clone(), topics.clone(), Duration::from_secs(1));
        let sink = Arc::new(BrokerDeadLetterSink::new(producer.clone()));
        let channel = Arc::new(RecordingChannel::new(options.channel_open));

        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            channel.clone(),
            sink.clone(),
            DispatcherConfig {
                max_attempts: options.max_delivery_attempts,
                backoff: fast_backoff(5, 20),
                workers: 4,
                send_timeout: options.send_timeout,
                store_timeout: Duration::from_secs(1),
            },
        );

        let gate = BackpressureGate::new(options.max_pending);
        let pipeline = Arc::new(RecordPipeline::new(
            store.clone(),
            sink,
            dispatcher.handle(),
            gate.clone(),
            RetryPolicy {
                max_attempts: 2,
                backoff: fast_backoff(5, 10),
                attempt_timeout: Duration::from_millis(500),
            },
            topics.clone(),
        ));

        let consumer = Arc::new(ConsumerGroupManager::new(
            broker.clone(),
            pipeline,
            Arc::new(PipelineHealth::new()),
            topics.inbound_topics(),
            ConsumerGroupConfig {
                group_id: "pipeline-test".to_string(),
                members: options.members,
                batch_size: options.batch_size,
                poll_interval: Duration::from_millis(10),
                halt_backoff: fast_backoff(20, 50),
                revoke_timeout: Duration::from_secs(5),
                broker_timeout: Duration::from_secs(1),
            },
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(shutdown_tx.subscribe()));
        consumer.start().await;

        Self {
            broker,
            memory,
            store,
            channel,
            producer,
            topics,
            dispatcher,
            consumer,
            gate,
            shutdown_tx,
            dispatcher_task,
        }
    }

    async fn publish(&self, channel: Channel, envelope: &Envelope) -> (TopicPartition, Offset) {
        self.producer.publish_envelope(channel, envelope).await.unwrap()
    }

    async fn committed(&self, tp: &TopicPartition) -> Option<Offset> {
        self.broker.committed("pipeline-test", tp).await.unwrap()
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        self.memory
            .records(self.topics.topic(Channel::DeadLetter))
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }

    async fn stop(self) {
        self.consumer.stop().await;
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(5), self.dispatcher_task).await;
        assert_eq!(
            self.broker.violations.load(Ordering::SeqCst),
            0,
            "an offset was committed before its record was stored"
        );
    }
}

fn safety_alert(recipient: Uuid, title: &str) -> Envelope {
    Envelope::builder("safety.alert", "moderation")
        .payload(json!({
            "recipientId": recipient.to_string(),
            "title": title,
            "severity": "high",
        }))
        .correlation_id(format!("corr-{}", title))
        .build()
}

/// Poll `condition` until it holds or five seconds pass.
async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_safety_alert_end_to_end() {
    let h = Harness::start(Options::default()).await;
    let recipient = Uuid::new_v4();
    let envelope = safety_alert(recipient, "suspicious-contact");

    let (tp, offset) = h.publish(Channel::SafetyAlerts, &envelope).await;
    assert_eq!(tp.topic, "safety.alerts");

    eventually("alert delivered", || async {
        matches!(h.store.get(envelope.id).await, Ok(Some(n)) if n.delivered)
    })
    .await;
    eventually("offset committed", || async { h.committed(&tp).await == Some(offset) }).await;

    let stored = h.store.get(envelope.id).await.unwrap().unwrap();
    assert_eq!(stored.recipient_id, recipient);
    assert_eq!(stored.payload.title, "suspicious-contact");
    assert!(stored.delivered_at.is_some());
    assert!(!stored.is_read);
    assert_eq!(h.channel.sent(), vec![envelope.id]);

    let unread = h.store.list_unread(recipient, Pagination::default()).await.unwrap();
    assert_eq!(unread.len(), 1);

    let stats = h.consumer.stats();
    assert_eq!(stats.persisted, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert!(h.consumer.health().is_healthy());

    h.stop().await;
}

#[tokio::test]
async fn test_redelivered_record_is_stored_once() {
    let h = Harness::start(Options::default()).await;
    let envelope = safety_alert(Uuid::new_v4(), "dup");

    h.publish(Channel::SafetyAlerts, &envelope).await;
    eventually("first copy delivered", || async {
        matches!(h.store.get(envelope.id).await, Ok(Some(n)) if n.delivered)
    })
    .await;

    // Same envelope id arriving again, as after a broker redelivery
    h.publish(Channel::SafetyAlerts, &envelope).await;
    eventually("duplicate observed", || async { h.consumer.stats().duplicates == 1 }).await;

    assert_eq!(h.store.len(), 1);
    assert_eq!(h.channel.sent().len(), 1);
    let stored = h.store.get(envelope.id).await.unwrap().unwrap();
    assert!(stored.delivered);

    h.stop().await;
}

#[tokio::test]
async fn test_per_recipient_order_is_preserved() {
    let h = Harness::start(Options {
        members: 3,
        batch_size: 4,
        ..Options::default()
    })
    .await;
    let recipient = Uuid::new_v4();

    let mut expected = Vec::new();
    for i in 0..20 {
        let envelope = safety_alert(recipient, &format!("alert-{}", i));
        expected.push(envelope.id);
        h.publish(Channel::SafetyAlerts, &envelope).await;
    }

    eventually("all persisted", || async { h.store.len() == 20 }).await;
    assert_eq!(h.store.upsert_order(), expected);

    h.stop().await;
}

#[tokio::test]
async fn test_delivery_attempts_are_bounded() {
    let h = Harness::start(Options {
        max_delivery_attempts: 3,
        ..Options::default()
    })
    .await;
    h.channel.failing.store(true, Ordering::SeqCst);
    let envelope = safety_alert(Uuid::new_v4(), "unreachable");

    h.publish(Channel::SafetyAlerts, &envelope).await;
    eventually("delivery dead-lettered", || async { h.dispatcher.stats().dead_lettered == 1 }).await;

    let stored = h.store.get(envelope.id).await.unwrap().unwrap();
    assert!(!stored.delivered);
    assert_eq!(stored.delivery_attempts, 3);

    let letters = h.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::DeliveryExhausted);
    assert_eq!(letters[0].notification_id, Some(envelope.id));
    assert_eq!(letters[0].attempts, 3);
    assert!(h.channel.sent().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_expired_notification_is_stored_but_not_sent() {
    let h = Harness::start(Options::default()).await;
    let envelope = Envelope::builder("safety.alert", "moderation")
        .payload(json!({
            "recipientId": Uuid::new_v4().to_string(),
            "expiresAt": "2020-01-01T00:00:00Z",
        }))
        .build();

    h.publish(Channel::SafetyAlerts, &envelope).await;
    eventually("delivery skipped", || async { h.dispatcher.stats().skipped == 1 }).await;

    let stored = h.store.get(envelope.id).await.unwrap().unwrap();
    assert!(!stored.delivered);
    assert!(h.channel.sent().is_empty());

    assert_eq!(h.store.purge_expired(Utc::now()).await.unwrap(), 1);
    assert!(h.store.get(envelope.id).await.unwrap().is_none());

    h.stop().await;
}

#[tokio::test]
async fn test_poison_record_does_not_block_partition() {
    let h = Harness::start(Options {
        partitions: 1,
        ..Options::default()
    })
    .await;
    let recipient = Uuid::new_v4();
    let topic = h.topics.topic(Channel::SafetyAlerts).to_string();

    let mut ids = Vec::new();
    for i in 0..10 {
        if i == 5 {
            h.producer
                .publish_raw(Channel::SafetyAlerts, &recipient.to_string(), b"{not json")
                .await
                .unwrap();
        }
        let envelope = safety_alert(recipient, &format!("valid-{}", i));
        ids.push(envelope.id);
        h.publish(Channel::SafetyAlerts, &envelope).await;
    }

    let tp = TopicPartition::new(topic.clone(), 0);
    let last = h.memory.records(&topic).last().map(|r| r.offset);
    eventually("all valid records persisted", || async { h.store.len() == 10 }).await;
    eventually("partition fully committed", || async { h.committed(&tp).await == last }).await;

    let letters = h.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::MalformedPayload);
    assert_eq!(letters[0].source_topic.as_deref(), Some(topic.as_str()));
    assert_eq!(letters[0].source_offset, Some(Offset::new(0, 5)));
    assert_eq!(h.store.upsert_order(), ids);

    h.stop().await;
}

#[tokio::test]
async fn test_unrepresentable_expiry_does_not_block_partition() {
    let h = Harness::start(Options {
        partitions: 1,
        ..Options::default()
    })
    .await;
    let recipient = Uuid::new_v4();
    let topic = h.topics.topic(Channel::SafetyAlerts).to_string();

    let mut ids = Vec::new();
    for i in 0..6 {
        if i == 3 {
            let bad = Envelope::builder("safety.alert", "moderation")
                .payload(json!({
                    "recipientId": recipient.to_string(),
                    "ttlSeconds": i64::MAX,
                }))
                .build();
            h.publish(Channel::SafetyAlerts, &bad).await;
        }
        let envelope = safety_alert(recipient, &format!("valid-{}", i));
        ids.push(envelope.id);
        h.publish(Channel::SafetyAlerts, &envelope).await;
    }

    let tp = TopicPartition::new(topic.clone(), 0);
    let last = h.memory.records(&topic).last().map(|r| r.offset);
    eventually("all valid records persisted", || async { h.store.len() == 6 }).await;
    eventually("partition fully committed", || async { h.committed(&tp).await == last }).await;

    let letters = h.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Unclassifiable);
    assert_eq!(letters[0].source_offset, Some(Offset::new(0, 3)));
    assert_eq!(letters[0].recipient_id, Some(recipient));
    assert_eq!(h.store.upsert_order(), ids);
    assert!(h.consumer.health().is_healthy());

    h.stop().await;
}

#[tokio::test]
async fn test_rebalance_loses_and_duplicates_nothing() {
    let h = Harness::start(Options {
        members: 1,
        batch_size: 5,
        ..Options::default()
    })
    .await;

    let mut published = 0;
    for round in 0..3 {
        for i in 0..15 {
            let envelope = safety_alert(Uuid::new_v4(), &format!("r{}-{}", round, i));
            h.publish(Channel::SafetyAlerts, &envelope).await;
            published += 1;
        }
        let summary = h.consumer.rebalance([3, 2, 1][round]).await;
        assert_eq!(summary.members, [3, 2, 1][round]);
    }

    eventually("every record persisted", || async { h.store.len() == published }).await;
    eventually("every record delivered", || async { h.channel.sent().len() == published }).await;

    let stats = h.consumer.stats();
    assert_eq!(stats.persisted, published as u64);
    assert_eq!(stats.duplicates, 0);

    let assignment = h.consumer.assignment().await;
    assert_eq!(assignment.members(), 1);
    assert_eq!(assignment.len(), h.topics.inbound_topics().len() * 4);
    assert_eq!(h.consumer.member_count().await, 1);

    h.stop().await;
}

#[tokio::test]
async fn test_backpressure_pauses_and_resumes() {
    let h = Harness::start(Options {
        partitions: 1,
        members: 1,
        batch_size: 1,
        max_pending: 2,
        max_delivery_attempts: 10,
        send_timeout: Duration::from_secs(30),
        channel_open: false,
        ..Options::default()
    })
    .await;
    let recipient = Uuid::new_v4();

    for i in 0..10 {
        h.publish(Channel::SafetyAlerts, &safety_alert(recipient, &format!("bp-{}", i)))
            .await;
    }

    eventually("consumption paused", || async { h.gate.is_paused() }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.len() < 10, "consumer kept persisting while paused");

    h.channel.release();
    eventually("backlog delivered", || async { h.channel.sent().len() == 10 }).await;
    eventually("gate drained", || async { h.gate.depth() == 0 }).await;
    assert!(!h.gate.is_paused());

    h.stop().await;
}

#[tokio::test]
async fn test_store_outage_halts_then_resumes() {
    let h = Harness::start(Options {
        partitions: 1,
        ..Options::default()
    })
    .await;
    h.store.set_failing(true);

    let recipient = Uuid::new_v4();
    let first = safety_alert(recipient, "during-outage");
    let second = safety_alert(recipient, "after-outage");
    let (tp, _) = h.publish(Channel::SafetyAlerts, &first).await;
    h.publish(Channel::SafetyAlerts, &second).await;

    eventually("partition halted", || async { !h.consumer.health().is_healthy() }).await;
    let snapshot = h.consumer.health().snapshot();
    assert_eq!(snapshot.status, "degraded");
    assert_eq!(snapshot.halted.len(), 1);
    assert_eq!(snapshot.halted[0].topic, tp.topic);
    assert_eq!(h.committed(&tp).await, None);
    assert!(h.dead_letters().is_empty());

    h.store.set_failing(false);
    eventually("both records persisted", || async { h.store.len() == 2 }).await;
    eventually("partition healthy again", || async { h.consumer.health().is_healthy() }).await;
    eventually("offset committed", || async { h.committed(&tp).await.is_some() }).await;

    assert_eq!(h.store.upsert_order(), vec![first.id, second.id]);
    assert!(h.consumer.stats().halts >= 1);

    h.stop().await;
}
