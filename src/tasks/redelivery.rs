use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::metrics::DeliveryMetrics;
use crate::notification::DeliveryDispatcher;
use crate::store::{with_timeout, NotificationStore, StoreError};

/// Re-submits stored notifications that never reached their recipient.
///
/// Covers recipients that were offline when their retries ran out of
/// in-process budget and notifications queued when the process stopped.
pub struct RedeliveryScanner {
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<DeliveryDispatcher>,
    interval: Duration,
    min_age: Duration,
    batch_size: usize,
    timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl RedeliveryScanner {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<DeliveryDispatcher>,
        interval: Duration,
        min_age: Duration,
        batch_size: usize,
        timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            interval,
            min_age,
            batch_size,
            timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            min_age_secs = self.min_age.as_secs(),
            "Redelivery scanner started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Redelivery scanner received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::warn!(error = %e, "Redelivery scan failed");
                    }
                }
            }
        }

        tracing::info!("Redelivery scanner stopped");
    }

    /// Submit undelivered notifications older than `min_age` that still have
    /// attempts left. Returns how many were queued.
    pub async fn scan_once(&self) -> Result<usize, StoreError> {
        let min_age = chrono::Duration::from_std(self.min_age).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - min_age;
        let max_attempts = self.dispatcher.config().max_attempts;

        let candidates = with_timeout(
            self.timeout,
            self.store.list_undelivered(cutoff, max_attempts, self.batch_size),
        )
        .await?;

        let queued = candidates
            .into_iter()
            .filter(|n| self.dispatcher.submit_redelivery(n.clone()))
            .count();

        if queued > 0 {
            DeliveryMetrics::record_redeliveries(queued);
            tracing::info!(queued = queued, "Undelivered notifications re-submitted");
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Producer};
    use crate::deadletter::BrokerDeadLetterSink;
    use crate::envelope::Envelope;
    use crate::notification::{DispatcherConfig, LogChannel, Notification, NotificationKind};
    use crate::router::TopicMap;
    use crate::store::MemoryNotificationStore;
    use serde_json::json;
    use uuid::Uuid;

    fn notification(attempts: u32) -> Notification {
        aged_notification(attempts, 10)
    }

    fn aged_notification(attempts: u32, age_minutes: i64) -> Notification {
        let envelope = Envelope::builder("parent.alert", "test")
            .payload(json!({ "recipientId": Uuid::new_v4().to_string() }))
            .build();
        let mut n = Notification::from_envelope(
            &envelope,
            NotificationKind::ParentNotification,
            Utc::now() - chrono::Duration::minutes(age_minutes),
        )
        .unwrap();
        n.delivery_attempts = attempts;
        n
    }

    fn dispatcher(store: Arc<MemoryNotificationStore>) -> Arc<DeliveryDispatcher> {
        let broker = Arc::new(MemoryBroker::new(1));
        let producer = Producer::new(broker, TopicMap::default(), Duration::from_secs(1));
        DeliveryDispatcher::new(
            store,
            Arc::new(LogChannel),
            Arc::new(BrokerDeadLetterSink::new(producer)),
            DispatcherConfig {
                max_attempts: 3,
                ..DispatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_scan_skips_exhausted_and_in_flight() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        let fresh = notification(0);
        let retried = notification(2);
        let exhausted = notification(3);
        for n in [&fresh, &retried, &exhausted] {
            store.upsert(n.clone()).await.unwrap();
        }

        let (_tx, rx) = broadcast::channel(1);
        let scanner = RedeliveryScanner::new(
            store,
            dispatcher.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            100,
            Duration::from_secs(1),
            rx,
        );

        assert_eq!(scanner.scan_once().await.unwrap(), 2);
        // Dispatcher is not running, so both stay in flight
        assert_eq!(scanner.scan_once().await.unwrap(), 0);
        assert_eq!(dispatcher.handle().in_flight(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_backlog_does_not_starve_eligible() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());

        // A full batch of exhausted records sorts ahead of the eligible one
        for _ in 0..5 {
            store.upsert(aged_notification(3, 60)).await.unwrap();
        }
        let eligible = aged_notification(0, 10);
        store.upsert(eligible.clone()).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let scanner = RedeliveryScanner::new(
            store,
            dispatcher.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            5,
            Duration::from_secs(1),
            rx,
        );

        assert_eq!(scanner.scan_once().await.unwrap(), 1);
        assert_eq!(dispatcher.handle().in_flight(), 1);
    }
}
