use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::metrics::RetentionMetrics;
use crate::store::{with_timeout, NotificationStore, StoreError};

/// Periodically deletes notifications past their expiry.
pub struct RetentionSweeper {
    store: Arc<dyn NotificationStore>,
    interval: Duration,
    timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        interval: Duration,
        timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            interval,
            timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            backend = self.store.backend_name(),
            "Retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Retention sweeper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    // Failures are retried on the next tick
                    let _ = self.sweep_once().await;
                }
            }
        }

        tracing::info!("Retention sweeper stopped");
    }

    /// Purge everything expired as of now.
    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        let start = Instant::now();
        match with_timeout(self.timeout, self.store.purge_expired(Utc::now())).await {
            Ok(purged) => {
                RetentionMetrics::record_sweep(purged, start.elapsed().as_secs_f64());
                if purged > 0 {
                    tracing::info!(purged = purged, "Expired notifications purged");
                } else {
                    tracing::debug!("Retention sweep found nothing to purge");
                }
                Ok(purged)
            }
            Err(e) => {
                RetentionMetrics::record_failure();
                tracing::warn!(error = %e, "Retention sweep failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::notification::{Notification, NotificationKind};
    use crate::store::MemoryNotificationStore;
    use serde_json::json;
    use uuid::Uuid;

    fn notification(expires_in_secs: i64) -> Notification {
        let envelope = Envelope::builder("user.mention", "test")
            .payload(json!({ "recipientId": Uuid::new_v4().to_string() }))
            .build();
        let mut n =
            Notification::from_envelope(&envelope, NotificationKind::UserNotification, Utc::now())
                .unwrap();
        n.expires_at = Some(Utc::now() + chrono::Duration::seconds(expires_in_secs));
        n
    }

    #[tokio::test]
    async fn test_sweep_purges_only_expired() {
        let store = Arc::new(MemoryNotificationStore::new());
        store.upsert(notification(-10)).await.unwrap();
        let live = notification(3600);
        store.upsert(live.clone()).await.unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(1),
            rx,
        );

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(live.id).await.unwrap().is_some());
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let sweeper = RetentionSweeper::new(
            Arc::new(MemoryNotificationStore::new()),
            Duration::from_secs(300),
            Duration::from_secs(1),
            rx,
        );
        let task = tokio::spawn(sweeper.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
