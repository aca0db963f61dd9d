//! Delivery dispatcher: bounded worker pool driving the delivery state machine.
//!
//! Jobs arrive on an unbounded queue (the consumer's backpressure gate bounds
//! it) and run under a semaphore. Each attempt increments the stored attempt
//! counter, sends with a timeout, and on success marks the record delivered.
//! A failed attempt is re-queued after an exponential delay until
//! `max_attempts` is reached, then the notification is dead-lettered. Failures
//! never roll a stored record back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::consumer::DepthGuard;
use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::metrics::DeliveryMetrics;
use crate::resilience::BackoffConfig;
use crate::store::{with_timeout, NotificationStore, StoreError};

use super::{DeliveryChannel, DeliveryEvent, DeliveryState, Notification};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub workers: usize,
    pub send_timeout: Duration,
    pub store_timeout: Duration,
}

impl DispatcherConfig {
    pub fn from_settings(delivery: &DeliveryConfig, store_timeout_ms: u64) -> Self {
        Self {
            max_attempts: delivery.max_attempts.max(1),
            backoff: BackoffConfig {
                initial_delay_ms: delivery.initial_backoff_ms,
                max_delay_ms: delivery.max_backoff_ms,
                ..BackoffConfig::default()
            },
            workers: delivery.workers.max(1),
            send_timeout: Duration::from_millis(delivery.send_timeout_ms),
            store_timeout: Duration::from_millis(store_timeout_ms),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&DeliveryConfig::default(), 5_000)
    }
}

/// One queued delivery.
struct DeliveryJob {
    notification: Notification,
    /// Held until the job finishes, so queued deliveries count as pending
    _depth: Option<DepthGuard>,
}

/// Cloneable submission side of the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<DeliveryJob>,
    in_flight: Arc<DashSet<Uuid>>,
    stats: Arc<DispatcherStats>,
}

impl DispatchHandle {
    /// Queue a notification for delivery.
    ///
    /// Returns false when the same notification is already queued or being
    /// delivered, or when the dispatcher has stopped.
    pub fn submit(&self, notification: Notification, depth: Option<DepthGuard>) -> bool {
        if !self.in_flight.insert(notification.id) {
            return false;
        }
        let id = notification.id;
        let job = DeliveryJob {
            notification,
            _depth: depth,
        };
        if self.tx.send(job).is_err() {
            self.in_flight.remove(&id);
            return false;
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        DeliveryMetrics::set_in_flight(self.in_flight.len());
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub submitted: AtomicU64,
    pub attempts: AtomicU64,
    pub delivered: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub skipped: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub submitted: u64,
    pub attempts: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    /// Expired, deleted or already delivered when the job ran
    pub skipped: u64,
}

/// What a single attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Delivered,
    Retry(Duration),
    DeadLettered,
    Skipped,
}

pub struct DeliveryDispatcher {
    store: Arc<dyn NotificationStore>,
    channel: Arc<dyn DeliveryChannel>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
    handle: DispatchHandle,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryJob>>>,
    stats: Arc<DispatcherStats>,
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        channel: Arc<dyn DeliveryChannel>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DispatcherStats::default());
        Arc::new(Self {
            store,
            channel,
            dead_letters,
            semaphore: Arc::new(Semaphore::new(config.workers)),
            config,
            handle: DispatchHandle {
                tx,
                in_flight: Arc::new(DashSet::new()),
                stats: stats.clone(),
            },
            rx: Mutex::new(Some(rx)),
            stats,
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Re-submit a stored, still undelivered notification.
    pub fn submit_redelivery(&self, notification: Notification) -> bool {
        self.handle.submit(notification, None)
    }

    /// Pull jobs until shutdown, then wait for running attempts to finish.
    ///
    /// Jobs still queued at shutdown stay undelivered in the store and are
    /// picked up by the redelivery scanner after restart.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            tracing::warn!("Delivery dispatcher already running");
            return;
        };

        tracing::info!(
            workers = self.config.workers,
            channel = self.channel.name(),
            max_attempts = self.config.max_attempts,
            "Delivery dispatcher started"
        );

        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let permit = tokio::select! {
                        permit = self.semaphore.clone().acquire_owned() => permit,
                        _ = shutdown.recv() => {
                            self.release(job.notification.id);
                            break;
                        }
                    };
                    let Ok(permit) = permit else { break };

                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        dispatcher.process(job).await;
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        // Every worker holds one permit; taking them all waits for the drain
        let workers = self.config.workers as u32;
        if let Ok(all) = self.semaphore.acquire_many(workers).await {
            drop(all);
        }
        tracing::info!(stats = ?self.stats.snapshot(), "Delivery dispatcher stopped");
    }

    async fn process(self: Arc<Self>, job: DeliveryJob) {
        let id = job.notification.id;
        match self.attempt(&job.notification).await {
            AttemptOutcome::Retry(delay) => {
                let tx = self.handle.tx.clone();
                let in_flight = self.handle.in_flight.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(job).is_err() {
                        in_flight.remove(&id);
                    }
                });
            }
            AttemptOutcome::Delivered | AttemptOutcome::DeadLettered | AttemptOutcome::Skipped => {
                self.release(id);
            }
        }
    }

    fn release(&self, id: Uuid) {
        self.handle.in_flight.remove(&id);
        DeliveryMetrics::set_in_flight(self.handle.in_flight.len());
    }

    #[tracing::instrument(
        name = "dispatcher.attempt",
        skip(self, queued),
        fields(notification_id = %queued.id, recipient_id = %queued.recipient_id, kind = %queued.kind)
    )]
    async fn attempt(&self, queued: &Notification) -> AttemptOutcome {
        // The queued copy can be stale after a retry delay
        let notification = match with_timeout(self.config.store_timeout, self.store.get(queued.id)).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::debug!("Notification deleted before delivery");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not load notification for delivery");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return AttemptOutcome::Skipped;
            }
        };
        let notification = &notification;

        let now = Utc::now();
        if notification.is_expired(now) {
            tracing::debug!("Skipping expired notification");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return AttemptOutcome::Skipped;
        }

        let max_attempts = self.config.max_attempts;
        let state = match DeliveryState::of(notification, max_attempts).transition(DeliveryEvent::Attempt) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(error = %e, "Notification not eligible for delivery");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return AttemptOutcome::Skipped;
            }
        };

        let attempts = match with_timeout(
            self.config.store_timeout,
            self.store.record_delivery_attempt(notification.id),
        )
        .await
        {
            Ok(attempts) => attempts,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!("Notification deleted before delivery");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                // Nothing was sent; the redelivery scanner picks it up later
                tracing::warn!(error = %e, "Could not record delivery attempt");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return AttemptOutcome::Skipped;
            }
        };
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let sent = tokio::time::timeout(
            self.config.send_timeout,
            self.channel.send(notification.recipient_id, notification),
        )
        .await
        .unwrap_or(Err(super::DeliveryError::Timeout(self.config.send_timeout)));

        match sent {
            Ok(()) => {
                let _ = state.transition(DeliveryEvent::Succeeded);
                DeliveryMetrics::record_success(
                    notification.kind.as_str(),
                    start.elapsed().as_secs_f64(),
                );
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = with_timeout(
                    self.config.store_timeout,
                    self.store.mark_delivered(notification.id, Utc::now()),
                )
                .await
                {
                    // Sent but not recorded: a later redelivery may duplicate the push
                    tracing::warn!(error = %e, "Delivered but failed to mark delivered");
                }
                tracing::debug!(attempts = attempts, "Notification delivered");
                AttemptOutcome::Delivered
            }
            Err(e) => {
                self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_failure(match e {
                    super::DeliveryError::Timeout(_) => "timeout",
                    _ => "failure",
                });

                let exhausted = !e.is_transient() || attempts >= max_attempts;
                let event = if exhausted {
                    DeliveryEvent::Exhausted
                } else {
                    DeliveryEvent::Failed
                };
                let next = state.transition(event).unwrap_or(state);

                if next == DeliveryState::DeadLettered {
                    self.dead_letter(notification, attempts, &e.to_string()).await;
                    return AttemptOutcome::DeadLettered;
                }

                let delay = self.config.backoff.delay_for_attempt(attempts);
                tracing::debug!(
                    attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery failed, retry scheduled"
                );
                AttemptOutcome::Retry(delay)
            }
        }
    }

    async fn dead_letter(&self, notification: &Notification, attempts: u32, detail: &str) {
        let mut record = notification.clone();
        record.delivery_attempts = attempts;
        let letter = DeadLetter::from_notification(&record, DeadLetterReason::DeliveryExhausted, detail);

        match self.dead_letters.publish(&letter).await {
            Ok(()) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The stored record keeps its exhausted attempt count, so its
                // state still reads as dead-lettered
                tracing::error!(error = %e, "Failed to publish delivery dead letter");
            }
        }
    }
}
