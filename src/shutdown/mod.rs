//! Graceful shutdown of the pipeline.
//!
//! Order matters for at-least-once delivery:
//! 1. Stop the consumer group; members finish their batch and commit
//! 2. Signal background tasks and the dispatcher to stop
//! 3. Wait for running delivery attempts and tasks to finish
//!
//! Notifications still queued for delivery stay undelivered in the store and
//! are picked up by the redelivery scanner on the next start.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::consumer::ConsumerGroupManager;
use crate::notification::DeliveryDispatcher;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for consumer members to finish their batch (default: 30 seconds)
    pub consumer_stop_timeout: Duration,
    /// Time to wait for background tasks and delivery workers (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            consumer_stop_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct GracefulShutdown {
    consumer: Arc<ConsumerGroupManager>,
    dispatcher: Arc<DeliveryDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        consumer: Arc<ConsumerGroupManager>,
        dispatcher: Arc<DeliveryDispatcher>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(consumer, dispatcher, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        consumer: Arc<ConsumerGroupManager>,
        dispatcher: Arc<DeliveryDispatcher>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            consumer,
            dispatcher,
            shutdown_tx,
            config,
        }
    }

    /// Run the shutdown sequence. `tasks` are the dispatcher and background
    /// task handles listening on the shutdown channel.
    #[tracing::instrument(name = "graceful_shutdown", skip(self, tasks))]
    pub async fn execute(&self, reason: &str, tasks: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping consumer group");
        result.consumer_stopped = timeout(self.config.consumer_stop_timeout, self.consumer.stop())
            .await
            .is_ok();
        if !result.consumer_stopped {
            tracing::warn!("Consumer group did not stop in time; uncommitted records will replay");
        }

        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!(tasks = tasks.len(), "Phase 3: Draining delivery workers and tasks");
        let total = tasks.len();
        match timeout(self.config.drain_timeout, join_all(tasks)).await {
            Ok(joined) => {
                result.tasks_stopped = joined.iter().filter(|r| r.is_ok()).count();
                for e in joined.into_iter().filter_map(|r| r.err()) {
                    tracing::error!(error = %e, "Background task failed");
                }
            }
            Err(_) => {
                tracing::warn!(total = total, "Background tasks did not stop in time");
            }
        }

        result.pending_deliveries = self.dispatcher.handle().in_flight();
        result.duration = start.elapsed();
        result.success = result.consumer_stopped && result.tasks_stopped == total;

        tracing::info!(
            consumer_stopped = result.consumer_stopped,
            tasks_stopped = result.tasks_stopped,
            pending_deliveries = result.pending_deliveries,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Whether every consumer member committed and exited in time
    pub consumer_stopped: bool,
    pub tasks_stopped: usize,
    /// Deliveries queued but not attempted; left for redelivery
    pub pending_deliveries: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Producer};
    use crate::config::{BrokerConfig, ConsumerConfig};
    use crate::consumer::{
        BackpressureGate, ConsumerGroupConfig, PipelineHealth, RecordPipeline,
    };
    use crate::deadletter::BrokerDeadLetterSink;
    use crate::notification::{DispatcherConfig, LogChannel};
    use crate::resilience::RetryPolicy;
    use crate::router::TopicMap;
    use crate::store::MemoryNotificationStore;

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let broker = Arc::new(MemoryBroker::new(2));
        let store = Arc::new(MemoryNotificationStore::new());
        let producer = Producer::new(broker.clone(), TopicMap::default(), Duration::from_secs(1));
        let sink = Arc::new(BrokerDeadLetterSink::new(producer));
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            Arc::new(LogChannel),
            sink.clone(),
            DispatcherConfig::default(),
        );
        let pipeline = Arc::new(RecordPipeline::new(
            store,
            sink,
            dispatcher.handle(),
            BackpressureGate::new(100),
            RetryPolicy::default(),
            TopicMap::default(),
        ));
        let consumer = Arc::new(ConsumerGroupManager::new(
            broker,
            pipeline,
            Arc::new(PipelineHealth::new()),
            TopicMap::default().inbound_topics(),
            ConsumerGroupConfig::from_settings(&ConsumerConfig::default(), &BrokerConfig::default()),
        ));
        consumer.start().await;

        let (tx, rx) = broadcast::channel(1);
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(rx));

        let shutdown = GracefulShutdown::new(consumer.clone(), dispatcher, tx);
        let result = shutdown.execute("test shutdown", vec![dispatcher_task]).await;

        assert!(result.success);
        assert_eq!(result.tasks_stopped, 1);
        assert_eq!(consumer.member_count().await, 0);
        assert!(consumer.assignment().await.is_empty());
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.consumer_stop_timeout, Duration::from_secs(30));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }
}
