use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crate::broker::{BrokerError, Producer};
use crate::consumer::ConsumerGroupManager;
use crate::envelope::Envelope;
use crate::metrics::HealthMetrics;
use crate::notification::DeliveryDispatcher;
use crate::resilience::CircuitBreaker;
use crate::router::Channel;

pub const HEARTBEAT_EVENT_TYPE: &str = "system.health.heartbeat";

/// Publishes a liveness envelope with pipeline counters on the system health channel.
pub struct HeartbeatTask {
    producer: Producer,
    consumer: Arc<ConsumerGroupManager>,
    dispatcher: Arc<DeliveryDispatcher>,
    circuit_breakers: Vec<Arc<CircuitBreaker>>,
    source: String,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        producer: Producer,
        consumer: Arc<ConsumerGroupManager>,
        dispatcher: Arc<DeliveryDispatcher>,
        circuit_breakers: Vec<Arc<CircuitBreaker>>,
        source: impl Into<String>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            producer,
            consumer,
            dispatcher,
            circuit_breakers,
            source: source.into(),
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "Heartbeat task started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.beat().await {
                        tracing::warn!(error = %e, "Failed to publish heartbeat");
                    }
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Build the heartbeat envelope from current pipeline state.
    pub fn heartbeat(&self) -> Envelope {
        let health = self.consumer.health().snapshot();
        let breakers: serde_json::Map<String, serde_json::Value> = self
            .circuit_breakers
            .iter()
            .map(|cb| {
                let state = cb.state();
                HealthMetrics::set_circuit_state(cb.name(), state);
                (cb.name().to_string(), json!(state.as_str()))
            })
            .collect();

        Envelope::builder(HEARTBEAT_EVENT_TYPE, self.source.clone())
            .payload(json!({
                "status": health.status,
                "assignedPartitions": health.assigned_partitions,
                "halted": health.halted,
                "consumer": self.consumer.stats(),
                "dispatcher": self.dispatcher.stats(),
                "circuitBreakers": breakers,
            }))
            .build()
    }

    pub async fn beat(&self) -> Result<(), BrokerError> {
        let envelope = self.heartbeat();
        self.producer
            .publish_envelope(Channel::SystemHealth, &envelope)
            .await?;
        HealthMetrics::record_heartbeat();
        tracing::debug!(heartbeat_id = %envelope.id, "Heartbeat published");
        Ok(())
    }
}
