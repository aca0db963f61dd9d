//! Wiring of every pipeline component from [`Settings`].
//!
//! Startup is fail-fast: an unreachable broker or store, or an invalid
//! configuration, is returned as an error before anything is consumed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{create_broker, with_timeout, BrokerError, Producer};
use crate::config::Settings;
use crate::consumer::{
    upsert_retry_policy, BackpressureGate, ConsumerGroupConfig, ConsumerGroupManager,
    PipelineHealth, RecordPipeline,
};
use crate::deadletter::BrokerDeadLetterSink;
use crate::notification::{
    create_delivery_channel, DeliveryDispatcher, DeliveryError, DispatcherConfig,
};
use crate::postgres::{PostgresPool, PostgresPoolError};
use crate::redis::{PoolError, RedisPool};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::router::TopicMap;
use crate::server::AppState;
use crate::shutdown::{GracefulShutdown, ShutdownResult};
use crate::store::{create_notification_store, StoreError};
use crate::tasks::{HeartbeatTask, RedeliveryScanner, RetentionSweeper};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("redis unavailable: {0}")]
    Redis(#[from] PoolError),

    #[error("postgres unavailable: {0}")]
    Postgres(#[from] PostgresPoolError),

    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("delivery channel unavailable: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Fully wired pipeline, not yet consuming.
pub struct Runtime {
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn build(settings: Settings) -> Result<Self, StartupError> {
        settings.validate()?;

        let broker_timeout = Duration::from_millis(settings.broker.operation_timeout_ms);
        let store_timeout = Duration::from_millis(settings.store.operation_timeout_ms);

        let needs_redis = settings.broker.backend == "redis" || settings.delivery.channel == "redis";
        let redis_pool = if needs_redis {
            let breaker = Arc::new(CircuitBreaker::with_config(
                "redis",
                CircuitBreakerConfig {
                    failure_threshold: settings.redis.circuit_breaker_failure_threshold,
                    success_threshold: settings.redis.circuit_breaker_success_threshold,
                    reset_timeout_ms: settings.redis.circuit_breaker_reset_timeout_seconds * 1000,
                },
            ));
            let pool = Arc::new(RedisPool::new(settings.redis.clone(), breaker)?);
            pool.ping().await?;
            tracing::info!("Redis connection verified");
            Some(pool)
        } else {
            None
        };

        let postgres_pool = if settings.store.backend == "postgres" {
            let breaker = Arc::new(CircuitBreaker::new("postgres"));
            let pool = Arc::new(PostgresPool::new(&settings.database, breaker).await?);
            pool.ping().await?;
            tracing::info!(url = %pool.database_url_masked(), "PostgreSQL connection verified");
            Some(pool)
        } else {
            None
        };

        let broker = create_broker(&settings.broker, redis_pool.clone())?;
        with_timeout(broker_timeout, broker.ping()).await?;

        let store = create_notification_store(&settings.store, postgres_pool.clone()).await?;
        store.ping().await?;

        let topics = TopicMap::new(settings.topics.clone());
        let producer = Producer::new(broker.clone(), topics.clone(), broker_timeout);
        let dead_letters = Arc::new(BrokerDeadLetterSink::new(producer.clone()));

        let channel = create_delivery_channel(&settings.delivery, redis_pool.clone())?;
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            channel,
            dead_letters.clone(),
            DispatcherConfig::from_settings(&settings.delivery, settings.store.operation_timeout_ms),
        );

        let pipeline = Arc::new(RecordPipeline::new(
            store.clone(),
            dead_letters,
            dispatcher.handle(),
            BackpressureGate::new(settings.consumer.max_pending),
            upsert_retry_policy(&settings.consumer, store_timeout),
            topics.clone(),
        ));

        let consumer = Arc::new(ConsumerGroupManager::new(
            broker.clone(),
            pipeline,
            Arc::new(PipelineHealth::new()),
            topics.inbound_topics(),
            ConsumerGroupConfig::from_settings(&settings.consumer, &settings.broker),
        ));

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            state: AppState {
                settings: Arc::new(settings),
                broker,
                producer,
                store,
                consumer,
                dispatcher,
                redis_pool,
                postgres_pool,
                start_time: Instant::now(),
            },
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Spawn the dispatcher and background tasks, then join the consumer group.
    pub async fn start(&mut self) {
        let state = &self.state;
        let settings = &state.settings;
        let store_timeout = Duration::from_millis(settings.store.operation_timeout_ms);

        self.tasks.push(tokio::spawn(
            state.dispatcher.clone().run(self.shutdown_tx.subscribe()),
        ));

        if settings.retention.enabled {
            let sweeper = RetentionSweeper::new(
                state.store.clone(),
                Duration::from_secs(settings.retention.interval_seconds),
                store_timeout,
                self.shutdown_tx.subscribe(),
            );
            self.tasks.push(tokio::spawn(sweeper.run()));
        }

        let scanner = RedeliveryScanner::new(
            state.store.clone(),
            state.dispatcher.clone(),
            Duration::from_secs(settings.delivery.redelivery_interval_seconds),
            Duration::from_secs(settings.delivery.redelivery_min_age_seconds),
            settings.delivery.redelivery_batch_size,
            store_timeout,
            self.shutdown_tx.subscribe(),
        );
        self.tasks.push(tokio::spawn(scanner.run()));

        if settings.heartbeat.enabled {
            let breakers = state
                .redis_pool
                .iter()
                .map(|p| p.circuit_breaker().clone())
                .chain(state.postgres_pool.iter().map(|p| p.circuit_breaker().clone()))
                .collect();
            let heartbeat = HeartbeatTask::new(
                state.producer.clone(),
                state.consumer.clone(),
                state.dispatcher.clone(),
                breakers,
                settings.otel.service_name.clone(),
                Duration::from_secs(settings.heartbeat.interval_seconds),
                self.shutdown_tx.subscribe(),
            );
            self.tasks.push(tokio::spawn(heartbeat.run()));
        }

        let summary = state.consumer.start().await;
        tracing::info!(
            members = summary.members,
            partitions = summary.assigned,
            tasks = self.tasks.len(),
            "Pipeline started"
        );
    }

    /// Stop consuming, drain delivery and tasks, close pools.
    pub async fn shutdown(self, reason: &str) -> ShutdownResult {
        let shutdown = GracefulShutdown::new(
            self.state.consumer.clone(),
            self.state.dispatcher.clone(),
            self.shutdown_tx.clone(),
        );
        let result = shutdown.execute(reason, self.tasks).await;

        if let Some(pool) = &self.state.postgres_pool {
            pool.close().await;
        }
        result
    }
}
