//! Health check and statistics endpoints.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::broker::with_timeout as broker_timeout;
use crate::consumer::{ConsumerStatsSnapshot, PipelineHealthSnapshot};
use crate::error::Result;
use crate::notification::DispatcherStatsSnapshot;
use crate::server::AppState;
use crate::store::{with_timeout as store_timeout, StoreStats};

/// Upper bound for each dependency probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pipeline: PipelineHealthSnapshot,
    pub broker: DependencyHealth,
    pub store: DependencyHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    pub backend: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub connected: bool,
    pub circuit_breaker_state: String,
    pub circuit_breaker_failures: u32,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub pool_size: u32,
    pub idle_connections: u32,
    pub circuit_breaker_state: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub group_id: String,
    pub members: usize,
    pub assigned_partitions: usize,
    pub consumer: ConsumerStatsSnapshot,
    pub dispatcher: DispatcherStatsSnapshot,
    pub backpressure: BackpressureStats,
    pub store: StoreStats,
}

#[derive(Debug, Serialize)]
pub struct BackpressureStats {
    pub depth: usize,
    pub paused: bool,
}

/// GET /health - 200 when healthy, 503 when degraded
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pipeline = state.consumer.health().snapshot();

    let broker_probe = broker_timeout(PROBE_TIMEOUT, state.broker.ping()).await;
    let broker = DependencyHealth {
        backend: state.broker.name().to_string(),
        connected: broker_probe.is_ok(),
        error: broker_probe.err().map(|e| e.to_string()),
    };

    let store_probe = store_timeout(PROBE_TIMEOUT, state.store.ping()).await;
    let store = DependencyHealth {
        backend: state.store.backend_name().to_string(),
        connected: store_probe.is_ok(),
        error: store_probe.err().map(|e| e.to_string()),
    };

    let redis = state.redis_pool.as_ref().map(|pool| {
        let cb = pool.circuit_breaker().stats();
        RedisHealthResponse {
            connected: pool.is_healthy(),
            circuit_breaker_state: cb.state.as_str().to_string(),
            circuit_breaker_failures: cb.failure_count,
        }
    });

    let postgres = state.postgres_pool.as_ref().map(|pool| PostgresHealthResponse {
        pool_size: pool.pool().size(),
        idle_connections: pool.pool().num_idle() as u32,
        circuit_breaker_state: pool.circuit_breaker().state().as_str().to_string(),
    });

    let healthy = broker.connected && store.connected && state.consumer.health().is_healthy();
    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            pipeline,
            broker,
            store,
            redis,
            postgres,
        }),
    )
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let store = store_timeout(PROBE_TIMEOUT, state.store.stats()).await?;
    let gate = state.consumer.backpressure();

    Ok(Json(StatsResponse {
        group_id: state.consumer.group_id().to_string(),
        members: state.consumer.member_count().await,
        assigned_partitions: state.consumer.assignment().await.len(),
        consumer: state.consumer.stats(),
        dispatcher: state.dispatcher.stats(),
        backpressure: BackpressureStats {
            depth: gate.depth(),
            paused: gate.is_paused(),
        },
        store,
    }))
}
