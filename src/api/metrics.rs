//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, ConsumerMetrics, DeliveryMetrics, HealthMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh gauges that are sampled rather than updated in place.
fn update_metrics_from_state(state: &AppState) {
    ConsumerMetrics::set_pending_depth(state.consumer.backpressure().depth());
    DeliveryMetrics::set_in_flight(state.dispatcher.handle().in_flight());

    if let Some(pool) = &state.redis_pool {
        let cb = pool.circuit_breaker();
        HealthMetrics::set_circuit_state(cb.name(), cb.state());
    }
    if let Some(pool) = &state.postgres_pool {
        let cb = pool.circuit_breaker();
        HealthMetrics::set_circuit_state(cb.name(), cb.state());
    }
}
