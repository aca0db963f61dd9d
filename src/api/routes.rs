use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::events::publish_event;
use super::health::{health, stats};
use super::inbox::{
    delete_notification, get_notification, list_unread, mark_all_read, mark_read, unread_count,
};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                // Recipient inbox
                .route(
                    "/recipients/{recipient_id}/notifications/unread",
                    get(list_unread),
                )
                .route(
                    "/recipients/{recipient_id}/notifications/unread/count",
                    get(unread_count),
                )
                .route(
                    "/recipients/{recipient_id}/notifications/read-all",
                    post(mark_all_read),
                )
                // Single notification
                .route(
                    "/notifications/{id}",
                    get(get_notification).delete(delete_notification),
                )
                .route("/notifications/{id}/read", post(mark_read))
                // Producer gateway
                .route("/events/{channel}", post(publish_event)),
        )
}
