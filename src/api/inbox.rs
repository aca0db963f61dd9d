//! Recipient inbox endpoints backed by the notification store.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::notification::Notification;
use crate::server::AppState;
use crate::store::{with_timeout, Pagination, DEFAULT_PAGE_SIZE};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct UnreadPageResponse {
    pub recipient_id: Uuid,
    pub page: usize,
    pub page_size: usize,
    pub unread_count: u64,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub recipient_id: Uuid,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub recipient_id: Uuid,
    pub marked: u64,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub id: Uuid,
    /// False when the notification was already read
    pub changed: bool,
}

fn store_timeout(state: &AppState) -> Duration {
    Duration::from_millis(state.settings.store.operation_timeout_ms)
}

/// GET /api/v1/recipients/{recipient_id}/notifications/unread
pub async fn list_unread(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<Json<UnreadPageResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let window = Pagination::from_page(page, query.page_size.unwrap_or(DEFAULT_PAGE_SIZE));
    let timeout = store_timeout(&state);

    let notifications =
        with_timeout(timeout, state.store.list_unread(recipient_id, window)).await?;
    let unread_count = with_timeout(timeout, state.store.unread_count(recipient_id)).await?;

    Ok(Json(UnreadPageResponse {
        recipient_id,
        page,
        page_size: window.limit,
        unread_count,
        notifications,
    }))
}

/// GET /api/v1/recipients/{recipient_id}/notifications/unread/count
pub async fn unread_count(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
) -> Result<Json<UnreadCountResponse>> {
    let unread_count =
        with_timeout(store_timeout(&state), state.store.unread_count(recipient_id)).await?;
    Ok(Json(UnreadCountResponse {
        recipient_id,
        unread_count,
    }))
}

/// POST /api/v1/recipients/{recipient_id}/notifications/read-all
pub async fn mark_all_read(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
) -> Result<Json<MarkAllReadResponse>> {
    let read_at = Utc::now();
    let marked = with_timeout(
        store_timeout(&state),
        state.store.mark_all_read(recipient_id, read_at),
    )
    .await?;

    tracing::info!(recipient_id = %recipient_id, marked = marked, "Marked all notifications read");
    Ok(Json(MarkAllReadResponse {
        recipient_id,
        marked,
        read_at,
    }))
}

/// GET /api/v1/notifications/{id}
pub async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>> {
    with_timeout(store_timeout(&state), state.store.get(id))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("notification {}", id)))
}

/// POST /api/v1/notifications/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MarkReadResponse>> {
    let changed = with_timeout(store_timeout(&state), state.store.mark_read(id, Utc::now())).await?;
    Ok(Json(MarkReadResponse { id, changed }))
}

/// DELETE /api/v1/notifications/{id}
pub async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    if with_timeout(store_timeout(&state), state.store.delete(id)).await? {
        tracing::info!(notification_id = %id, "Notification deleted by recipient");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("notification {}", id)))
    }
}
