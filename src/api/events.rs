//! Producer gateway: publish an envelope onto an inbound channel over HTTP.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::Offset;
use crate::envelope::Envelope;
use crate::error::{AppError, Result};
use crate::router::Channel;
use crate::server::AppState;

/// Source recorded when the caller does not name one.
const DEFAULT_SOURCE: &str = "http-gateway";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventRequest {
    /// Event type, e.g. "safety.alert"
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    /// Caller-chosen id, making retried publishes idempotent downstream
    pub id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventResponse {
    pub envelope_id: Uuid,
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
}

/// POST /api/v1/events/{channel}
pub async fn publish_event(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(request): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<PublishEventResponse>)> {
    let channel: Channel = channel.parse().map_err(AppError::Validation)?;
    if !channel.is_inbound() {
        return Err(AppError::Validation(format!(
            "channel '{}' does not accept events",
            channel
        )));
    }
    if request.event_type.trim().is_empty() {
        return Err(AppError::Validation("event type must not be empty".to_string()));
    }

    let mut builder = Envelope::builder(
        request.event_type,
        request.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
    )
    .payload(request.payload);
    if let Some(id) = request.id {
        builder = builder.id(id);
    }
    if let Some(correlation_id) = request.correlation_id {
        builder = builder.correlation_id(correlation_id);
    }
    for (key, value) in request.metadata {
        builder = builder.metadata(key, value);
    }
    let envelope = builder.build();

    let (tp, offset) = state.producer.publish_envelope(channel, &envelope).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishEventResponse {
            envelope_id: envelope.id,
            topic: tp.topic,
            partition: tp.partition,
            offset,
            timestamp: envelope.timestamp,
        }),
    ))
}
