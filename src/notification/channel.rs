//! Downstream delivery channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::redis::{PoolError, RedisPool};
use crate::resilience::Retryable;

use super::Notification;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Nobody is listening for this recipient right now
    #[error("Recipient {0} is offline")]
    RecipientOffline(Uuid),

    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The channel refused the notification for good
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Redis(e) => e.is_transient(),
            DeliveryError::RecipientOffline(_)
            | DeliveryError::Timeout(_)
            | DeliveryError::Unavailable(_) => true,
            DeliveryError::Serialization(_) | DeliveryError::Rejected(_) => false,
        }
    }
}

impl Retryable for DeliveryError {
    fn is_transient(&self) -> bool {
        DeliveryError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        DeliveryError::Timeout(after)
    }
}

/// Best-effort push of a notification to its recipient.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, recipient_id: Uuid, notification: &Notification)
        -> Result<(), DeliveryError>;
}

/// Message published to a recipient's push channel.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    notification: &'a Notification,
}

/// Publishes to `{prefix}:{recipient_id}` over Redis pub/sub.
///
/// Zero receivers means the recipient has no live session, which is reported
/// as [`DeliveryError::RecipientOffline`] so the attempt is retried later.
pub struct RedisPushChannel {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisPushChannel {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn channel_name(&self, recipient_id: Uuid) -> String {
        format!("{}:{}", self.prefix, recipient_id)
    }
}

#[async_trait]
impl DeliveryChannel for RedisPushChannel {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn send(
        &self,
        recipient_id: Uuid,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let message = serde_json::to_string(&PushMessage {
            message_type: "notification",
            notification,
        })?;

        let receivers = self
            .pool
            .publish(&self.channel_name(recipient_id), &message)
            .await?;

        if receivers == 0 {
            return Err(DeliveryError::RecipientOffline(recipient_id));
        }

        tracing::debug!(
            recipient_id = %recipient_id,
            notification_id = %notification.id,
            receivers = receivers,
            "Notification pushed"
        );
        Ok(())
    }
}

/// Logs every notification and reports success. Development only.
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        recipient_id: Uuid,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            recipient_id = %recipient_id,
            notification_id = %notification.id,
            kind = %notification.kind,
            title = %notification.payload.title,
            "Delivered notification (log channel)"
        );
        Ok(())
    }
}

/// Create the delivery channel selected by `delivery.channel`.
pub fn create_delivery_channel(
    config: &DeliveryConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Result<Arc<dyn DeliveryChannel>, DeliveryError> {
    match config.channel.as_str() {
        "redis" => {
            let pool = redis_pool.ok_or_else(|| {
                DeliveryError::Unavailable("redis channel requested but no Redis pool".into())
            })?;
            tracing::info!(channel = "redis", prefix = %config.push_prefix, "Creating Redis push channel");
            Ok(Arc::new(RedisPushChannel::new(pool, config.push_prefix.clone())))
        }
        _ => {
            tracing::info!(channel = "log", "Creating log delivery channel");
            Ok(Arc::new(LogChannel))
        }
    }
}
