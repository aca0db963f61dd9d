//! Canonical wire format for every message crossing the broker.
//!
//! An [`Envelope`] carries one domain event. Its `id` is assigned once by the
//! producer and survives broker redelivery, which makes it the de-duplication
//! key for everything downstream.

mod codec;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use codec::{decode, encode, DecodeError, CURRENT_VERSION, SUPPORTED_VERSIONS};

/// Event envelope, serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique per produced message
    pub id: Uuid,
    /// When the producer emitted the event
    pub timestamp: DateTime<Utc>,
    /// Event type (e.g., "safety.alert", "kid.direct_message")
    #[serde(rename = "type")]
    pub event_type: String,
    /// Schema version of this envelope
    pub version: String,
    /// Event payload
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Free-form producer metadata, kept in key order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Correlation ID propagated across every pipeline stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Producing service
    pub source: String,
}

impl Envelope {
    /// Create a builder for an envelope of the given type.
    pub fn builder(event_type: impl Into<String>, source: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(event_type, source)
    }

    /// Raw recipient reference carried by the event, if any.
    ///
    /// Looks at `payload.recipientId`, then `payload.userId`, then
    /// `metadata.recipientId`.
    pub fn recipient_ref(&self) -> Option<&str> {
        ["recipientId", "userId"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(|v| v.as_str()))
            .or_else(|| self.metadata.get("recipientId").and_then(|v| v.as_str()))
    }

    /// Recipient ID parsed as a UUID.
    pub fn recipient_id(&self) -> Option<Uuid> {
        self.recipient_ref().and_then(|r| Uuid::parse_str(r).ok())
    }

    /// Partition key for this envelope: the recipient when known, else the id.
    pub fn partition_key(&self) -> String {
        self.recipient_ref()
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Correlation ID, falling back to the envelope id for tracing.
    pub fn trace_id(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Builder for creating envelopes
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
    event_type: String,
    version: String,
    payload: serde_json::Value,
    metadata: BTreeMap<String, serde_json::Value>,
    correlation_id: Option<String>,
    source: String,
}

impl EnvelopeBuilder {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: None,
            event_type: event_type.into(),
            version: CURRENT_VERSION.to_string(),
            payload: serde_json::Value::Null,
            metadata: BTreeMap::new(),
            correlation_id: None,
            source: source.into(),
        }
    }

    /// Use a fixed id instead of a fresh one (replays, tests)
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event_type: self.event_type,
            version: self.version,
            payload: self.payload,
            metadata: self.metadata,
            correlation_id: self.correlation_id,
            source: self.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let envelope = Envelope::builder("user.follow", "social-service").build();
        assert_eq!(envelope.version, CURRENT_VERSION);
        assert_eq!(envelope.event_type, "user.follow");
        assert!(envelope.metadata.is_empty());
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_recipient_lookup_order() {
        let recipient = Uuid::new_v4();
        let other = Uuid::new_v4();
        let envelope = Envelope::builder("user.follow", "social-service")
            .payload(json!({ "recipientId": recipient.to_string(), "userId": other.to_string() }))
            .build();
        assert_eq!(envelope.recipient_id(), Some(recipient));

        let envelope = Envelope::builder("user.follow", "social-service")
            .payload(json!({ "userId": other.to_string() }))
            .build();
        assert_eq!(envelope.recipient_id(), Some(other));

        let envelope = Envelope::builder("user.follow", "social-service")
            .metadata("recipientId", json!(recipient.to_string()))
            .build();
        assert_eq!(envelope.recipient_id(), Some(recipient));
    }

    #[test]
    fn test_invalid_recipient_is_none() {
        let envelope = Envelope::builder("user.follow", "social-service")
            .payload(json!({ "recipientId": "not-a-uuid" }))
            .build();
        assert_eq!(envelope.recipient_ref(), Some("not-a-uuid"));
        assert!(envelope.recipient_id().is_none());
    }

    #[test]
    fn test_partition_key_falls_back_to_id() {
        let envelope = Envelope::builder("system.maintenance", "ops").build();
        assert_eq!(envelope.partition_key(), envelope.id.to_string());
    }

    #[test]
    fn test_trace_id_prefers_correlation_id() {
        let envelope = Envelope::builder("safety.alert", "moderation")
            .correlation_id("req-42")
            .build();
        assert_eq!(envelope.trace_id(), "req-42");
    }
}
