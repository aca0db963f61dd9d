use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Kind of notification, derived from the event type by the topic router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum NotificationKind {
    UserNotification,
    KidNotification,
    ParentNotification,
    RepostNotification,
    SafetyAlert,
    Educational,
    IndependenceDay,
    SystemGenerated,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 8] = [
        NotificationKind::UserNotification,
        NotificationKind::KidNotification,
        NotificationKind::ParentNotification,
        NotificationKind::RepostNotification,
        NotificationKind::SafetyAlert,
        NotificationKind::Educational,
        NotificationKind::IndependenceDay,
        NotificationKind::SystemGenerated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::UserNotification => "UserNotification",
            NotificationKind::KidNotification => "KidNotification",
            NotificationKind::ParentNotification => "ParentNotification",
            NotificationKind::RepostNotification => "RepostNotification",
            NotificationKind::SafetyAlert => "SafetyAlert",
            NotificationKind::Educational => "Educational",
            NotificationKind::IndependenceDay => "IndependenceDay",
            NotificationKind::SystemGenerated => "SystemGenerated",
        }
    }

    /// Priority used when the event does not carry one.
    pub fn default_priority(&self) -> Priority {
        match self {
            NotificationKind::KidNotification => Priority::Low,
            NotificationKind::UserNotification
            | NotificationKind::RepostNotification
            | NotificationKind::Educational
            | NotificationKind::SystemGenerated => Priority::Normal,
            NotificationKind::ParentNotification | NotificationKind::IndependenceDay => {
                Priority::High
            }
            NotificationKind::SafetyAlert => Priority::Critical,
        }
    }

    /// Retention applied when the event does not set an expiry.
    pub fn default_retention(&self) -> Duration {
        match self {
            NotificationKind::UserNotification
            | NotificationKind::RepostNotification
            | NotificationKind::SystemGenerated => Duration::days(7),
            NotificationKind::KidNotification
            | NotificationKind::ParentNotification
            | NotificationKind::Educational
            | NotificationKind::IndependenceDay => Duration::days(30),
            NotificationKind::SafetyAlert => Duration::days(90),
        }
    }

    fn default_title(&self) -> &'static str {
        match self {
            NotificationKind::UserNotification => "New activity",
            NotificationKind::KidNotification => "New notification",
            NotificationKind::ParentNotification => "Parent notification",
            NotificationKind::RepostNotification => "Your post was reposted",
            NotificationKind::SafetyAlert => "Safety alert",
            NotificationKind::Educational => "Something new to learn",
            NotificationKind::IndependenceDay => "Independence day",
            NotificationKind::SystemGenerated => "System message",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown notification kind '{}'", s))
    }
}

/// Priority levels for notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Priority {
    /// Low priority, can be delayed
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority, should be delivered promptly
    High,
    /// Critical priority, immediate delivery required
    Critical,
}

impl Priority {
    /// Lenient parse for producer-supplied values ("urgent" maps to Critical,
    /// "medium" to Normal).
    pub fn parse_lenient(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" | "medium" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" | "urgent" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Structured content of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    /// Originating event type
    pub event_type: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Original event payload, kept for clients that render richer views
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Why an envelope could not become a notification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("event carries no recipient")]
    MissingRecipient,

    #[error("recipient '{0}' is not a valid UUID")]
    InvalidRecipient(String),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),
}

/// Durable notification record.
///
/// Invariants: `delivered_at` is set only when `delivered`; `is_read`
/// implies `delivered`; `expires_at` never decreases once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Same as the originating envelope id
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub payload: NotificationContent,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
}

impl Notification {
    /// Build the initial record for a classified envelope.
    pub fn from_envelope(
        envelope: &Envelope,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<Self, ClassificationError> {
        let recipient_ref = envelope
            .recipient_ref()
            .ok_or(ClassificationError::MissingRecipient)?;
        let recipient_id = Uuid::parse_str(recipient_ref)
            .map_err(|_| ClassificationError::InvalidRecipient(recipient_ref.to_string()))?;

        let payload = &envelope.payload;
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| payload.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string)
        };

        let priority = text(&["priority", "severity"])
            .and_then(|p| Priority::parse_lenient(&p))
            .unwrap_or_else(|| kind.default_priority());

        let content = NotificationContent {
            event_type: envelope.event_type.clone(),
            title: text(&["title"]).unwrap_or_else(|| kind.default_title().to_string()),
            message: text(&["message", "body", "content"]).unwrap_or_default(),
            priority,
            sender_id: text(&["senderId", "actorId"]),
            data: payload.clone(),
        };

        Ok(Self {
            id: envelope.id,
            recipient_id,
            kind,
            payload: content,
            created_at: now,
            delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            expires_at: Some(resolve_expiry(payload, kind, now)?),
            delivery_attempts: 0,
        })
    }

    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Fold an incoming write for the same id into this record.
    ///
    /// Identity fields and content keep their first-inserted values. Lifecycle
    /// fields only move forward: delivered/read are sticky, their timestamps
    /// keep the first value, expiry and attempt counters take the maximum.
    pub fn merge_from(&mut self, incoming: &Notification) {
        if incoming.delivered && !self.delivered {
            self.delivered = true;
            self.delivered_at = incoming.delivered_at;
        }
        if incoming.is_read && !self.is_read {
            self.is_read = true;
            self.read_at = incoming.read_at;
        }
        if self.is_read && !self.delivered {
            self.delivered = true;
            self.delivered_at = self.read_at;
        }
        self.expires_at = self.expires_at.max(incoming.expires_at);
        self.delivery_attempts = self.delivery_attempts.max(incoming.delivery_attempts);
    }

    /// Mark delivered; false when already delivered.
    pub fn apply_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        self.delivered_at = Some(at);
        true
    }

    /// Mark read (and delivered, since reading proves delivery); false when
    /// already read.
    pub fn apply_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.apply_delivered(at);
        self.is_read = true;
        self.read_at = Some(at);
        true
    }
}

/// Expiry from `payload.expiresAt` (RFC 3339), `payload.ttlSeconds`, or the
/// kind's default retention.
fn resolve_expiry(
    payload: &serde_json::Value,
    kind: NotificationKind,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ClassificationError> {
    if let Some(raw) = payload.get("expiresAt").filter(|v| !v.is_null()) {
        let text = raw
            .as_str()
            .ok_or_else(|| ClassificationError::InvalidExpiry("expiresAt must be a string".into()))?;
        return DateTime::parse_from_rfc3339(text)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| ClassificationError::InvalidExpiry(e.to_string()));
    }

    let offset = match payload.get("ttlSeconds").and_then(|v| v.as_i64()) {
        Some(ttl) => Duration::try_seconds(ttl)
            .ok_or_else(|| ClassificationError::InvalidExpiry(format!("ttlSeconds {} out of range", ttl)))?,
        None => kind.default_retention(),
    };

    now.checked_add_signed(offset)
        .ok_or_else(|| ClassificationError::InvalidExpiry("expiry overflows the supported date range".into()))
}
