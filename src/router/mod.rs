//! Topic router: event type to notification kind, and logical channel to topic.
//!
//! Classification is a static longest-prefix table over the envelope's
//! `type`. A prefix matches the whole type or a leading segment followed by
//! `.` or `_`, so `safety.alert` and `safety_alert` both route to
//! [`NotificationKind::SafetyAlert`] while `safetynet.x` does not.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::config::TopicsConfig;
use crate::envelope::Envelope;
use crate::notification::NotificationKind;

/// Static prefix table. Longer prefixes win.
const ROUTES: &[(&str, NotificationKind)] = &[
    ("safety", NotificationKind::SafetyAlert),
    ("kid", NotificationKind::KidNotification),
    ("parent", NotificationKind::ParentNotification),
    ("repost", NotificationKind::RepostNotification),
    ("educational", NotificationKind::Educational),
    ("education", NotificationKind::Educational),
    ("independence", NotificationKind::IndependenceDay),
    ("system", NotificationKind::SystemGenerated),
    ("grok", NotificationKind::SystemGenerated),
    ("generated", NotificationKind::SystemGenerated),
    ("user", NotificationKind::UserNotification),
    ("social", NotificationKind::UserNotification),
];

/// Event types a kid account may receive.
pub const KID_ALLOWED_EVENT_TYPES: &[&str] = &[
    "comment_on_own_post",
    "direct_message",
    "follow_approved",
    "parent_message",
    "educational_content",
    "safety_reminder",
    "achievement_earned",
    "independence_day_reminder",
];

/// Kid events that go to the parent for approval instead of the kid.
pub const PARENT_APPROVAL_EVENT_TYPES: &[&str] = &[
    "follow_request",
    "message_request",
    "group_invitation",
    "content_share_request",
];

/// Kid notifications scoring below this are withheld.
pub const KID_MIN_SAFETY_SCORE: f64 = 0.8;

/// Case-insensitive substrings that withhold a kid notification when found
/// in its title or message.
pub const KID_BLOCKED_WORDS: &[&str] = &["violence", "adult", "inappropriate"];

/// Outcome of classifying an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Kind(NotificationKind),
    Unroutable,
}

/// Classify an envelope by its event type.
pub fn classify(envelope: &Envelope) -> Route {
    classify_type(&envelope.event_type)
}

pub fn classify_type(event_type: &str) -> Route {
    let event_type = event_type.to_ascii_lowercase();

    ROUTES
        .iter()
        .filter(|(prefix, _)| prefix_matches(&event_type, prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, kind)| Route::Kind(*kind))
        .unwrap_or(Route::Unroutable)
}

fn prefix_matches(event_type: &str, prefix: &str) -> bool {
    match event_type.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || rest.starts_with('_'),
        None => false,
    }
}

/// The specific kid event: `payload.eventType`, falling back to the part of
/// the envelope type after the `kid` prefix.
fn kid_event_type(envelope: &Envelope) -> String {
    envelope
        .payload
        .get("eventType")
        .and_then(|v| v.as_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| {
            let lowered = envelope.event_type.to_ascii_lowercase();
            lowered
                .strip_prefix("kid")
                .map(|rest| rest.trim_start_matches(['.', '_']).to_string())
                .unwrap_or(lowered)
        })
}

/// Kid accounts only receive an allow-listed set of event types.
pub fn kid_event_allowed(envelope: &Envelope) -> bool {
    KID_ALLOWED_EVENT_TYPES.contains(&kid_event_type(envelope).as_str())
}

/// What the safety policy does with a kid-bound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KidDecision {
    /// Deliver to the kid
    Allow,
    /// Deliver to this parent as a parent notification instead
    ParentApproval(Uuid),
    /// Drop, with a reason for logs
    Filter(&'static str),
}

/// Apply the kid safety policy.
///
/// Approval-gated events are re-addressed to `payload.parentId` and
/// filtered when no parent is named. Everything else must be allow-listed,
/// free of blocked words and carry a `payload.safetyScore` of at least
/// [`KID_MIN_SAFETY_SCORE`] (absent counts as fully safe).
pub fn kid_policy(envelope: &Envelope) -> KidDecision {
    let event_type = kid_event_type(envelope);

    if PARENT_APPROVAL_EVENT_TYPES.contains(&event_type.as_str()) {
        return match envelope
            .payload
            .get("parentId")
            .and_then(|v| v.as_str())
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            Some(parent) => KidDecision::ParentApproval(parent),
            None => KidDecision::Filter("parent_approval_required"),
        };
    }

    if !KID_ALLOWED_EVENT_TYPES.contains(&event_type.as_str()) {
        return KidDecision::Filter("event_type_not_allowed");
    }

    if contains_blocked_word(&envelope.payload) {
        return KidDecision::Filter("blocked_content");
    }

    let score = match envelope.payload.get("safetyScore").filter(|v| !v.is_null()) {
        None => 1.0,
        // Unreadable scores fail closed
        Some(v) => v.as_f64().unwrap_or(0.0),
    };
    if score < KID_MIN_SAFETY_SCORE {
        return KidDecision::Filter("safety_score");
    }

    KidDecision::Allow
}

fn contains_blocked_word(payload: &serde_json::Value) -> bool {
    ["title", "message", "body", "content"]
        .iter()
        .filter_map(|k| payload.get(*k).and_then(|v| v.as_str()))
        .map(str::to_lowercase)
        .any(|text| KID_BLOCKED_WORDS.iter().any(|word| text.contains(word)))
}

/// Logical broker channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    UserNotifications,
    KidNotifications,
    ParentNotifications,
    RepostNotifications,
    SafetyAlerts,
    Educational,
    GeneratedResponses,
    SystemHealth,
    DeadLetter,
}

impl Channel {
    /// Channels the consumer group subscribes to.
    pub const INBOUND: [Channel; 7] = [
        Channel::UserNotifications,
        Channel::KidNotifications,
        Channel::ParentNotifications,
        Channel::RepostNotifications,
        Channel::SafetyAlerts,
        Channel::Educational,
        Channel::GeneratedResponses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::UserNotifications => "user",
            Channel::KidNotifications => "kid",
            Channel::ParentNotifications => "parent",
            Channel::RepostNotifications => "repost",
            Channel::SafetyAlerts => "safety",
            Channel::Educational => "educational",
            Channel::GeneratedResponses => "generated",
            Channel::SystemHealth => "system-health",
            Channel::DeadLetter => "dead-letter",
        }
    }

    pub fn is_inbound(&self) -> bool {
        Channel::INBOUND.contains(self)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Channel::UserNotifications),
            "kid" => Ok(Channel::KidNotifications),
            "parent" => Ok(Channel::ParentNotifications),
            "repost" => Ok(Channel::RepostNotifications),
            "safety" => Ok(Channel::SafetyAlerts),
            "educational" => Ok(Channel::Educational),
            "generated" => Ok(Channel::GeneratedResponses),
            "system-health" => Ok(Channel::SystemHealth),
            "dead-letter" => Ok(Channel::DeadLetter),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Channel a kind's notifications are published on.
pub fn outbound_channel(kind: NotificationKind) -> Channel {
    match kind {
        NotificationKind::UserNotification => Channel::UserNotifications,
        NotificationKind::KidNotification => Channel::KidNotifications,
        NotificationKind::ParentNotification => Channel::ParentNotifications,
        NotificationKind::RepostNotification => Channel::RepostNotifications,
        NotificationKind::SafetyAlert => Channel::SafetyAlerts,
        NotificationKind::Educational | NotificationKind::IndependenceDay => Channel::Educational,
        NotificationKind::SystemGenerated => Channel::GeneratedResponses,
    }
}

/// Resolves logical channels to configured topic names.
#[derive(Debug, Clone)]
pub struct TopicMap {
    topics: TopicsConfig,
}

impl TopicMap {
    pub fn new(topics: TopicsConfig) -> Self {
        Self { topics }
    }

    pub fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::UserNotifications => &self.topics.user_notifications,
            Channel::KidNotifications => &self.topics.kid_notifications,
            Channel::ParentNotifications => &self.topics.parent_notifications,
            Channel::RepostNotifications => &self.topics.repost_notifications,
            Channel::SafetyAlerts => &self.topics.safety_alerts,
            Channel::Educational => &self.topics.educational,
            Channel::GeneratedResponses => &self.topics.generated_responses,
            Channel::SystemHealth => &self.topics.system_health,
            Channel::DeadLetter => &self.topics.dead_letter,
        }
    }

    /// Reverse lookup used to label metrics for a fetched record.
    pub fn channel_of(&self, topic: &str) -> Option<Channel> {
        Channel::INBOUND
            .into_iter()
            .chain([Channel::SystemHealth, Channel::DeadLetter])
            .find(|channel| self.topic(*channel) == topic)
    }

    /// Topic names of every inbound channel, deduplicated in channel order.
    pub fn inbound_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for channel in Channel::INBOUND {
            let topic = self.topic(channel);
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        topics
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::new(TopicsConfig::default())
    }
}
