//! Notification records and their delivery.
//!
//! A [`Notification`] is built from an inbound envelope, persisted by the
//! store, then handed to the [`DeliveryDispatcher`], which pushes it through
//! a [`DeliveryChannel`] and tracks its [`DeliveryState`].

mod channel;
mod dispatcher;
mod state;
mod types;

pub use channel::{create_delivery_channel, DeliveryChannel, DeliveryError, LogChannel, RedisPushChannel};
pub use dispatcher::{
    DeliveryDispatcher, DispatchHandle, DispatcherConfig, DispatcherStats, DispatcherStatsSnapshot,
};
pub use state::{DeliveryEvent, DeliveryState, InvalidTransition};
pub use types::{ClassificationError, Notification, NotificationContent, NotificationKind, Priority};
