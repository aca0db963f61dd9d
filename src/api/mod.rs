//! API layer - HTTP endpoint handlers organized by domain.

mod events;
mod health;
mod inbox;
mod metrics;
mod routes;

pub use events::{publish_event, PublishEventRequest, PublishEventResponse};
pub use health::{health, stats};
pub use inbox::{
    delete_notification, get_notification, list_unread, mark_all_read, mark_read, unread_count,
};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
