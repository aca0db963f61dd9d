//! Background tasks with their own shutdown receivers.

mod heartbeat;
mod redelivery;
mod retention;

pub use heartbeat::{HeartbeatTask, HEARTBEAT_EVENT_TYPE};
pub use redelivery::RedeliveryScanner;
pub use retention::RetentionSweeper;
