//! Per-notification delivery state machine.

use serde::Serialize;
use thiserror::Error;

use super::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Created,
    DeliveryAttempted,
    RetryPending,
    Delivered,
    DeadLettered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A send is about to be made
    Attempt,
    /// The channel accepted the notification
    Succeeded,
    /// The channel failed and budget remains
    Failed,
    /// The channel failed and the budget is spent
    Exhausted,
    /// The recipient acknowledged the notification
    Acknowledged,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid delivery transition: {event:?} from {from:?}")]
pub struct InvalidTransition {
    pub from: DeliveryState,
    pub event: DeliveryEvent,
}

impl DeliveryState {
    pub fn transition(self, event: DeliveryEvent) -> Result<DeliveryState, InvalidTransition> {
        use DeliveryEvent::*;
        use DeliveryState::*;

        match (self, event) {
            (Created | RetryPending, Attempt) => Ok(DeliveryAttempted),
            (DeliveryAttempted, Succeeded) => Ok(Delivered),
            (DeliveryAttempted, Failed) => Ok(RetryPending),
            (DeliveryAttempted, Exhausted) => Ok(DeadLettered),
            (Delivered, Acknowledged) => Ok(Read),
            // A recipient can read an in-app record before any push went out
            (Created | RetryPending | DeadLettered, Acknowledged) => Ok(Read),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Read | DeliveryState::DeadLettered)
    }

    /// Best view of a stored record's state.
    ///
    /// The store does not persist in-flight states, so an undelivered record
    /// reads as `Created` before its first attempt, `RetryPending` after a
    /// failed one, and `DeadLettered` once attempts reach `max_attempts`.
    pub fn of(notification: &Notification, max_attempts: u32) -> DeliveryState {
        if notification.is_read {
            DeliveryState::Read
        } else if notification.delivered {
            DeliveryState::Delivered
        } else if notification.delivery_attempts >= max_attempts {
            DeliveryState::DeadLettered
        } else if notification.delivery_attempts > 0 {
            DeliveryState::RetryPending
        } else {
            DeliveryState::Created
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryEvent::*;
    use DeliveryState::*;

    #[test]
    fn test_happy_path() {
        let state = Created.transition(Attempt).unwrap();
        let state = state.transition(Succeeded).unwrap();
        assert_eq!(state, Delivered);
        assert_eq!(state.transition(Acknowledged).unwrap(), Read);
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let state = Created.transition(Attempt).unwrap();
        let state = state.transition(Failed).unwrap();
        assert_eq!(state, RetryPending);
        let state = state.transition(Attempt).unwrap();
        let state = state.transition(Exhausted).unwrap();
        assert_eq!(state, DeadLettered);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Created.transition(Succeeded).is_err());
        assert!(Delivered.transition(Attempt).is_err());
        assert!(Read.transition(Acknowledged).is_err());
        assert!(DeadLettered.transition(Attempt).is_err());
    }
}
