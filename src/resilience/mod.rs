//! Fault-tolerance primitives shared by the broker, store and dispatcher.
//!
//! - `CircuitBreaker`: stops hammering a dependency that keeps failing
//! - `BackoffConfig` / `ExponentialBackoff`: delay schedules with jitter
//! - `RetryPolicy`: bounded retries with per-attempt timeouts

mod backoff;
mod circuit_breaker;
mod retry;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::{RetryError, RetryPolicy, Retryable};
