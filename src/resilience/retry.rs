//! Bounded retry with exponential backoff and per-attempt timeouts.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use super::BackoffConfig;

/// Errors that can be classified for retry.
pub trait Retryable: fmt::Display {
    /// Whether retrying the same call can succeed
    fn is_transient(&self) -> bool;

    /// Error used when an attempt exceeds its timeout
    fn timed_out(after: Duration) -> Self;
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently
    Exhausted { attempts: u32, last: E },
    /// A non-transient failure stopped the loop early
    Permanent { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Permanent { attempts, error } => {
                write!(f, "permanent failure on attempt {}: {}", attempts, error)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Upper bound for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Timeouts count as transient failures.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, RetryError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => E::timed_out(self.attempt_timeout),
            };

            if !error.is_transient() {
                return Err(RetryError::Permanent { attempts: attempt, error });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted { attempts: attempt, last: error });
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::debug!(
                operation = operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
