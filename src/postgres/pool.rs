//! PostgreSQL connection pool with circuit breaker integration.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::resilience::CircuitBreaker;

#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

impl PostgresPoolError {
    /// Connection-class failures; constraint or decode errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            PostgresPoolError::CircuitOpen => true,
            PostgresPoolError::Sqlx(e) => is_connection_error(e),
        }
    }
}

fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

/// PostgreSQL connection pool with circuit breaker integration.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    circuit_breaker: Arc<CircuitBreaker>,
    /// Kept for logging only
    database_url: String,
}

impl PostgresPool {
    /// Connect eagerly so an unreachable database fails startup.
    pub async fn new(
        config: &DatabaseConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, PostgresPoolError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64))
            .connect(&config.url)
            .await?;

        tracing::info!(
            pool_size = config.pool_size,
            url = %mask_url(&config.url),
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            pool,
            circuit_breaker,
            database_url: config.url.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Only connection-class failures count against the breaker, so a run of
    /// bad rows cannot take the whole store offline.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        operation: F,
    ) -> Result<T, PostgresPoolError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(PostgresPoolError::CircuitOpen);
        }

        match operation(self.pool.clone()).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    self.circuit_breaker.record_failure();
                }
                Err(PostgresPoolError::Sqlx(e))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), PostgresPoolError> {
        self.execute_with_circuit_breaker(|pool| async move {
            sqlx::query("SELECT 1").execute(&pool).await.map(|_| ())
        })
        .await
    }

    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

/// Replace the password of a connection URL with `***`.
fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // "postgres://user@host" has its only colon in the scheme
            if !url[colon_pos + 1..].starts_with("//") {
                return format!("{}***{}", &url[..colon_pos + 1], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}
