//! Redis connection pool shared by the streams broker and the push channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::streams::StreamRangeReply;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::resilience::{CircuitBreaker, CircuitState};

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

impl PoolError {
    /// Connection-level failures are worth retrying; command errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::CircuitOpen => true,
            PoolError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_refusal()
                    || e.is_cluster_error()
            }
        }
    }
}

/// Multiplexed Redis connection guarded by a circuit breaker.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    connected: AtomicBool,
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(config: RedisConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            connected: AtomicBool::new(false),
            config,
        })
    }

    /// Get the shared connection, establishing it on first use.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.connected.store(true, Ordering::Release);
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.connected.store(false, Ordering::Release);
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run a command with connection management and breaker bookkeeping.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    // Force a reconnect on the next call
                    *self.connection.write().await = None;
                    self.connected.store(false, Ordering::Release);
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await.map(|_| ())
        })
        .await
    }

    /// XADD with approximate MAXLEN trimming. Returns the entry id.
    pub async fn xadd_maxlen(
        &self,
        key: &str,
        maxlen: usize,
        fields: &[(&str, &[u8])],
    ) -> Result<String, PoolError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("MAXLEN").arg("~").arg(maxlen).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }

        self.execute(|mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    /// XRANGE from `start` (inclusive unless prefixed with `(`) to the end.
    pub async fn xrange_from(
        &self,
        key: &str,
        start: &str,
        count: usize,
    ) -> Result<StreamRangeReply, PoolError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg(start).arg("+").arg("COUNT").arg(count);

        self.execute(|mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), PoolError> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.execute(|mut conn| async move { conn.hset::<_, _, _, ()>(key, field, value).await })
            .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.execute(|mut conn| async move { conn.hget(key, field).await })
            .await
    }

    /// PUBLISH, returning the number of subscribers that received the message.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u64, PoolError> {
        let (channel, message) = (channel.to_string(), message.to_string());
        self.execute(|mut conn| async move { conn.publish(channel, message).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let cb = Arc::new(CircuitBreaker::new("redis"));
        let pool = RedisPool::new(RedisConfig::default(), cb).unwrap();
        assert_eq!(pool.url(), "redis://localhost:6379");
        // No connection has been attempted yet
        assert!(!pool.is_healthy());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..RedisConfig::default()
        };
        let cb = Arc::new(CircuitBreaker::new("redis"));
        assert!(RedisPool::new(config, cb).is_err());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let cb = Arc::new(CircuitBreaker::new("redis"));
        for _ in 0..5 {
            cb.record_failure();
        }
        let pool = RedisPool::new(RedisConfig::default(), cb).unwrap();
        let err = pool.ping().await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen));
        assert!(err.is_transient());
    }

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::CircuitOpen.to_string(), "Circuit breaker is open");
    }
}
