//! Broker factory

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::redis::RedisPool;

use super::{Broker, BrokerError, MemoryBroker, RedisStreamBroker};

/// Create the broker selected by `broker.backend`.
///
/// - `"redis"`: Redis Streams; requires a Redis pool
/// - `"memory"`: process-local broker
///
/// A missing pool for the Redis backend is a startup error.
pub fn create_broker(
    config: &BrokerConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Result<Arc<dyn Broker>, BrokerError> {
    match config.backend.as_str() {
        "redis" => {
            let pool = redis_pool.ok_or_else(|| {
                BrokerError::Unavailable("redis broker requested but no Redis pool".into())
            })?;
            tracing::info!(
                backend = "redis",
                prefix = %config.stream_prefix,
                partitions = config.partitions,
                "Creating Redis Streams broker"
            );
            Ok(Arc::new(RedisStreamBroker::new(pool, config)))
        }
        _ => {
            tracing::info!(
                backend = "memory",
                partitions = config.partitions,
                "Creating in-memory broker"
            );
            Ok(Arc::new(MemoryBroker::new(config.partitions)))
        }
    }
}
