//! Redis connectivity shared by the streams broker and the push channel.

mod pool;

pub use pool::{PoolError, RedisPool};
