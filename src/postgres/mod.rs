//! PostgreSQL connectivity for the notification store.

mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
