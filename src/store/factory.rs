//! Notification store factory

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::postgres::PostgresPool;

use super::{MemoryNotificationStore, NotificationStore, PostgresNotificationStore, StoreError};

/// Create the store selected by `store.backend`.
///
/// - `"postgres"`: requires a PostgreSQL pool; the schema is created if missing
/// - `"memory"`: process-local store, lost on restart
pub async fn create_notification_store(
    config: &StoreConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Result<Arc<dyn NotificationStore>, StoreError> {
    match config.backend.as_str() {
        "postgres" => {
            let pool = postgres_pool.ok_or_else(|| {
                StoreError::Unavailable("postgres store requested but no pool".into())
            })?;
            tracing::info!(backend = "postgres", "Creating PostgreSQL notification store");
            let store = PostgresNotificationStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        _ => {
            tracing::info!(backend = "memory", "Creating in-memory notification store");
            Ok(Arc::new(MemoryNotificationStore::new()))
        }
    }
}
