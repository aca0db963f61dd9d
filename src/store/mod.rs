//! Durable notification store.
//!
//! The store is the only shared mutable resource in the pipeline. Every
//! backend guarantees atomic per-document updates and idempotent upsert by
//! notification id: re-processing an envelope never creates a second record,
//! and lifecycle fields only move forward (see [`Notification::merge_from`]).

mod factory;
mod memory_backend;
mod postgres_backend;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::notification::Notification;
use crate::postgres::PostgresPoolError;
use crate::resilience::Retryable;

pub use factory::create_notification_store;
pub use memory_backend::MemoryNotificationStore;
pub use postgres_backend::PostgresNotificationStore;

/// Largest page the inbox API will return.
pub const MAX_PAGE_SIZE: usize = 100;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Notification {0} not found")]
    NotFound(Uuid),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresPoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Temporarily unreachable (also used by fault-injecting test stores)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored row that no longer maps onto a notification
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Postgres(e) => e.is_transient(),
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::NotFound(_) | StoreError::Serialization(_) | StoreError::Corrupt(_) => {
                false
            }
        }
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// First write for this id
    Inserted,
    /// A record already existed; lifecycle fields were merged
    Existing,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Existing => "existing",
        }
    }
}

/// Offset/limit window over a newest-first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// 1-based page number; out-of-range values are clamped.
    pub fn from_page(page: usize, page_size: usize) -> Self {
        let limit = page_size.clamp(1, MAX_PAGE_SIZE);
        Self {
            offset: page.max(1).saturating_sub(1).saturating_mul(limit),
            limit,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub total: u64,
    pub unread: u64,
    pub undelivered: u64,
}

/// Notification persistence contract.
///
/// Listing operations exclude expired records. `mark_*` operations return
/// `Ok(true)` on a transition, `Ok(false)` when the record was already in
/// that state and `Err(StoreError::NotFound)` when it does not exist.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Insert, or merge lifecycle fields into the existing record.
    async fn upsert(&self, notification: Notification) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError>;

    /// Unread notifications, newest first.
    async fn list_unread(
        &self,
        recipient_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn unread_count(&self, recipient_id: Uuid) -> Result<u64, StoreError>;

    /// Undelivered notifications created at or before `created_before` with
    /// fewer than `max_attempts` delivery attempts, oldest first.
    async fn list_undelivered(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Mark read; also marks delivered.
    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Mark every unread, unexpired notification of a recipient as read.
    async fn mark_all_read(&self, recipient_id: Uuid, at: DateTime<Utc>)
        -> Result<u64, StoreError>;

    /// Increment and return the delivery attempt counter.
    async fn record_delivery_attempt(&self, id: Uuid) -> Result<u32, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Remove every record with `expires_at < now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bound a store call; an elapsed timeout becomes a transient error.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}
