//! PostgreSQL notification store.
//!
//! One row per notification with the content in a JSONB column. Idempotent
//! upsert is a single `INSERT .. ON CONFLICT (id) DO UPDATE` whose update
//! clause applies the same forward-only merge as the memory backend, so the
//! row lock taken by the conflict path is the per-document atomicity
//! boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::metrics::StoreMetrics;
use crate::notification::{Notification, NotificationContent};
use crate::postgres::PostgresPool;

use super::{NotificationStore, Pagination, StoreError, StoreStats, UpsertOutcome};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        recipient_id UUID NOT NULL,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        delivered BOOLEAN NOT NULL DEFAULT FALSE,
        delivered_at TIMESTAMPTZ,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        read_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        delivery_attempts INTEGER NOT NULL DEFAULT 0,
        CONSTRAINT notifications_delivered_at_check CHECK (delivered OR delivered_at IS NULL),
        CONSTRAINT notifications_read_check CHECK (NOT is_read OR delivered)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_recipient_created
        ON notifications (recipient_id, created_at DESC, seq DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_recipient_unread
        ON notifications (recipient_id, created_at DESC, seq DESC) WHERE NOT is_read
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_undelivered
        ON notifications (created_at, seq) WHERE NOT delivered
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_expires
        ON notifications (expires_at) WHERE expires_at IS NOT NULL
    "#,
];

const COLUMNS: &str = "id, recipient_id, kind, payload, created_at, delivered, delivered_at, \
                       is_read, read_at, expires_at, delivery_attempts";

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    delivered: bool,
    delivered_at: Option<DateTime<Utc>>,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    delivery_attempts: i32,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse()
            .map_err(|e: String| StoreError::Corrupt(format!("{}: {}", row.id, e)))?;
        let payload: NotificationContent = serde_json::from_value(row.payload)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", row.id, e)))?;

        Ok(Notification {
            id: row.id,
            recipient_id: row.recipient_id,
            kind,
            payload,
            created_at: row.created_at,
            delivered: row.delivered,
            delivered_at: row.delivered_at,
            is_read: row.is_read,
            read_at: row.read_at,
            expires_at: row.expires_at,
            delivery_attempts: row.delivery_attempts.max(0) as u32,
        })
    }
}

fn into_notifications(rows: Vec<NotificationRow>) -> Result<Vec<Notification>, StoreError> {
    rows.into_iter().map(Notification::try_from).collect()
}

pub struct PostgresNotificationStore {
    pool: Arc<PostgresPool>,
}

impl PostgresNotificationStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            self.run("ensure_schema", |pool| async move {
                sqlx::query(statement).execute(&pool).await.map(|_| ())
            })
            .await?;
        }
        tracing::info!(url = %self.pool.database_url_masked(), "Notification schema ready");
        Ok(())
    }

    /// Run a query through the circuit breaker, recording latency and errors.
    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let start = Instant::now();
        let result = self.pool.execute_with_circuit_breaker(f).await;
        StoreMetrics::record_latency("postgres", operation, start.elapsed().as_secs_f64());

        result.map_err(|e| {
            StoreMetrics::record_error("postgres", operation);
            tracing::warn!(operation = operation, error = %e, "Notification store query failed");
            StoreError::Postgres(e)
        })
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        self.run("exists", |pool| async move {
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM notifications WHERE id = $1)")
                .bind(id)
                .fetch_one(&pool)
                .await
        })
        .await
    }

    /// `Ok(true)` when `rows` is 1, else `Ok(false)` or `NotFound`.
    async fn transition_result(&self, id: Uuid, rows: u64) -> Result<bool, StoreError> {
        if rows > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, notification: Notification) -> Result<UpsertOutcome, StoreError> {
        let payload = serde_json::to_value(&notification.payload)?;
        let sql = format!(
            r#"
            INSERT INTO notifications ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                delivered = notifications.delivered OR EXCLUDED.delivered
                    OR notifications.is_read OR EXCLUDED.is_read,
                delivered_at = COALESCE(notifications.delivered_at, EXCLUDED.delivered_at,
                    notifications.read_at, EXCLUDED.read_at),
                is_read = notifications.is_read OR EXCLUDED.is_read,
                read_at = COALESCE(notifications.read_at, EXCLUDED.read_at),
                expires_at = GREATEST(notifications.expires_at, EXCLUDED.expires_at),
                delivery_attempts = GREATEST(notifications.delivery_attempts, EXCLUDED.delivery_attempts)
            RETURNING (xmax = 0) AS inserted
            "#
        );

        let inserted = self
            .run("upsert", |pool| async move {
                sqlx::query_scalar::<_, bool>(&sql)
                    .bind(notification.id)
                    .bind(notification.recipient_id)
                    .bind(notification.kind.as_str())
                    .bind(&payload)
                    .bind(notification.created_at)
                    .bind(notification.delivered)
                    .bind(notification.delivered_at)
                    .bind(notification.is_read)
                    .bind(notification.read_at)
                    .bind(notification.expires_at)
                    .bind(notification.delivery_attempts as i32)
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Existing
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        let row = self
            .run("get", |pool| async move {
                sqlx::query_as::<_, NotificationRow>(&sql)
                    .bind(id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        row.map(Notification::try_from).transpose()
    }

    async fn list_unread(
        &self,
        recipient_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<Notification>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE recipient_id = $1 AND NOT is_read
              AND (expires_at IS NULL OR expires_at >= $2)
            ORDER BY created_at DESC, seq DESC
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = self
            .run("list_unread", |pool| async move {
                sqlx::query_as::<_, NotificationRow>(&sql)
                    .bind(recipient_id)
                    .bind(Utc::now())
                    .bind(page.limit as i64)
                    .bind(page.offset as i64)
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        into_notifications(rows)
    }

    async fn unread_count(&self, recipient_id: Uuid) -> Result<u64, StoreError> {
        let count = self
            .run("unread_count", |pool| async move {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT COUNT(*) FROM notifications
                    WHERE recipient_id = $1 AND NOT is_read
                      AND (expires_at IS NULL OR expires_at >= $2)
                    "#,
                )
                .bind(recipient_id)
                .bind(Utc::now())
                .fetch_one(&pool)
                .await
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_undelivered(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE NOT delivered AND created_at <= $1
              AND (expires_at IS NULL OR expires_at >= $2)
              AND delivery_attempts < $4
            ORDER BY created_at ASC, seq ASC
            LIMIT $3
            "#
        );
        let rows = self
            .run("list_undelivered", |pool| async move {
                sqlx::query_as::<_, NotificationRow>(&sql)
                    .bind(created_before)
                    .bind(Utc::now())
                    .bind(limit as i64)
                    .bind(max_attempts.min(i32::MAX as u32) as i32)
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        into_notifications(rows)
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let rows = self
            .run("mark_delivered", |pool| async move {
                sqlx::query(
                    "UPDATE notifications SET delivered = TRUE, delivered_at = $2 \
                     WHERE id = $1 AND NOT delivered",
                )
                .bind(id)
                .bind(at)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        self.transition_result(id, rows).await
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let rows = self
            .run("mark_read", |pool| async move {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET is_read = TRUE, read_at = $2,
                        delivered = TRUE, delivered_at = COALESCE(delivered_at, $2)
                    WHERE id = $1 AND NOT is_read
                    "#,
                )
                .bind(id)
                .bind(at)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        self.transition_result(id, rows).await
    }

    async fn mark_all_read(
        &self,
        recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.run("mark_all_read", |pool| async move {
            sqlx::query(
                r#"
                UPDATE notifications
                SET is_read = TRUE, read_at = $2,
                    delivered = TRUE, delivered_at = COALESCE(delivered_at, $2)
                WHERE recipient_id = $1 AND NOT is_read
                  AND (expires_at IS NULL OR expires_at >= $2)
                "#,
            )
            .bind(recipient_id)
            .bind(at)
            .execute(&pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await
    }

    async fn record_delivery_attempt(&self, id: Uuid) -> Result<u32, StoreError> {
        let attempts = self
            .run("record_delivery_attempt", |pool| async move {
                sqlx::query_scalar::<_, i32>(
                    "UPDATE notifications SET delivery_attempts = delivery_attempts + 1 \
                     WHERE id = $1 RETURNING delivery_attempts",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        attempts
            .map(|a| a.max(0) as u32)
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let rows = self
            .run("delete", |pool| async move {
                sqlx::query("DELETE FROM notifications WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
            })
            .await?;
        Ok(rows > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run("purge_expired", |pool| async move {
            sqlx::query("DELETE FROM notifications WHERE expires_at < $1")
                .bind(now)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (total, unread, undelivered) = self
            .run("stats", |pool| async move {
                sqlx::query_as::<_, (i64, i64, i64)>(
                    r#"
                    SELECT COUNT(*),
                           COUNT(*) FILTER (WHERE NOT is_read),
                           COUNT(*) FILTER (WHERE NOT delivered)
                    FROM notifications
                    "#,
                )
                .fetch_one(&pool)
                .await
            })
            .await?;

        Ok(StoreStats {
            backend: "postgres",
            total: total.max(0) as u64,
            unread: unread.max(0) as u64,
            undelivered: undelivered.max(0) as u64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.pool.ping().await?;
        Ok(())
    }
}
