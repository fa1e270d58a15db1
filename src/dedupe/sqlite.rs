//! SQLite dedupe stores (document-store semantics).
//!
//! TTL is a `_ttl_expire_at` column checked lazily inside the same
//! transaction that mutates the row, so check-and-mark is atomic under
//! SQLite's writer serialization.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::{DedupeResult, InboundDedupe, MarkResult, OutboundDedupe, SendStatus};
use crate::error::DedupeError;

pub struct SqliteInboundDedupe {
    pool: SqlitePool,
}

impl SqliteInboundDedupe {
    pub async fn new(pool: SqlitePool) -> Result<Self, DedupeError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dedupe_inbound (
                 key TEXT PRIMARY KEY,
                 created_at TEXT NOT NULL,
                 _ttl_expire_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteInboundDedupe { pool })
    }
}

#[async_trait]
impl InboundDedupe for SqliteInboundDedupe {
    async fn mark_if_new(&self, key: &str, ttl_seconds: i64) -> Result<MarkResult, DedupeError> {
        let now = Utc::now();
        let expire_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;

        let existing: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT _ttl_expire_at FROM dedupe_inbound WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((expires,)) = existing {
            if expires > now {
                tx.commit().await?;
                return Ok(MarkResult::Duplicate);
            }
        }

        sqlx::query(
            "INSERT INTO dedupe_inbound (key, created_at, _ttl_expire_at)
             VALUES ($1, $2, $3)
             ON CONFLICT(key) DO UPDATE SET created_at = $2, _ttl_expire_at = $3",
        )
        .bind(key)
        .bind(now)
        .bind(expire_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(MarkResult::New)
    }
}

pub struct SqliteOutboundDedupe {
    pool: SqlitePool,
}

impl SqliteOutboundDedupe {
    pub async fn new(pool: SqlitePool) -> Result<Self, DedupeError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dedupe_outbound (
                 key TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 message_id TEXT,
                 error TEXT,
                 created_at TEXT NOT NULL,
                 _ttl_expire_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteOutboundDedupe { pool })
    }

    fn parse_status(raw: &str) -> SendStatus {
        raw.parse().unwrap_or(SendStatus::Pending)
    }
}

#[async_trait]
impl OutboundDedupe for SqliteOutboundDedupe {
    async fn check_and_mark(
        &self,
        key: &str,
        intended_id: &str,
        ttl_seconds: i64,
    ) -> Result<DedupeResult, DedupeError> {
        let now = Utc::now();
        let expire_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT status, message_id, error, _ttl_expire_at FROM dedupe_outbound WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let expires: DateTime<Utc> = row.try_get("_ttl_expire_at")?;
            if expires > now {
                let status: String = row.try_get("status")?;
                let result = DedupeResult {
                    is_duplicate: true,
                    status: Self::parse_status(&status),
                    original_message_id: row.try_get("message_id")?,
                    error: row.try_get("error")?,
                };
                tx.commit().await?;
                return Ok(result);
            }
        }

        sqlx::query(
            "INSERT INTO dedupe_outbound (key, status, message_id, error, created_at, _ttl_expire_at)
             VALUES ($1, 'pending', $2, NULL, $3, $4)
             ON CONFLICT(key) DO UPDATE SET
                 status = 'pending', message_id = $2, error = NULL,
                 created_at = $3, _ttl_expire_at = $4",
        )
        .bind(key)
        .bind(intended_id)
        .bind(now)
        .bind(expire_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(DedupeResult::fresh())
    }

    async fn mark_sent(
        &self,
        key: &str,
        message_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError> {
        let now = Utc::now();
        let expire_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT status, _ttl_expire_at FROM dedupe_outbound WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((status, expires)) = existing {
            if expires > now && Self::parse_status(&status) == SendStatus::Sent {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO dedupe_outbound (key, status, message_id, error, created_at, _ttl_expire_at)
             VALUES ($1, 'sent', $2, NULL, $3, $4)
             ON CONFLICT(key) DO UPDATE SET
                 status = 'sent', message_id = $2, error = NULL,
                 created_at = $3, _ttl_expire_at = $4",
        )
        .bind(key)
        .bind(message_id)
        .bind(now)
        .bind(expire_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        key: &str,
        error: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError> {
        let now = Utc::now();
        let expire_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT status, _ttl_expire_at FROM dedupe_outbound WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((status, expires)) = existing {
            // sent is terminal
            if expires > now && Self::parse_status(&status) == SendStatus::Sent {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO dedupe_outbound (key, status, message_id, error, created_at, _ttl_expire_at)
             VALUES ($1, 'failed', NULL, $2, $3, $4)
             ON CONFLICT(key) DO UPDATE SET
                 status = 'failed', message_id = NULL, error = $2,
                 created_at = $3, _ttl_expire_at = $4",
        )
        .bind(key)
        .bind(error)
        .bind(now)
        .bind(expire_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const TTL: i64 = 60;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn inbound_mark_if_new_dedupes() {
        let store = SqliteInboundDedupe::new(memory_pool().await).await.unwrap();
        assert_eq!(store.mark_if_new("k1", TTL).await.unwrap(), MarkResult::New);
        assert_eq!(
            store.mark_if_new("k1", TTL).await.unwrap(),
            MarkResult::Duplicate
        );
        assert_eq!(store.mark_if_new("k2", TTL).await.unwrap(), MarkResult::New);
    }

    #[tokio::test]
    async fn inbound_expired_key_marks_again() {
        let store = SqliteInboundDedupe::new(memory_pool().await).await.unwrap();
        store.mark_if_new("k1", -5).await.unwrap();
        assert_eq!(store.mark_if_new("k1", TTL).await.unwrap(), MarkResult::New);
    }

    #[tokio::test]
    async fn outbound_lifecycle_pending_to_sent() {
        let store = SqliteOutboundDedupe::new(memory_pool().await).await.unwrap();

        let fresh = store.check_and_mark("idem", "wamid.in", TTL).await.unwrap();
        assert!(!fresh.is_duplicate);

        let dup = store.check_and_mark("idem", "wamid.in", TTL).await.unwrap();
        assert!(dup.is_duplicate);
        assert_eq!(dup.status, SendStatus::Pending);

        assert!(store.mark_sent("idem", "wamid.out", TTL).await.unwrap());
        let sent = store.check_and_mark("idem", "wamid.in", TTL).await.unwrap();
        assert_eq!(sent.status, SendStatus::Sent);
        assert_eq!(sent.original_message_id.as_deref(), Some("wamid.out"));
    }

    #[tokio::test]
    async fn outbound_sent_is_never_downgraded() {
        let store = SqliteOutboundDedupe::new(memory_pool().await).await.unwrap();
        store.mark_sent("idem", "wamid.out", TTL).await.unwrap();

        assert!(!store.mark_failed("idem", Some("late failure"), TTL).await.unwrap());
        let record = store.check_and_mark("idem", "x", TTL).await.unwrap();
        assert_eq!(record.status, SendStatus::Sent);
    }

    #[tokio::test]
    async fn outbound_failure_is_recorded_with_error() {
        let store = SqliteOutboundDedupe::new(memory_pool().await).await.unwrap();
        store.check_and_mark("idem", "wamid.in", TTL).await.unwrap();
        assert!(store.mark_failed("idem", Some("HTTP 503"), TTL).await.unwrap());

        let record = store.check_and_mark("idem", "wamid.in", TTL).await.unwrap();
        assert_eq!(record.status, SendStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn outbound_expired_entry_is_fresh() {
        let store = SqliteOutboundDedupe::new(memory_pool().await).await.unwrap();
        store.check_and_mark("idem", "a", -5).await.unwrap();
        let result = store.check_and_mark("idem", "b", TTL).await.unwrap();
        assert!(!result.is_duplicate);
    }
}
