//! SQLite audit store. Appends run inside a transaction so the latest-hash
//! check and the insert are atomic.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::{AuditActor, AuditEvent, AuditStore};
use crate::error::AuditError;

pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, AuditError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_events (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 event_id TEXT NOT NULL UNIQUE,
                 user_key TEXT NOT NULL,
                 tenant_id TEXT,
                 timestamp TEXT NOT NULL,
                 actor TEXT NOT NULL,
                 action TEXT NOT NULL,
                 reason TEXT NOT NULL,
                 prev_hash TEXT,
                 hash TEXT NOT NULL,
                 correlation_id TEXT
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_user
                 ON audit_events(user_key, seq)",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteAuditStore { pool })
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent, AuditError> {
        let actor: String = row.try_get("actor")?;
        Ok(AuditEvent {
            event_id: row.try_get("event_id")?,
            user_key: row.try_get("user_key")?,
            tenant_id: row.try_get("tenant_id")?,
            timestamp: row.try_get("timestamp")?,
            actor: actor
                .parse::<AuditActor>()
                .map_err(|e| AuditError::Store(format!("actor: {e:?}")))?,
            action: row.try_get("action")?,
            reason: row.try_get("reason")?,
            prev_hash: row.try_get("prev_hash")?,
            hash: row.try_get("hash")?,
            correlation_id: row.try_get("correlation_id")?,
        })
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append_event(
        &self,
        event: &AuditEvent,
        expected_prev_hash: Option<&str>,
    ) -> Result<bool, AuditError> {
        let mut tx = self.pool.begin().await?;

        let latest: Option<(String,)> = sqlx::query_as(
            "SELECT hash FROM audit_events WHERE user_key = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(&event.user_key)
        .fetch_optional(&mut *tx)
        .await?;

        let observed = latest.as_ref().map(|(h,)| h.as_str());
        if observed != expected_prev_hash {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO audit_events (event_id, user_key, tenant_id, timestamp, actor,
                                       action, reason, prev_hash, hash, correlation_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&event.event_id)
        .bind(&event.user_key)
        .bind(&event.tenant_id)
        .bind(event.timestamp)
        .bind(event.actor.to_string())
        .bind(&event.action)
        .bind(&event.reason)
        .bind(&event.prev_hash)
        .bind(&event.hash)
        .bind(&event.correlation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_latest_event(&self, user_key: &str) -> Result<Option<AuditEvent>, AuditError> {
        let row = sqlx::query(
            "SELECT event_id, user_key, tenant_id, timestamp, actor, action, reason,
                    prev_hash, hash, correlation_id
             FROM audit_events WHERE user_key = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(user_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_events(
        &self,
        user_key: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let rows = sqlx::query(
            "SELECT event_id, user_key, tenant_id, timestamp, actor, action, reason,
                    prev_hash, hash, correlation_id
             FROM audit_events WHERE user_key = $1 ORDER BY timestamp ASC, seq ASC LIMIT $2",
        )
        .bind(user_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_row).collect()
    }
}
