//! Inbound processing log — per-event observability records with TTL.
//!
//! Best-effort: a log write failure never fails the webhook.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;

use crate::error::SessionError;

/// Records kept for one week.
const LOG_TTL: i64 = 604_800;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingLogEntry {
    pub inbound_event_id: String,
    pub received_at: DateTime<Utc>,
    pub enqueued: bool,
    pub signature_validated: bool,
    pub signature_skipped: bool,
    pub correlation_id: Option<String>,
}

#[async_trait]
pub trait ProcessingLogStore: Send + Sync {
    async fn record(&self, entry: &ProcessingLogEntry) -> Result<(), SessionError>;
    async fn get(&self, inbound_event_id: &str) -> Result<Option<ProcessingLogEntry>, SessionError>;
}

pub struct InMemoryProcessingLog {
    entries: Mutex<HashMap<String, (ProcessingLogEntry, DateTime<Utc>)>>,
}

impl InMemoryProcessingLog {
    pub fn new() -> Self {
        InMemoryProcessingLog {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessingLogStore for InMemoryProcessingLog {
    async fn record(&self, entry: &ProcessingLogEntry) -> Result<(), SessionError> {
        self.entries.lock().await.insert(
            entry.inbound_event_id.clone(),
            (entry.clone(), Utc::now() + Duration::seconds(LOG_TTL)),
        );
        Ok(())
    }

    async fn get(
        &self,
        inbound_event_id: &str,
    ) -> Result<Option<ProcessingLogEntry>, SessionError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(inbound_event_id)
            .filter(|(_, expires)| *expires > Utc::now())
            .map(|(entry, _)| entry.clone()))
    }
}

pub struct SqliteProcessingLog {
    pool: SqlitePool,
}

impl SqliteProcessingLog {
    pub async fn new(pool: SqlitePool) -> Result<Self, SessionError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS inbound_processing_logs (
                 inbound_event_id TEXT PRIMARY KEY,
                 received_at TEXT NOT NULL,
                 enqueued INTEGER NOT NULL,
                 signature_validated INTEGER NOT NULL,
                 signature_skipped INTEGER NOT NULL,
                 correlation_id TEXT,
                 _ttl_expire_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteProcessingLog { pool })
    }
}

#[async_trait]
impl ProcessingLogStore for SqliteProcessingLog {
    async fn record(&self, entry: &ProcessingLogEntry) -> Result<(), SessionError> {
        sqlx::query(
            "INSERT INTO inbound_processing_logs
                 (inbound_event_id, received_at, enqueued, signature_validated,
                  signature_skipped, correlation_id, _ttl_expire_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT(inbound_event_id) DO UPDATE SET
                 received_at = $2, enqueued = $3, signature_validated = $4,
                 signature_skipped = $5, correlation_id = $6, _ttl_expire_at = $7",
        )
        .bind(&entry.inbound_event_id)
        .bind(entry.received_at)
        .bind(entry.enqueued)
        .bind(entry.signature_validated)
        .bind(entry.signature_skipped)
        .bind(&entry.correlation_id)
        .bind(Utc::now() + Duration::seconds(LOG_TTL))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        inbound_event_id: &str,
    ) -> Result<Option<ProcessingLogEntry>, SessionError> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT inbound_event_id, received_at, enqueued, signature_validated,
                    signature_skipped, correlation_id, _ttl_expire_at
             FROM inbound_processing_logs WHERE inbound_event_id = $1",
        )
        .bind(inbound_event_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires: DateTime<Utc> = row.try_get("_ttl_expire_at")?;
        if expires <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(ProcessingLogEntry {
            inbound_event_id: row.try_get("inbound_event_id")?,
            received_at: row.try_get("received_at")?,
            enqueued: row.try_get("enqueued")?,
            signature_validated: row.try_get("signature_validated")?,
            signature_skipped: row.try_get("signature_skipped")?,
            correlation_id: row.try_get("correlation_id")?,
        }))
    }
}
