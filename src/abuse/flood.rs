//! Flood detection — sliding count of events per session.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;

use crate::error::DedupeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodDetectionResult {
    pub is_flooded: bool,
    pub message_count: u32,
    pub time_window_seconds: i64,
    pub threshold: u32,
}

#[async_trait]
pub trait FloodDetector: Send + Sync {
    /// Count events already inside the window, then record this one. A
    /// session at the threshold is flooded; the first `threshold` events
    /// pass.
    async fn check_and_record(
        &self,
        session_id: &str,
    ) -> Result<FloodDetectionResult, DedupeError>;
}

/// Timestamp-list form, pruned on each check. Development only.
pub struct InMemoryFloodDetector {
    threshold: u32,
    window_seconds: i64,
    events: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl InMemoryFloodDetector {
    pub fn new(threshold: u32, window_seconds: i64) -> Self {
        InMemoryFloodDetector {
            threshold,
            window_seconds,
            events: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FloodDetector for InMemoryFloodDetector {
    async fn check_and_record(
        &self,
        session_id: &str,
    ) -> Result<FloodDetectionResult, DedupeError> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(self.window_seconds);

        let mut events = self.events.lock().await;
        let timestamps = events.entry(session_id.to_string()).or_default();
        timestamps.retain(|ts| *ts >= cutoff);

        let prior = timestamps.len() as u32;
        timestamps.push(now);

        Ok(FloodDetectionResult {
            is_flooded: prior >= self.threshold,
            message_count: prior + 1,
            time_window_seconds: self.window_seconds,
            threshold: self.threshold,
        })
    }
}

/// Counter form with window expiry, the INCR-with-expire shape. The upsert
/// runs in one statement so concurrent workers observe a monotonic count.
pub struct SqliteFloodDetector {
    pool: SqlitePool,
    threshold: u32,
    window_seconds: i64,
}

impl SqliteFloodDetector {
    pub async fn new(
        pool: SqlitePool,
        threshold: u32,
        window_seconds: i64,
    ) -> Result<Self, DedupeError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flood_counters (
                 session_id TEXT PRIMARY KEY,
                 count INTEGER NOT NULL,
                 window_expires_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteFloodDetector {
            pool,
            threshold,
            window_seconds,
        })
    }
}

#[async_trait]
impl FloodDetector for SqliteFloodDetector {
    async fn check_and_record(
        &self,
        session_id: &str,
    ) -> Result<FloodDetectionResult, DedupeError> {
        let now = Utc::now();
        let expires = now + Duration::seconds(self.window_seconds);

        // Reset the counter when the window lapsed, else increment.
        let count: (i64,) = sqlx::query_as(
            "INSERT INTO flood_counters (session_id, count, window_expires_at)
             VALUES ($1, 1, $2)
             ON CONFLICT(session_id) DO UPDATE SET
                 count = CASE WHEN flood_counters.window_expires_at <= $3
                              THEN 1 ELSE flood_counters.count + 1 END,
                 window_expires_at = CASE WHEN flood_counters.window_expires_at <= $3
                                          THEN $2 ELSE flood_counters.window_expires_at END
             RETURNING count",
        )
        .bind(session_id)
        .bind(expires)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let count = u32::try_from(count.0).unwrap_or(u32::MAX);
        Ok(FloodDetectionResult {
            is_flooded: count > self.threshold,
            message_count: count,
            time_window_seconds: self.window_seconds,
            threshold: self.threshold,
        })
    }
}
