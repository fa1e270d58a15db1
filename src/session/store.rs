//! Session persistence backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

use super::SessionState;
use crate::error::SessionError;

/// Async session persistence contract. `load` discards expired entries.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, chat_id: &str) -> Result<Option<SessionState>, SessionError>;
    async fn save(&self, session: &SessionState) -> Result<(), SessionError>;
    async fn delete(&self, chat_id: &str) -> Result<bool, SessionError>;
}

/// Development-only store.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        InMemorySessionStore {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, chat_id: &str) -> Result<Option<SessionState>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(chat_id) {
            Some(session) if session.expires_at > Utc::now() => Ok(Some(session.clone())),
            Some(_) => {
                sessions.remove(chat_id);
                debug!(chat_id = %&chat_id[..chat_id.len().min(8)], "expired_session_discarded");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &SessionState) -> Result<(), SessionError> {
        self.sessions
            .lock()
            .await
            .insert(session.chat_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.lock().await.remove(chat_id).is_some())
    }
}

/// SQLite-backed session store. Collections are rows keyed by `chat_id`;
/// the queue and history rings are stored as JSON columns.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, SessionError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                 chat_id TEXT PRIMARY KEY,
                 session_id TEXT NOT NULL,
                 current_state TEXT NOT NULL,
                 outcome TEXT,
                 intent_queue TEXT NOT NULL,
                 message_history TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 expires_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteSessionStore { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, chat_id: &str) -> Result<Option<SessionState>, SessionError> {
        let row = sqlx::query(
            "SELECT session_id, current_state, outcome, intent_queue, message_history,
                    created_at, updated_at, expires_at
             FROM sessions WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if expires_at <= Utc::now() {
            sqlx::query("DELETE FROM sessions WHERE chat_id = $1")
                .bind(chat_id)
                .execute(&self.pool)
                .await?;
            debug!(chat_id = %&chat_id[..chat_id.len().min(8)], "expired_session_discarded");
            return Ok(None);
        }

        let outcome: Option<String> = row.try_get("outcome")?;
        let intent_queue: String = row.try_get("intent_queue")?;
        let message_history: String = row.try_get("message_history")?;

        Ok(Some(SessionState {
            session_id: row.try_get("session_id")?,
            chat_id: chat_id.to_string(),
            current_state: row.try_get("current_state")?,
            intent_queue: serde_json::from_str(&intent_queue)
                .map_err(|e| SessionError::Serialization(e.to_string()))?,
            outcome: outcome
                .map(|raw| raw.parse())
                .transpose()
                .map_err(|e| SessionError::Serialization(format!("outcome: {e:?}")))?,
            message_history: serde_json::from_str(&message_history)
                .map_err(|e| SessionError::Serialization(e.to_string()))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at,
        }))
    }

    async fn save(&self, session: &SessionState) -> Result<(), SessionError> {
        let intent_queue = serde_json::to_string(&session.intent_queue)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        let message_history = serde_json::to_string(&session.message_history)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO sessions (chat_id, session_id, current_state, outcome, intent_queue,
                                   message_history, created_at, updated_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT(chat_id) DO UPDATE SET
                 session_id = $2, current_state = $3, outcome = $4, intent_queue = $5,
                 message_history = $6, created_at = $7, updated_at = $8, expires_at = $9",
        )
        .bind(&session.chat_id)
        .bind(&session.session_id)
        .bind(&session.current_state)
        .bind(session.outcome.map(|o| o.to_string()))
        .bind(intent_queue)
        .bind(message_history)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> Result<bool, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Outcome;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_store() -> SqliteSessionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteSessionStore::new(pool).await.unwrap()
    }

    fn sample_session(chat_id: &str) -> SessionState {
        let mut session = SessionState::new(chat_id, Duration::minutes(30));
        session.outcome = Some(Outcome::AwaitingUser);
        session.message_history.push(super::super::HistoryEntry {
            message_id: Some("wamid.1".into()),
            received_at: Utc::now(),
            correlation_id: Some("corr-1".into()),
        });
        session
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        let session = sample_session("chat-1");
        store.save(&session).await.unwrap();
        let loaded = store.load("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn memory_store_discards_expired() {
        let store = InMemorySessionStore::new();
        let mut session = sample_session("chat-1");
        session.expires_at = Utc::now() - Duration::seconds(1);
        store.save(&session).await.unwrap();
        assert!(store.load("chat-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_round_trips() {
        let store = sqlite_store().await;
        let session = sample_session("chat-1");
        store.save(&session).await.unwrap();

        let loaded = store.load("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.outcome, Some(Outcome::AwaitingUser));
        assert_eq!(loaded.message_history.len(), 1);
        assert_eq!(
            loaded.message_history[0].message_id.as_deref(),
            Some("wamid.1")
        );
    }

    #[tokio::test]
    async fn sqlite_store_lazy_deletes_expired() {
        let store = sqlite_store().await;
        let mut session = sample_session("chat-1");
        session.expires_at = Utc::now() - Duration::seconds(1);
        store.save(&session).await.unwrap();

        assert!(store.load("chat-1").await.unwrap().is_none());
        // row is gone, not just filtered
        assert!(!store.delete("chat-1").await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_save_overwrites_existing_row() {
        let store = sqlite_store().await;
        let mut session = sample_session("chat-1");
        store.save(&session).await.unwrap();

        session.current_state = "AWAITING_USER".into();
        store.save(&session).await.unwrap();

        let loaded = store.load("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_state, "AWAITING_USER");
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = sqlite_store().await;
        let session = sample_session("chat-1");
        store.save(&session).await.unwrap();
        assert!(store.delete("chat-1").await.unwrap());
        assert!(!store.delete("chat-1").await.unwrap());
    }
}
