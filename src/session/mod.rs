//! Per-conversation session state and its manager.
//!
//! The manager owns the session lifecycle: load-or-create, idempotent
//! history append, state normalization and persistence. Writes to a session
//! are serialized through a keyed async lock regardless of queue ordering
//! guarantees.

pub mod store;

pub use store::{InMemorySessionStore, SessionStore, SqliteSessionStore};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::domain::{ConversationState, Outcome};
use crate::error::SessionError;
use crate::ids::new_session_id;

/// One queued intent awaiting fulfilment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEntry {
    pub intent: String,
    pub confidence: f64,
    pub arrived_at: DateTime<Utc>,
}

/// One received-message record in the bounded history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

/// Mutable per-conversation state, one per `chat_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub chat_id: String,
    /// Stored raw; `SessionManager::normalize_current_state` coerces unknown
    /// values to INITIAL. This absorbs forward/backward schema drift.
    pub current_state: String,
    pub intent_queue: Vec<IntentEntry>,
    pub outcome: Option<Outcome>,
    pub message_history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(chat_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        SessionState {
            session_id: new_session_id(),
            chat_id: chat_id.to_string(),
            current_state: ConversationState::Initial.to_string(),
            intent_queue: Vec::new(),
            outcome: None,
            message_history: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn set_state(&mut self, state: ConversationState) {
        self.current_state = state.to_string();
    }

    pub fn intent_queue_at_capacity(&self, max_intents: usize) -> bool {
        self.intent_queue.len() >= max_intents
    }

    /// Queue an intent; returns false (and drops it) when at capacity.
    pub fn push_intent(&mut self, intent: IntentEntry, max_intents: usize) -> bool {
        if self.intent_queue_at_capacity(max_intents) {
            return false;
        }
        self.intent_queue.push(intent);
        true
    }

    fn history_has_message_id(&self, message_id: &str) -> bool {
        self.message_history
            .iter()
            .any(|rec| rec.message_id.as_deref() == Some(message_id))
    }
}

/// Manages session lifecycle against a pluggable store.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    session_ttl: Duration,
    max_intents: usize,
    history_max_entries: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        session_ttl: Duration,
        max_intents: usize,
        history_max_entries: usize,
    ) -> Self {
        SessionManager {
            store,
            session_ttl,
            max_intents,
            history_max_entries,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_intents(&self) -> usize {
        self.max_intents
    }

    /// Acquire the per-session write lock. Held across the worker's whole
    /// read-modify-write so two tasks for the same chat never interleave.
    pub async fn lock_session(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(chat_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub async fn get_or_create(&self, chat_id: &str) -> Result<SessionState, SessionError> {
        if let Some(session) = self.store.load(chat_id).await? {
            debug!(session_id = %prefix(&session.session_id), "session_loaded");
            return Ok(session);
        }

        let session = SessionState::new(chat_id, self.session_ttl);
        info!(
            session_id = %prefix(&session.session_id),
            chat_id = %prefix(chat_id),
            "session_created"
        );
        Ok(session)
    }

    /// Record the received message. Idempotent by `message_id`: re-delivery
    /// of the same id is a no-op. Returns whether this message is the first
    /// of the UTC day for the session.
    pub fn append_user_message(
        &self,
        session: &mut SessionState,
        message_id: &str,
        message_timestamp: i64,
        correlation_id: Option<&str>,
    ) -> bool {
        let received_at = Utc
            .timestamp_opt(message_timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let is_first = session
            .message_history
            .last()
            .map(|last| {
                let a = last.received_at;
                a.year() != received_at.year() || a.ordinal() != received_at.ordinal()
            })
            .unwrap_or(true);

        if session.history_has_message_id(message_id) {
            return is_first;
        }

        session.message_history.push(HistoryEntry {
            message_id: Some(message_id.to_string()),
            received_at,
            correlation_id: correlation_id.map(str::to_string),
        });

        // Bounded ring, FIFO eviction. Load-bearing for cost and LLM context.
        while session.message_history.len() > self.history_max_entries {
            session.message_history.remove(0);
        }

        is_first
    }

    /// Coerce an unrecognized stored state to INITIAL, emitting a structured
    /// event. Returns the effective state.
    pub fn normalize_current_state(
        &self,
        session: &mut SessionState,
        correlation_id: Option<&str>,
    ) -> ConversationState {
        match session.current_state.parse::<ConversationState>() {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    event = "invalid_state_normalized",
                    invalid_state_value = %session.current_state,
                    normalized_to = %ConversationState::Initial,
                    correlation_id = correlation_id.unwrap_or(""),
                    session_id = %prefix(&session.session_id),
                    "invalid_state_normalized"
                );
                session.set_state(ConversationState::Initial);
                ConversationState::Initial
            }
        }
    }

    /// Persist with a refreshed expiry.
    pub async fn persist(&self, session: &mut SessionState) -> Result<(), SessionError> {
        let now = Utc::now();
        session.updated_at = now;
        session.expires_at = now + self.session_ttl;
        self.store.save(session).await
    }
}

fn prefix(id: &str) -> &str {
    &id[..id.len().min(8)]
}
