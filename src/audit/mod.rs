//! Append-only, hash-linked audit chain.
//!
//! Each event's hash covers a canonical serialization of its fields plus the
//! previous event's hash, so tampering with any stored event invalidates the
//! chain from that point forward. Appends are optimistic: the caller states
//! which hash it believes is the latest, and the store rejects the write
//! under a transaction when a concurrent writer got there first.

mod sqlite;

pub use sqlite::SqliteAuditStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditActor {
    System,
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub user_key: String,
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: String,
    pub reason: String,
    pub prev_hash: Option<String>,
    pub hash: String,
    pub correlation_id: Option<String>,
}

/// Canonical serialization of the hashed fields: stable key ordering
/// (serde_json maps are BTree-backed) and epoch-seconds timestamps.
#[allow(clippy::too_many_arguments)]
fn canonical_fields(
    event_id: &str,
    user_key: &str,
    tenant_id: Option<&str>,
    timestamp: DateTime<Utc>,
    actor: AuditActor,
    action: &str,
    reason: &str,
    prev_hash: Option<&str>,
    correlation_id: Option<&str>,
) -> String {
    serde_json::json!({
        "action": action,
        "actor": actor.to_string(),
        "correlation_id": correlation_id,
        "event_id": event_id,
        "prev_hash": prev_hash,
        "reason": reason,
        "tenant_id": tenant_id,
        "timestamp": timestamp.timestamp(),
        "user_key": user_key,
    })
    .to_string()
}

/// `SHA-256(canonical_fields || prev_hash)`, hex-encoded.
#[allow(clippy::too_many_arguments)]
pub fn compute_event_hash(
    event_id: &str,
    user_key: &str,
    tenant_id: Option<&str>,
    timestamp: DateTime<Utc>,
    actor: AuditActor,
    action: &str,
    reason: &str,
    prev_hash: Option<&str>,
    correlation_id: Option<&str>,
) -> String {
    let canonical = canonical_fields(
        event_id,
        user_key,
        tenant_id,
        timestamp,
        actor,
        action,
        reason,
        prev_hash,
        correlation_id,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditEvent {
    /// Build a new event chained onto `prev_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn chained(
        user_key: &str,
        tenant_id: Option<&str>,
        actor: AuditActor,
        action: &str,
        reason: &str,
        prev_hash: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Self {
        let event_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let hash = compute_event_hash(
            &event_id,
            user_key,
            tenant_id,
            timestamp,
            actor,
            action,
            reason,
            prev_hash,
            correlation_id,
        );
        AuditEvent {
            event_id,
            user_key: user_key.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            timestamp,
            actor,
            action: action.to_string(),
            reason: reason.to_string(),
            prev_hash: prev_hash.map(str::to_string),
            hash,
            correlation_id: correlation_id.map(str::to_string),
        }
    }

    /// Recompute this event's hash from its fields.
    pub fn recomputed_hash(&self) -> String {
        compute_event_hash(
            &self.event_id,
            &self.user_key,
            self.tenant_id.as_deref(),
            self.timestamp,
            self.actor,
            &self.action,
            &self.reason,
            self.prev_hash.as_deref(),
            self.correlation_id.as_deref(),
        )
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append under optimistic concurrency: rejected (Ok(false)) when the
    /// observed latest hash differs from `expected_prev_hash`.
    async fn append_event(
        &self,
        event: &AuditEvent,
        expected_prev_hash: Option<&str>,
    ) -> Result<bool, AuditError>;

    async fn get_latest_event(&self, user_key: &str) -> Result<Option<AuditEvent>, AuditError>;

    /// Ascending by timestamp.
    async fn list_events(&self, user_key: &str, limit: usize)
        -> Result<Vec<AuditEvent>, AuditError>;
}

/// Chains a new event onto the current head, retrying once on a concurrent
/// writer before surfacing the conflict.
pub struct AuditRecorder {
    store: std::sync::Arc<dyn AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: std::sync::Arc<dyn AuditStore>) -> Self {
        AuditRecorder { store }
    }

    pub async fn record(
        &self,
        user_key: &str,
        actor: AuditActor,
        action: &str,
        reason: &str,
        correlation_id: Option<&str>,
    ) -> Result<AuditEvent, AuditError> {
        for attempt in 0..2 {
            let latest = self.store.get_latest_event(user_key).await?;
            let prev_hash = latest.as_ref().map(|e| e.hash.clone());
            let event = AuditEvent::chained(
                user_key,
                None,
                actor,
                action,
                reason,
                prev_hash.as_deref(),
                correlation_id,
            );
            if self
                .store
                .append_event(&event, prev_hash.as_deref())
                .await?
            {
                return Ok(event);
            }
            warn!(attempt, action, "audit_chain_conflict_retry");
        }

        let observed = self.store.get_latest_event(user_key).await?;
        Err(AuditError::ChainConflict {
            user_key: user_key.to_string(),
            expected: None,
            observed: observed.map(|e| e.hash),
        })
    }
}

/// Development-only store.
pub struct InMemoryAuditStore {
    events: Mutex<HashMap<String, Vec<AuditEvent>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        InMemoryAuditStore {
            events: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append_event(
        &self,
        event: &AuditEvent,
        expected_prev_hash: Option<&str>,
    ) -> Result<bool, AuditError> {
        let mut events = self.events.lock().await;
        let chain = events.entry(event.user_key.clone()).or_default();
        let latest_hash = chain.last().map(|e| e.hash.as_str());
        if latest_hash != expected_prev_hash {
            return Ok(false);
        }
        chain.push(event.clone());
        Ok(true)
    }

    async fn get_latest_event(&self, user_key: &str) -> Result<Option<AuditEvent>, AuditError> {
        Ok(self
            .events
            .lock()
            .await
            .get(user_key)
            .and_then(|chain| chain.last().cloned()))
    }

    async fn list_events(
        &self,
        user_key: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.lock().await;
        let mut chain = events.get(user_key).cloned().unwrap_or_default();
        chain.sort_by_key(|e| e.timestamp);
        chain.truncate(limit);
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hash_is_deterministic() {
        let ts = Utc::now();
        let a = compute_event_hash("e1", "uk", None, ts, AuditActor::System, "A", "R", None, None);
        let b = compute_event_hash("e1", "uk", None, ts, AuditActor::System, "A", "R", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_any_field() {
        let ts = Utc::now();
        let base = compute_event_hash("e1", "uk", None, ts, AuditActor::System, "A", "R", None, None);
        let changed_action =
            compute_event_hash("e1", "uk", None, ts, AuditActor::System, "B", "R", None, None);
        let changed_prev = compute_event_hash(
            "e1", "uk", None, ts, AuditActor::System, "A", "R", Some("h0"), None,
        );
        assert_ne!(base, changed_action);
        assert_ne!(base, changed_prev);
    }

    #[test]
    fn tampering_invalidates_recomputed_hash() {
        let mut event = AuditEvent::chained("uk", None, AuditActor::System, "USER_CONTACT", "INITIAL", None, None);
        assert_eq!(event.hash, event.recomputed_hash());
        event.action = "EXPORT_GENERATED".into();
        assert_ne!(event.hash, event.recomputed_hash());
    }

    #[tokio::test]
    async fn recorder_links_the_chain() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone());

        let e1 = recorder
            .record("uk", AuditActor::System, "USER_CONTACT", "INITIAL", None)
            .await
            .unwrap();
        let e2 = recorder
            .record("uk", AuditActor::System, "MESSAGE_SENT", "PIPELINE", None)
            .await
            .unwrap();

        assert!(e1.prev_hash.is_none());
        assert_eq!(e2.prev_hash.as_deref(), Some(e1.hash.as_str()));

        let events = store.list_events("uk", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, e1.event_id);
    }

    #[tokio::test]
    async fn append_rejects_stale_prev_hash() {
        let store = InMemoryAuditStore::new();
        let e1 = AuditEvent::chained("uk", None, AuditActor::System, "A", "r", None, None);
        assert!(store.append_event(&e1, None).await.unwrap());

        // stale writer still believes the chain is empty
        let stale = AuditEvent::chained("uk", None, AuditActor::System, "B", "r", None, None);
        assert!(!store.append_event(&stale, None).await.unwrap());
    }

    #[tokio::test]
    async fn chains_are_isolated_per_user_key() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone());
        recorder
            .record("uk-a", AuditActor::System, "A", "r", None)
            .await
            .unwrap();
        let b = recorder
            .record("uk-b", AuditActor::User, "B", "r", None)
            .await
            .unwrap();
        assert!(b.prev_hash.is_none());
    }

    #[tokio::test]
    async fn list_respects_limit_and_order() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new(store.clone());
        for i in 0..5 {
            recorder
                .record("uk", AuditActor::System, &format!("A{i}"), "r", None)
                .await
                .unwrap();
        }
        let events = store.list_events("uk", 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
