//! In-memory dedupe stores for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::{DedupeResult, InboundDedupe, MarkResult, OutboundDedupe, SendStatus};
use crate::error::DedupeError;

pub struct InMemoryInboundDedupe {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryInboundDedupe {
    pub fn new() -> Self {
        InMemoryInboundDedupe {
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl InboundDedupe for InMemoryInboundDedupe {
    async fn mark_if_new(&self, key: &str, ttl_seconds: i64) -> Result<MarkResult, DedupeError> {
        let now = Utc::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, expires| *expires > now);

        if seen.contains_key(key) {
            return Ok(MarkResult::Duplicate);
        }
        seen.insert(key.to_string(), now + Duration::seconds(ttl_seconds));
        Ok(MarkResult::New)
    }
}

struct OutboundEntry {
    status: SendStatus,
    message_id: Option<String>,
    error: Option<String>,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryOutboundDedupe {
    entries: Mutex<HashMap<String, OutboundEntry>>,
}

impl InMemoryOutboundDedupe {
    pub fn new() -> Self {
        InMemoryOutboundDedupe {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl OutboundDedupe for InMemoryOutboundDedupe {
    async fn check_and_mark(
        &self,
        key: &str,
        intended_id: &str,
        ttl_seconds: i64,
    ) -> Result<DedupeResult, DedupeError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(DedupeResult {
                    is_duplicate: true,
                    status: entry.status,
                    original_message_id: entry.message_id.clone(),
                    error: entry.error.clone(),
                });
            }
        }

        entries.insert(
            key.to_string(),
            OutboundEntry {
                status: SendStatus::Pending,
                message_id: Some(intended_id.to_string()),
                error: None,
                expires_at: now + Duration::seconds(ttl_seconds),
            },
        );
        Ok(DedupeResult::fresh())
    }

    async fn mark_sent(
        &self,
        key: &str,
        message_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now && entry.status == SendStatus::Sent {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            OutboundEntry {
                status: SendStatus::Sent,
                message_id: Some(message_id.to_string()),
                error: None,
                expires_at: now + Duration::seconds(ttl_seconds),
            },
        );
        Ok(true)
    }

    async fn mark_failed(
        &self,
        key: &str,
        error: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            // sent is terminal
            if entry.expires_at > now && entry.status == SendStatus::Sent {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            OutboundEntry {
                status: SendStatus::Failed,
                message_id: None,
                error: error.map(str::to_string),
                expires_at: now + Duration::seconds(ttl_seconds),
            },
        );
        Ok(true)
    }
}
