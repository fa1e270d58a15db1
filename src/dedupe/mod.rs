//! Dedupe stores — at-most-once marking for inbound events and send-lifecycle
//! tracking for outbound messages.
//!
//! Backend failures are fail-closed: operations return `DedupeError` and the
//! caller surfaces 5xx so the task queue retries. The in-memory backends are
//! development-only and rejected at boot elsewhere.

mod memory;
mod sqlite;

pub use memory::{InMemoryInboundDedupe, InMemoryOutboundDedupe};
pub use sqlite::{SqliteInboundDedupe, SqliteOutboundDedupe};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::DedupeError;

/// Outcome of an inbound `mark_if_new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkResult {
    New,
    Duplicate,
}

impl MarkResult {
    pub fn is_new(self) -> bool {
        self == MarkResult::New
    }
}

/// Send lifecycle of an outbound dedupe entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
}

/// Result of an outbound `check_and_mark`.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupeResult {
    pub is_duplicate: bool,
    pub status: SendStatus,
    pub original_message_id: Option<String>,
    pub error: Option<String>,
}

impl DedupeResult {
    pub fn fresh() -> Self {
        DedupeResult {
            is_duplicate: false,
            status: SendStatus::Pending,
            original_message_id: None,
            error: None,
        }
    }
}

/// Inbound dedupe: marks presence only.
#[async_trait]
pub trait InboundDedupe: Send + Sync {
    /// Atomic set-if-absent with expiry.
    async fn mark_if_new(&self, key: &str, ttl_seconds: i64) -> Result<MarkResult, DedupeError>;
}

/// Outbound dedupe: tracks the full send lifecycle for end-to-end idempotency.
#[async_trait]
pub trait OutboundDedupe: Send + Sync {
    /// Create a `pending` entry if none exists (or the prior one expired);
    /// return the existing entry unmodified otherwise.
    async fn check_and_mark(
        &self,
        key: &str,
        intended_id: &str,
        ttl_seconds: i64,
    ) -> Result<DedupeResult, DedupeError>;

    /// Upgrade to `sent`. Terminal: never downgraded afterwards. Returns
    /// false when an unexpired `sent` entry already exists.
    async fn mark_sent(
        &self,
        key: &str,
        message_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError>;

    /// Record a failure. Last-writer semantics, except a `sent` entry is
    /// never overwritten.
    async fn mark_failed(
        &self,
        key: &str,
        error: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<bool, DedupeError>;
}
