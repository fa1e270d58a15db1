//! Flood, spam and intent-capacity protection.
//!
//! Three independent checks evaluated in order; any hit short-circuits the
//! pipeline. Flood detection is fail-safe: a backend error never classifies
//! a message as flooded, it is logged instead.

mod flood;

pub use flood::{FloodDetectionResult, FloodDetector, InMemoryFloodDetector, SqliteFloodDetector};

use tracing::warn;

use crate::domain::Outcome;
use crate::session::SessionState;

const MIN_MESSAGE_LENGTH: usize = 2;
const MAX_REPETITION_RATIO: f64 = 0.8;

/// Verdict of the abuse guard for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseVerdict {
    Clean,
    Flood,
    Spam,
    IntentCapacity,
}

impl AbuseVerdict {
    pub fn is_abusive(self) -> bool {
        self != AbuseVerdict::Clean
    }

    /// Outcome to persist on the session when this verdict short-circuits.
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            AbuseVerdict::Clean => None,
            AbuseVerdict::Flood | AbuseVerdict::Spam => Some(Outcome::DuplicateOrSpam),
            AbuseVerdict::IntentCapacity => Some(Outcome::ScheduledFollowup),
        }
    }
}

/// Content heuristics. Intentionally small and deterministic.
pub struct SpamDetector;

impl SpamDetector {
    pub fn is_spam(text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_MESSAGE_LENGTH {
            // empty is invalid, not spam
            return false;
        }

        let total = trimmed.chars().count();
        let unique = trimmed
            .chars()
            .collect::<std::collections::HashSet<_>>()
            .len();
        let repetition_ratio = 1.0 - (unique as f64 / total as f64);
        repetition_ratio > MAX_REPETITION_RATIO
    }
}

/// Composes the three checks against a session.
pub struct AbuseGuard {
    flood: std::sync::Arc<dyn FloodDetector>,
    max_intents: usize,
}

impl AbuseGuard {
    pub fn new(flood: std::sync::Arc<dyn FloodDetector>, max_intents: usize) -> Self {
        AbuseGuard { flood, max_intents }
    }

    pub async fn check(&self, session: &SessionState, text: Option<&str>) -> AbuseVerdict {
        match self.flood.check_and_record(&session.session_id).await {
            Ok(result) if result.is_flooded => {
                warn!(
                    session_id = %&session.session_id[..session.session_id.len().min(8)],
                    message_count = result.message_count,
                    threshold = result.threshold,
                    window_seconds = result.time_window_seconds,
                    "flood_detected"
                );
                return AbuseVerdict::Flood;
            }
            Ok(_) => {}
            Err(e) => {
                // fail-safe: do not classify as flood on backend error
                warn!(error = %e, "flood_detector_error");
            }
        }

        if let Some(text) = text {
            if SpamDetector::is_spam(text) {
                warn!(
                    session_id = %&session.session_id[..session.session_id.len().min(8)],
                    "spam_detected"
                );
                return AbuseVerdict::Spam;
            }
        }

        let unfulfilled = session.outcome.map(Outcome::is_open).unwrap_or(true);
        if session.intent_queue_at_capacity(self.max_intents) && unfulfilled {
            warn!(
                session_id = %&session.session_id[..session.session_id.len().min(8)],
                total_intents = session.intent_queue.len(),
                "intent_capacity_reached"
            );
            return AbuseVerdict::IntentCapacity;
        }

        AbuseVerdict::Clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::IntentEntry;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn session() -> SessionState {
        SessionState::new("5511999999999", Duration::minutes(30))
    }

    fn guard(threshold: u32) -> AbuseGuard {
        AbuseGuard::new(Arc::new(InMemoryFloodDetector::new(threshold, 60)), 3)
    }

    #[test]
    fn repeated_chars_are_spam() {
        assert!(SpamDetector::is_spam("aaaaaaaaaaaaaaaaaaaa"));
        assert!(SpamDetector::is_spam("aaaaaaaaaaaaaaaaaab"));
    }

    #[test]
    fn normal_text_is_not_spam() {
        assert!(!SpamDetector::is_spam("Olá, preciso de ajuda com meu pedido"));
    }

    #[test]
    fn short_or_empty_text_is_not_spam() {
        assert!(!SpamDetector::is_spam(""));
        assert!(!SpamDetector::is_spam("a"));
        assert!(!SpamDetector::is_spam("  "));
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let verdict = guard(10).check(&session(), Some("Olá, tudo bem?")).await;
        assert_eq!(verdict, AbuseVerdict::Clean);
        assert!(verdict.outcome().is_none());
    }

    #[tokio::test]
    async fn flood_trips_after_threshold_messages() {
        let guard = guard(3);
        let session = session();
        assert_eq!(guard.check(&session, Some("um")).await, AbuseVerdict::Clean);
        assert_eq!(guard.check(&session, Some("dois")).await, AbuseVerdict::Clean);
        assert_eq!(guard.check(&session, Some("três")).await, AbuseVerdict::Clean);
        let verdict = guard.check(&session, Some("quatro")).await;
        assert_eq!(verdict, AbuseVerdict::Flood);
        assert_eq!(verdict.outcome(), Some(Outcome::DuplicateOrSpam));
    }

    #[tokio::test]
    async fn spam_content_is_flagged() {
        let verdict = guard(10).check(&session(), Some("zzzzzzzzzzzzzzzz")).await;
        assert_eq!(verdict, AbuseVerdict::Spam);
        assert_eq!(verdict.outcome(), Some(Outcome::DuplicateOrSpam));
    }

    #[tokio::test]
    async fn full_intent_queue_is_scheduled_followup() {
        let guard = guard(10);
        let mut session = session();
        for i in 0..3 {
            session.push_intent(
                IntentEntry {
                    intent: format!("intent-{i}"),
                    confidence: 0.8,
                    arrived_at: Utc::now(),
                },
                3,
            );
        }
        let verdict = guard.check(&session, Some("mais uma coisa")).await;
        assert_eq!(verdict, AbuseVerdict::IntentCapacity);
        assert_eq!(verdict.outcome(), Some(Outcome::ScheduledFollowup));
    }

    #[tokio::test]
    async fn fulfilled_session_with_full_queue_is_clean() {
        let guard = guard(10);
        let mut session = session();
        session.outcome = Some(Outcome::SelfServeInfo);
        for i in 0..3 {
            session.push_intent(
                IntentEntry {
                    intent: format!("intent-{i}"),
                    confidence: 0.8,
                    arrived_at: Utc::now(),
                },
                3,
            );
        }
        assert_eq!(guard.check(&session, Some("obrigado")).await, AbuseVerdict::Clean);
    }
}
