//! Domain types: normalized messages, the conversation FSM and decision
//! outputs. Everything in here is pure data and pure functions.

pub mod fsm;
pub mod message;
pub mod plan;

pub use fsm::{ActionTag, ConversationEvent, ConversationState, DispatchResult, dispatch};
pub use message::{InboundMessage, MessageBody, MessageType};
pub use plan::{MessagePlan, MessageSafety, PiiRisk, PlanKind};

use strum::{Display, EnumString};

/// Terminal classification of how a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    HandoffHuman,
    SelfServeInfo,
    RouteExternal,
    ScheduledFollowup,
    AwaitingUser,
    DuplicateOrSpam,
    Unsupported,
    FailedInternal,
}

impl Outcome {
    /// Outcomes that still expect further user interaction.
    pub fn is_open(self) -> bool {
        matches!(self, Outcome::AwaitingUser | Outcome::ScheduledFollowup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn outcome_round_trips_screaming_snake() {
        assert_eq!(Outcome::AwaitingUser.to_string(), "AWAITING_USER");
        assert_eq!(
            Outcome::from_str("DUPLICATE_OR_SPAM").unwrap(),
            Outcome::DuplicateOrSpam
        );
    }

    #[test]
    fn open_outcomes() {
        assert!(Outcome::AwaitingUser.is_open());
        assert!(Outcome::ScheduledFollowup.is_open());
        assert!(!Outcome::HandoffHuman.is_open());
        assert!(!Outcome::FailedInternal.is_open());
    }
}
