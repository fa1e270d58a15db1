//! Conversation finite-state machine.
//!
//! `dispatch` is a pure, total function over `(state, event)`: no side
//! effects, no I/O, identical result for identical inputs. Invalid pairs —
//! including any event on a terminal state — come back as `valid == false`
//! with a non-empty error, never as a panic.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Initial,
    Triage,
    CollectingInfo,
    GeneratingResponse,
    SelectingMessageType,
    AwaitingUser,
    Escalating,
    HandoffHuman,
    Completed,
    Failed,
    Spam,
}

impl ConversationState {
    pub const TERMINAL: [ConversationState; 4] = [
        ConversationState::HandoffHuman,
        ConversationState::Completed,
        ConversationState::Failed,
        ConversationState::Spam,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationEvent {
    UserSentText,
    EventDetected,
    ClarificationNeeded,
    ResponseGenerated,
    MessageTypeSelected,
    HandoffRequested,
    HandoffCompleted,
    ConversationClosed,
    SessionTimeout,
    InternalError,
    AbuseDetected,
}

/// Side-effect tags a valid transition instructs the caller to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTag {
    DetectEvent,
    ValidateInput,
    GenerateResponse,
    SelectMessageType,
    PersistSession,
    EmitOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub valid: bool,
    pub next_state: Option<ConversationState>,
    pub actions: Vec<ActionTag>,
    pub error: Option<String>,
}

impl DispatchResult {
    fn transition(next: ConversationState, actions: Vec<ActionTag>) -> Self {
        DispatchResult {
            valid: true,
            next_state: Some(next),
            actions,
            error: None,
        }
    }

    fn invalid(state: ConversationState, event: ConversationEvent) -> Self {
        DispatchResult {
            valid: false,
            next_state: None,
            actions: Vec::new(),
            error: Some(format!("no transition for {event} in state {state}")),
        }
    }
}

/// Every transition into a terminal state carries these.
fn terminal_actions() -> Vec<ActionTag> {
    vec![ActionTag::PersistSession, ActionTag::EmitOutcome]
}

/// Dispatch an event against the transition table.
pub fn dispatch(state: ConversationState, event: ConversationEvent) -> DispatchResult {
    use ActionTag as A;
    use ConversationEvent as E;
    use ConversationState as S;

    if state.is_terminal() {
        return DispatchResult {
            valid: false,
            next_state: None,
            actions: Vec::new(),
            error: Some(format!("state {state} is terminal")),
        };
    }

    // Abuse and internal errors short-circuit from any live state.
    match event {
        E::AbuseDetected => return DispatchResult::transition(S::Spam, terminal_actions()),
        E::InternalError => return DispatchResult::transition(S::Failed, terminal_actions()),
        _ => {}
    }

    match (state, event) {
        (S::Initial, E::UserSentText) => {
            DispatchResult::transition(S::Triage, vec![A::DetectEvent, A::ValidateInput])
        }

        (S::Triage, E::EventDetected) => {
            DispatchResult::transition(S::GeneratingResponse, vec![A::GenerateResponse])
        }
        (S::Triage, E::ClarificationNeeded) => {
            DispatchResult::transition(S::CollectingInfo, vec![A::GenerateResponse])
        }

        (S::CollectingInfo, E::UserSentText) => {
            DispatchResult::transition(S::Triage, vec![A::DetectEvent, A::ValidateInput])
        }
        (S::CollectingInfo, E::ResponseGenerated) => {
            DispatchResult::transition(S::SelectingMessageType, vec![A::SelectMessageType])
        }
        (S::CollectingInfo, E::SessionTimeout) => {
            DispatchResult::transition(S::Completed, terminal_actions())
        }

        (S::GeneratingResponse, E::ResponseGenerated) => {
            DispatchResult::transition(S::SelectingMessageType, vec![A::SelectMessageType])
        }
        (S::GeneratingResponse, E::HandoffRequested) => {
            DispatchResult::transition(S::Escalating, vec![A::PersistSession])
        }

        (S::SelectingMessageType, E::MessageTypeSelected) => {
            DispatchResult::transition(S::AwaitingUser, vec![A::PersistSession])
        }
        (S::SelectingMessageType, E::HandoffRequested) => {
            DispatchResult::transition(S::Escalating, vec![A::PersistSession])
        }

        (S::AwaitingUser, E::UserSentText) => {
            DispatchResult::transition(S::Triage, vec![A::DetectEvent, A::ValidateInput])
        }
        (S::AwaitingUser, E::ConversationClosed) => {
            DispatchResult::transition(S::Completed, terminal_actions())
        }
        (S::AwaitingUser, E::SessionTimeout) => {
            DispatchResult::transition(S::Completed, terminal_actions())
        }
        (S::AwaitingUser, E::HandoffRequested) => {
            DispatchResult::transition(S::Escalating, vec![A::PersistSession])
        }

        (S::Escalating, E::HandoffCompleted) => {
            DispatchResult::transition(S::HandoffHuman, terminal_actions())
        }

        _ => DispatchResult::invalid(state, event),
    }
}
