//! LLM decision stages.
//!
//! Three sequential stages (event detection, response generation,
//! message-type selection) plus the master decider. Every stage is wrapped
//! the same way: deterministic pre-check that may settle the result without
//! a call, an LLM call with an independent timeout, strict JSON parsing with
//! clamping, and a deterministic fallback. Nothing in this module raises
//! across a stage boundary.

mod client;
mod decider;
mod detector;
mod responder;
mod selector;

pub use client::{LlmClient, OpenAiChatClient, sanitize_api_error};
pub use decider::{MasterDecisionInput, MasterDecisionOutput, decide_master};
pub use detector::{SelectorStatus, StateSelectorInput, StateSelectorOutput, detect_event};
pub use responder::{ResponseGeneration, generate_response};
pub use selector::choose_message_plan;

/// Strip Markdown code fences some models wrap JSON responses in.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
