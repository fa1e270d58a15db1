//! Message plan — the executable output of the decision pipeline.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanKind {
    Text,
    InteractiveButton,
    InteractiveList,
    Reaction,
    Sticker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PiiRisk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MessageSafety {
    pub pii_risk: PiiRisk,
    pub require_handoff: bool,
}

impl Default for MessageSafety {
    fn default() -> Self {
        MessageSafety {
            pii_risk: PiiRisk::Low,
            require_handoff: false,
        }
    }
}

/// An interactive option (button or list row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOption {
    pub id: String,
    pub title: String,
}

/// Produced by the decision pipeline, consumed by the payload builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePlan {
    pub kind: PlanKind,
    pub text: String,
    pub options: Vec<PlanOption>,
    pub reaction_emoji: Option<String>,
    pub sticker_id: Option<String>,
    pub safety: MessageSafety,
    pub confidence: f64,
    pub reason: String,
}

impl MessagePlan {
    pub fn text(text: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        MessagePlan {
            kind: PlanKind::Text,
            text: text.into(),
            options: Vec::new(),
            reaction_emoji: None,
            sticker_id: None,
            safety: MessageSafety::default(),
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
        }
    }

    pub fn buttons(
        text: impl Into<String>,
        options: Vec<PlanOption>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        MessagePlan {
            kind: PlanKind::InteractiveButton,
            options,
            ..MessagePlan::text(text, confidence, reason)
        }
    }

    pub fn with_safety(mut self, safety: MessageSafety) -> Self {
        self.safety = safety;
        self
    }
}
