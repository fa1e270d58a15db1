//! Master decider — consolidates Stage 1 and Stage 2 into the final
//! executable decision.
//!
//! Deterministic rules fire first and avoid the LLM entirely; the LLM path
//! clamps everything it returns; the fallback leans on Stage 1's gate.

use serde::Deserialize;
use tokio::time::timeout;
use tracing::{error, info};

use super::{LlmClient, ResponseGeneration, StateSelectorOutput, strip_code_fences};
use crate::config::LlmStageSettings;
use crate::domain::{ConversationState, plan::PlanKind};

const CONFIRMATION_KEYWORDS: [&str; 5] =
    ["confirme", "confirmar", "finalizar", "encerrar", "resolvemos"];
const CLOSING_TOKENS: [&str; 4] = ["obrigado", "valeu", "ok", "show"];

#[derive(Debug, Clone)]
pub struct MasterDecisionInput {
    pub current_state: ConversationState,
    pub state_decision: StateSelectorOutput,
    pub response: ResponseGeneration,
    /// Index already picked by the earlier stages; the fallback keeps it.
    pub chosen_index: usize,
    pub last_user_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterDecisionOutput {
    pub final_state: ConversationState,
    pub apply_state: bool,
    pub selected_response_index: usize,
    pub selected_response_text: String,
    pub message_type: PlanKind,
    pub overall_confidence: f64,
    pub reason: String,
}

fn response_texts(response: &ResponseGeneration) -> Vec<String> {
    if response.options.is_empty() {
        vec![response.text_content.clone()]
    } else {
        response
            .options
            .iter()
            .map(|opt| opt.title.clone())
            .collect()
    }
}

fn confirmation_index(texts: &[String]) -> Option<usize> {
    texts.iter().position(|text| {
        let low = text.to_lowercase();
        CONFIRMATION_KEYWORDS.iter().any(|k| low.contains(k))
    })
}

fn deterministic_rules(input: &MasterDecisionInput) -> Option<MasterDecisionOutput> {
    let texts = response_texts(&input.response);

    // Stage 1 gated with a hint: pick the confirmation-styled response.
    if !input.state_decision.accepted && input.state_decision.response_hint.is_some() {
        let idx = confirmation_index(&texts).unwrap_or(0);
        return Some(MasterDecisionOutput {
            final_state: input.current_state,
            apply_state: false,
            selected_response_index: idx,
            selected_response_text: texts[idx].clone(),
            message_type: PlanKind::Text,
            overall_confidence: input.state_decision.confidence.min(0.7).max(0.0),
            reason: "hint_confirmation_auto".into(),
        });
    }

    // Closing token in the user text: take the first response, advance only
    // when Stage 1 accepted.
    let low = input.last_user_message.to_lowercase();
    if CLOSING_TOKENS.iter().any(|tok| low.contains(tok)) {
        let final_state = if input.state_decision.accepted {
            input.state_decision.next_state
        } else {
            input.current_state
        };
        return Some(MasterDecisionOutput {
            final_state,
            apply_state: input.state_decision.accepted,
            selected_response_index: 0,
            selected_response_text: texts[0].clone(),
            message_type: PlanKind::Text,
            overall_confidence: input.state_decision.confidence.min(0.85),
            reason: "closing_detected_auto".into(),
        });
    }

    None
}

fn build_prompt(input: &MasterDecisionInput) -> String {
    let states: Vec<String> = [
        ConversationState::Initial,
        ConversationState::Triage,
        ConversationState::CollectingInfo,
        ConversationState::GeneratingResponse,
        ConversationState::SelectingMessageType,
        ConversationState::AwaitingUser,
        ConversationState::Escalating,
        ConversationState::HandoffHuman,
        ConversationState::Completed,
        ConversationState::Failed,
        ConversationState::Spam,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "final_state": {"type": "string", "enum": states},
            "apply_state": {"type": "boolean"},
            "selected_response_index": {"type": "integer", "minimum": 0},
            "message_type": {"type": "string", "enum": ["TEXT", "INTERACTIVE_BUTTON", "INTERACTIVE_LIST", "REACTION", "STICKER"]},
            "overall_confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "reason": {"type": "string"}
        },
        "required": ["final_state", "apply_state", "selected_response_index", "message_type", "overall_confidence", "reason"]
    });
    format!(
        "Decida o estado final e qual resposta usar. \
         Prefira o next_state do seletor quando aceito. \
         Use o response_hint para reduzir ambiguidade. \
         Responda apenas JSON válido no schema abaixo. \
         current_state={} llm1_next={} llm1_status={} llm1_confidence={} \
         Responses: {:?} Hint: {:?} Schema: {}",
        input.current_state,
        input.state_decision.next_state,
        input.state_decision.status,
        input.state_decision.confidence,
        response_texts(&input.response),
        input.state_decision.response_hint,
        schema
    )
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    final_state: Option<String>,
    apply_state: Option<bool>,
    selected_response_index: Option<i64>,
    message_type: Option<String>,
    overall_confidence: Option<f64>,
    reason: Option<String>,
}

fn fallback(input: &MasterDecisionInput, reason: &str) -> MasterDecisionOutput {
    let texts = response_texts(&input.response);
    let idx = input.chosen_index.min(texts.len().saturating_sub(1));
    let final_state = if input.state_decision.accepted {
        input.state_decision.next_state
    } else {
        input.current_state
    };
    MasterDecisionOutput {
        final_state,
        apply_state: input.state_decision.accepted,
        selected_response_index: idx,
        selected_response_text: texts[idx].clone(),
        message_type: PlanKind::Text,
        overall_confidence: input.state_decision.confidence.min(0.75),
        reason: reason.to_string(),
    }
}

/// Combine Stage 1 + Stage 2 into the final executable decision.
pub async fn decide_master(
    client: &dyn LlmClient,
    settings: &LlmStageSettings,
    input: &MasterDecisionInput,
    correlation_id: &str,
) -> MasterDecisionOutput {
    if let Some(decision) = deterministic_rules(input) {
        info!(
            correlation_id,
            final_state = %decision.final_state,
            overall_confidence = format!("{:.3}", decision.overall_confidence),
            reason = %decision.reason,
            "master_decider_deterministic"
        );
        return decision;
    }

    let prompt = build_prompt(input);
    let raw = match timeout(
        settings.timeout,
        client.complete(None, &prompt, &settings.model),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            error!(correlation_id, error = %e, "master_decider_llm_failed");
            return fallback(input, "fallback: master decider call failed");
        }
        Err(_) => {
            error!(
                correlation_id,
                timeout_secs = settings.timeout.as_secs(),
                "master_decider_llm_timeout"
            );
            return fallback(input, "fallback: master decider timeout");
        }
    };

    let parsed: RawDecision = match serde_json::from_str(strip_code_fences(&raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(correlation_id, error = %e, "master_decider_parse_failed");
            return fallback(input, "fallback: master decider parse failed");
        }
    };

    let texts = response_texts(&input.response);
    let idx = parsed
        .selected_response_index
        .and_then(|i| usize::try_from(i).ok())
        .filter(|i| *i < texts.len())
        .unwrap_or(0);
    let final_state = parsed
        .final_state
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(input.state_decision.next_state);
    let overall_confidence = parsed
        .overall_confidence
        .unwrap_or(input.state_decision.confidence)
        .clamp(0.0, 1.0);
    let message_type = parsed
        .message_type
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(PlanKind::Text);
    let reason = parsed
        .reason
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "llm decision".to_string());

    let output = MasterDecisionOutput {
        final_state,
        apply_state: parsed.apply_state.unwrap_or(true),
        selected_response_index: idx,
        selected_response_text: texts[idx].clone(),
        message_type,
        overall_confidence,
        reason,
    };

    info!(
        correlation_id,
        current_state = %input.current_state,
        llm1_next_state = %input.state_decision.next_state,
        final_state = %output.final_state,
        overall_confidence = format!("{:.3}", output.overall_confidence),
        selected_response_index = output.selected_response_index,
        message_type = %output.message_type,
        "master_decider_result"
    );
    output
}
