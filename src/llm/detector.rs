//! Stage 1 — event/intent detection with confidence gate.

use serde::Deserialize;
use strum::{Display, EnumString};
use tokio::time::timeout;
use tracing::{error, info};

use super::{LlmClient, strip_code_fences};
use crate::config::LlmStageSettings;
use crate::domain::ConversationState;

const CLOSING_TOKENS: [&str; 5] = ["ok", "entendi", "obrigado", "valeu", "show"];
const NEW_REQUEST_TOKENS: [&str; 5] = ["agora", "outra coisa", "além disso", "também", "mais uma"];

const FALLBACK_HINT: &str =
    "Não foi possível decidir com segurança; confirme se a solicitação foi atendida ou se há novo pedido.";
const GATE_HINT: &str =
    "Preciso de confirmação antes de mudar de estado. Você pode confirmar se a demanda foi atendida ou há outro pedido?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SelectorStatus {
    InProgress,
    Done,
    NeedsClarification,
    NewRequestDetected,
}

#[derive(Debug, Clone)]
pub struct StateSelectorInput {
    pub message_text: String,
    pub current_state: ConversationState,
    pub possible_next_states: Vec<ConversationState>,
    /// Already PII-masked, truncated to the last 5 entries by the caller.
    pub history_summary: Vec<String>,
    pub open_items: Vec<String>,
    pub fulfilled_items: Vec<String>,
    pub detected_requests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSelectorOutput {
    pub selected_state: ConversationState,
    pub confidence: f64,
    pub accepted: bool,
    pub next_state: ConversationState,
    pub response_hint: Option<String>,
    pub status: SelectorStatus,
    pub open_items: Vec<String>,
    pub fulfilled_items: Vec<String>,
    pub detected_requests: Vec<String>,
}

/// Cheap pre-check for closing or new-request signals. Clamps the maximum
/// confidence below the acceptance threshold when a signal fires.
fn deterministic_precheck(
    input: &StateSelectorInput,
    threshold: f64,
) -> (f64, Option<String>, SelectorStatus) {
    let text = input.message_text.to_lowercase();
    let mut max_confidence = 1.0_f64;
    let mut hint = None;
    let mut status = SelectorStatus::InProgress;

    if NEW_REQUEST_TOKENS.iter().any(|tok| text.contains(tok)) {
        status = SelectorStatus::NewRequestDetected;
        hint = Some("Parece um novo pedido. Confirme se é uma nova demanda antes de avançar.".to_string());
        max_confidence = max_confidence.min(threshold - 0.01);
    }

    let is_bare_closing = CLOSING_TOKENS.iter().any(|tok| *tok == text.trim());
    let closing_with_open_items =
        CLOSING_TOKENS.iter().any(|tok| text.contains(tok)) && !input.open_items.is_empty();
    if is_bare_closing || closing_with_open_items {
        status = SelectorStatus::NeedsClarification;
        hint = Some("Confirme se o atendimento foi concluído ou se há pendências em aberto.".to_string());
        max_confidence = max_confidence.min(threshold - 0.01);
    }

    (max_confidence, hint, status)
}

fn build_prompt(input: &StateSelectorInput) -> String {
    let allowed: Vec<String> = input
        .possible_next_states
        .iter()
        .chain(std::iter::once(&input.current_state))
        .map(ToString::to_string)
        .collect();
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "selected_state": {"type": "string", "enum": allowed},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "status": {"type": "string", "enum": ["in_progress", "done", "needs_clarification", "new_request_detected"]},
            "open_items": {"type": "array", "items": {"type": "string"}},
            "fulfilled_items": {"type": "array", "items": {"type": "string"}},
            "detected_requests": {"type": "array", "items": {"type": "string"}},
            "response_hint": {"type": "string"}
        },
        "required": ["selected_state", "confidence", "status"]
    });
    format!(
        "Você é um seletor de estado. Responda somente JSON válido.\n\
         Estado atual: {}\n\
         Próximos possíveis: {:?}\n\
         Mensagem: {}\n\
         Resumo histórico: {:?}\n\
         Pendências: {:?}\n\
         Atendidas: {:?}\n\
         Requests detectados: {:?}\n\
         Schema: {}",
        input.current_state,
        input
            .possible_next_states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        input.message_text,
        input.history_summary,
        input.open_items,
        input.fulfilled_items,
        input.detected_requests,
        schema
    )
}

#[derive(Debug, Deserialize)]
struct RawSelectorResponse {
    selected_state: Option<String>,
    confidence: Option<f64>,
    status: Option<SelectorStatus>,
    open_items: Option<Vec<String>>,
    fulfilled_items: Option<Vec<String>>,
    detected_requests: Option<Vec<String>>,
    response_hint: Option<String>,
}

fn fallback(input: &StateSelectorInput, pre_status: SelectorStatus) -> StateSelectorOutput {
    StateSelectorOutput {
        selected_state: input.current_state,
        confidence: 0.0,
        accepted: false,
        next_state: input.current_state,
        response_hint: Some(FALLBACK_HINT.to_string()),
        status: pre_status,
        open_items: input.open_items.clone(),
        fulfilled_items: input.fulfilled_items.clone(),
        detected_requests: input.detected_requests.clone(),
    }
}

/// Run Stage 1 with confidence gating and a safe fallback.
pub async fn detect_event(
    client: &dyn LlmClient,
    settings: &LlmStageSettings,
    input: &StateSelectorInput,
    correlation_id: &str,
    confidence_threshold: f64,
) -> StateSelectorOutput {
    let (max_confidence, pre_hint, pre_status) = deterministic_precheck(input, confidence_threshold);

    let prompt = build_prompt(input);
    let raw = match timeout(
        settings.timeout,
        client.complete(None, &prompt, &settings.model),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            error!(correlation_id, error = %e, "state_selector_llm_failed");
            return fallback(input, pre_status);
        }
        Err(_) => {
            error!(
                correlation_id,
                timeout_secs = settings.timeout.as_secs(),
                "state_selector_llm_timeout"
            );
            return fallback(input, pre_status);
        }
    };

    let parsed: RawSelectorResponse = match serde_json::from_str(strip_code_fences(&raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(correlation_id, error = %e, "state_selector_parse_failed");
            return fallback(input, pre_status);
        }
    };

    let allowed = |candidate: ConversationState| {
        candidate == input.current_state || input.possible_next_states.contains(&candidate)
    };
    let selected_state = parsed
        .selected_state
        .and_then(|raw| raw.parse::<ConversationState>().ok())
        .filter(|s| allowed(*s))
        .unwrap_or(input.current_state);

    let confidence = parsed.confidence.unwrap_or(0.0).clamp(0.0, 1.0).min(max_confidence);

    // Pre-check verdicts override whatever the model claims.
    let status = if pre_status == SelectorStatus::InProgress {
        parsed.status.unwrap_or(pre_status)
    } else {
        pre_status
    };

    let accepted = confidence >= confidence_threshold
        && matches!(status, SelectorStatus::InProgress | SelectorStatus::Done);
    let next_state = if accepted { selected_state } else { input.current_state };

    let mut response_hint = parsed.response_hint.or(pre_hint);
    if !accepted && response_hint.is_none() {
        response_hint = Some(GATE_HINT.to_string());
    }

    let output = StateSelectorOutput {
        selected_state,
        confidence,
        accepted,
        next_state,
        response_hint,
        status,
        open_items: parsed.open_items.unwrap_or_else(|| input.open_items.clone()),
        fulfilled_items: parsed
            .fulfilled_items
            .unwrap_or_else(|| input.fulfilled_items.clone()),
        detected_requests: parsed
            .detected_requests
            .unwrap_or_else(|| input.detected_requests.clone()),
    };

    info!(
        correlation_id,
        current_state = %input.current_state,
        selected_state = %output.selected_state,
        accepted = output.accepted,
        confidence = format!("{:.3}", output.confidence),
        status = %output.status,
        "state_selector_result"
    );
    output
}
