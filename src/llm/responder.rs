//! Stage 2 — response generation.

use serde::Deserialize;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::{LlmClient, strip_code_fences};
use crate::config::LlmStageSettings;
use crate::domain::ConversationState;
use crate::domain::plan::PlanOption;

const FALLBACK_TEXT: &str =
    "Recebi sua mensagem! Só um instante enquanto organizo as informações. Você pode confirmar se a solicitação foi atendida?";

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseGeneration {
    pub text_content: String,
    pub options: Vec<PlanOption>,
    pub suggested_next_state: Option<ConversationState>,
    pub requires_human_review: bool,
    pub confidence: f64,
    pub rationale: String,
}

impl ResponseGeneration {
    pub fn fallback() -> Self {
        ResponseGeneration {
            text_content: FALLBACK_TEXT.to_string(),
            options: vec![
                PlanOption {
                    id: "opt_confirm".into(),
                    title: "Sim, resolvido".into(),
                },
                PlanOption {
                    id: "opt_pending".into(),
                    title: "Ainda preciso".into(),
                },
                PlanOption {
                    id: "opt_other".into(),
                    title: "Outro assunto".into(),
                },
            ],
            suggested_next_state: None,
            requires_human_review: false,
            confidence: 0.3,
            rationale: "deterministic fallback".into(),
        }
    }
}

fn build_prompt(
    user_text: &str,
    detected_intent: &str,
    current_state: ConversationState,
    next_state: ConversationState,
    history_summary: &[String],
    min_responses: usize,
) -> String {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "text_content": {"type": "string"},
            "options": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"id": {"type": "string"}, "title": {"type": "string"}},
                    "required": ["id", "title"]
                }
            },
            "suggested_next_state": {"type": "string"},
            "requires_human_review": {"type": "boolean"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "rationale": {"type": "string"}
        },
        "required": ["text_content", "confidence"]
    });
    format!(
        "Você gera a resposta ao usuário. Responda somente JSON válido.\n\
         Mensagem: {user_text}\n\
         Intenção detectada: {detected_intent}\n\
         Estado atual: {current_state}\n\
         Próximo estado: {next_state}\n\
         Histórico: {history_summary:?}\n\
         Quando oferecer opções interativas, gere pelo menos {min_responses}.\n\
         Schema: {schema}"
    )
}

#[derive(Debug, Deserialize)]
struct RawOption {
    id: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    text_content: Option<String>,
    options: Option<Vec<RawOption>>,
    suggested_next_state: Option<String>,
    requires_human_review: Option<bool>,
    confidence: Option<f64>,
    rationale: Option<String>,
}

/// Run Stage 2. Inputs are constructed by the caller before the stage is
/// dispatched, so this stage has no data dependency on Stage 1's output.
#[allow(clippy::too_many_arguments)]
pub async fn generate_response(
    client: &dyn LlmClient,
    settings: &LlmStageSettings,
    user_text: &str,
    detected_intent: &str,
    current_state: ConversationState,
    next_state: ConversationState,
    history_summary: &[String],
    correlation_id: &str,
    min_responses: usize,
) -> ResponseGeneration {
    let prompt = build_prompt(
        user_text,
        detected_intent,
        current_state,
        next_state,
        history_summary,
        min_responses,
    );

    let raw = match timeout(
        settings.timeout,
        client.complete(None, &prompt, &settings.model),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            error!(correlation_id, error = %e, "response_generator_llm_failed");
            return ResponseGeneration::fallback();
        }
        Err(_) => {
            error!(
                correlation_id,
                timeout_secs = settings.timeout.as_secs(),
                "response_generator_llm_timeout"
            );
            return ResponseGeneration::fallback();
        }
    };

    let parsed: RawResponse = match serde_json::from_str(strip_code_fences(&raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(correlation_id, error = %e, "response_generator_parse_failed");
            return ResponseGeneration::fallback();
        }
    };

    let text_content = match parsed.text_content.filter(|t| !t.trim().is_empty()) {
        Some(text) => text,
        None => {
            error!(correlation_id, "response_generator_empty_text");
            return ResponseGeneration::fallback();
        }
    };

    let mut options: Vec<PlanOption> = parsed
        .options
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, opt)| PlanOption {
            id: opt.id.unwrap_or_else(|| format!("opt_{i}")),
            title: opt.title.unwrap_or_else(|| "Opção".to_string()),
        })
        .collect();

    // Contractual minimum applies only when interactive output is expected.
    if !options.is_empty() && options.len() < min_responses {
        warn!(
            correlation_id,
            options = options.len(),
            min = min_responses,
            "response_generator_below_min_options"
        );
        options.clear();
    }

    let output = ResponseGeneration {
        text_content,
        options,
        suggested_next_state: parsed
            .suggested_next_state
            .and_then(|raw| raw.parse().ok()),
        requires_human_review: parsed.requires_human_review.unwrap_or(false),
        confidence: parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        rationale: parsed.rationale.unwrap_or_default(),
    };

    info!(
        correlation_id,
        text_len = output.text_content.len(),
        options = output.options.len(),
        confidence = format!("{:.3}", output.confidence),
        requires_human_review = output.requires_human_review,
        "response_generator_result"
    );
    output
}
