//! Stage 3 — message-type selection.
//!
//! Runs strictly after Stage 2; its fallback is a simple heuristic:
//! up to three options become buttons, everything else is plain text.

use serde::Deserialize;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{LlmClient, ResponseGeneration, strip_code_fences};
use crate::config::LlmStageSettings;
use crate::domain::plan::{MessagePlan, MessageSafety, PiiRisk, PlanKind};

const MAX_BUTTON_OPTIONS: usize = 3;

fn build_prompt(response: &ResponseGeneration, intent: &str) -> String {
    // defense in depth: the response text is model-generated, mask anyway
    let text = crate::pii::mask_text(&response.text_content);
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "message_type": {
                "type": "string",
                "enum": ["TEXT", "INTERACTIVE_BUTTON", "INTERACTIVE_LIST", "REACTION", "STICKER"]
            },
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "rationale": {"type": "string"},
            "parameters": {"type": "object"}
        },
        "required": ["message_type", "confidence"]
    });
    format!(
        "Escolha o melhor tipo de mensagem WhatsApp. Responda somente JSON válido.\n\
         Texto: {text}\n\
         Opções disponíveis: {}\n\
         Intenção: {intent}\n\
         Schema: {schema}",
        response.options.len()
    )
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    message_type: Option<String>,
    confidence: Option<f64>,
    rationale: Option<String>,
    parameters: Option<serde_json::Value>,
}

/// Heuristic plan when the LLM result is unavailable or unusable.
fn fallback_plan(response: &ResponseGeneration, safety: MessageSafety) -> MessagePlan {
    if !response.options.is_empty() && response.options.len() <= MAX_BUTTON_OPTIONS {
        MessagePlan::buttons(
            response.text_content.clone(),
            response.options.clone(),
            0.5,
            "fallback: few options map to buttons",
        )
        .with_safety(safety)
    } else {
        MessagePlan::text(
            response.text_content.clone(),
            0.4,
            "fallback: plain text",
        )
        .with_safety(safety)
    }
}

/// Run Stage 3 and produce the executable `MessagePlan`.
pub async fn choose_message_plan(
    client: &dyn LlmClient,
    settings: &LlmStageSettings,
    intent: &str,
    response: &ResponseGeneration,
    correlation_id: &str,
) -> MessagePlan {
    let safety = MessageSafety {
        pii_risk: PiiRisk::Low,
        require_handoff: response.requires_human_review,
    };

    let prompt = build_prompt(response, intent);
    let raw = match timeout(
        settings.timeout,
        client.complete(None, &prompt, &settings.model),
    )
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            warn!(correlation_id, error = %e, fallback = "heuristic", "message_type_llm_failed");
            return fallback_plan(response, safety);
        }
        Err(_) => {
            warn!(
                correlation_id,
                timeout_secs = settings.timeout.as_secs(),
                "message_type_llm_timeout"
            );
            return fallback_plan(response, safety);
        }
    };

    let parsed: RawSelection = match serde_json::from_str(strip_code_fences(&raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(correlation_id, error = %e, "message_type_parse_failed");
            return fallback_plan(response, safety);
        }
    };

    let confidence = parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    let safety = MessageSafety {
        pii_risk: if confidence > 0.6 { PiiRisk::Low } else { PiiRisk::Medium },
        require_handoff: response.requires_human_review,
    };
    let rationale = parsed.rationale.unwrap_or_else(|| "llm selection".to_string());
    let kind = parsed
        .message_type
        .and_then(|raw| raw.parse::<PlanKind>().ok())
        .unwrap_or(PlanKind::Text);

    let plan = match kind {
        PlanKind::InteractiveButton if !response.options.is_empty() => MessagePlan::buttons(
            response.text_content.clone(),
            response.options.clone(),
            confidence,
            rationale,
        ),
        PlanKind::InteractiveList if !response.options.is_empty() => MessagePlan {
            kind: PlanKind::InteractiveList,
            ..MessagePlan::buttons(
                response.text_content.clone(),
                response.options.clone(),
                confidence,
                rationale,
            )
        },
        PlanKind::Reaction => {
            let emoji = parsed
                .parameters
                .as_ref()
                .and_then(|p| p.get("emoji"))
                .and_then(|e| e.as_str())
                .unwrap_or("👍")
                .to_string();
            MessagePlan {
                kind: PlanKind::Reaction,
                reaction_emoji: Some(emoji),
                ..MessagePlan::text(String::new(), confidence, rationale)
            }
        }
        PlanKind::Sticker => match parsed
            .parameters
            .as_ref()
            .and_then(|p| p.get("sticker_id"))
            .and_then(|s| s.as_str())
        {
            Some(sticker_id) => MessagePlan {
                kind: PlanKind::Sticker,
                sticker_id: Some(sticker_id.to_string()),
                ..MessagePlan::text(String::new(), confidence, rationale)
            },
            None => fallback_plan(response, safety),
        },
        // TEXT, or an interactive kind without options to back it
        _ => MessagePlan::text(response.text_content.clone(), confidence, rationale),
    }
    .with_safety(safety);

    info!(
        correlation_id,
        kind = %plan.kind,
        pii_risk = %plan.safety.pii_risk,
        confidence = format!("{:.3}", plan.confidence),
        "message_type_selected"
    );
    plan
}
