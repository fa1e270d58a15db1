//! HTTP handlers: admission, verification handshake and the internal task
//! endpoints the queue pushes to.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::processing_log::ProcessingLogEntry;
use super::signature::{constant_time_token_eq, verify_meta_signature};
use super::{AppState, WhatsAppVerifyQuery};
use crate::error::GatewayError;
use crate::ids::new_correlation_id;
use crate::normalizer::first_message_id;
use crate::queue::{PushHttpQueue, QueuedTask};
use crate::whatsapp::{OutboundMessageRequest, OutboundMessageResponse};

/// Inbound event id: first `messages[].id`, else a hash of the raw bytes.
pub(super) fn compute_inbound_event_id(payload: &Value, raw_body: &[u8]) -> String {
    if let Some(message_id) = first_message_id(payload) {
        return message_id;
    }
    let mut hasher = Sha256::new();
    hasher.update(raw_body);
    format!("payload:{}", hex::encode(hasher.finalize()))
}

/// GET /health — always public (no secrets leaked)
pub(super) async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": state.settings.service_name,
        "version": state.settings.version,
    }))
}

/// GET /webhooks/whatsapp — Meta webhook verification
pub(super) async fn handle_whatsapp_verify(
    State(state): State<AppState>,
    Query(params): Query<WhatsAppVerifyQuery>,
) -> impl IntoResponse {
    let Some(ref verify_token) = state.settings.verify_token else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_verify_token".to_string(),
        );
    };

    let token_matches = params
        .verify_token
        .as_deref()
        .is_some_and(|token| constant_time_token_eq(token, verify_token));
    if params.mode.as_deref() == Some("subscribe") && token_matches {
        if let Some(challenge) = params.challenge {
            info!("webhook_verified");
            return (StatusCode::OK, challenge);
        }
        return (StatusCode::BAD_REQUEST, "missing hub.challenge".to_string());
    }

    warn!("webhook_verification_failed");
    (StatusCode::FORBIDDEN, "Forbidden".to_string())
}

/// POST /webhooks/whatsapp — admission: verify, parse, dedupe, enqueue.
///
/// Never blocks on anything slower than a dedupe mark and an enqueue.
pub(super) async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let mut signature_validated = false;
    let mut signature_skipped = false;

    match state.settings.webhook_secret.as_deref() {
        Some(secret) => {
            let signature = headers
                .get("X-Hub-Signature-256")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !verify_meta_signature(secret, &body, signature) {
                warn!(
                    signature = if signature.is_empty() { "missing" } else { "invalid" },
                    "invalid_webhook_signature"
                );
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "invalid_signature"})),
                );
            }
            signature_validated = true;
        }
        None => {
            // boot validation forbids this outside development
            if !state.settings.environment.is_development() {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "missing_webhook_secret"})),
                );
            }
            signature_skipped = true;
        }
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_json"})),
        );
    };

    let inbound_event_id = compute_inbound_event_id(&payload, &body);
    let correlation_id = new_correlation_id();

    let admission_key = state
        .settings
        .dedupe_key(&format!("admission:{inbound_event_id}"));
    let mark = match state
        .admission_dedupe
        .mark_if_new(&admission_key, state.settings.dedupe_ttl_seconds)
        .await
    {
        Ok(mark) => mark,
        Err(e) => {
            error!(error = %e, "admission_dedupe_unavailable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "dedupe_backend_unavailable"})),
            );
        }
    };

    if !mark.is_new() {
        info!(inbound_event_id = %inbound_event_id, "webhook_duplicate");
        return (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "enqueued": false,
                "inbound_event_id": inbound_event_id,
                "signature_validated": signature_validated,
                "signature_skipped": signature_skipped,
            })),
        );
    }

    let task = QueuedTask::Inbound {
        payload,
        inbound_event_id: inbound_event_id.clone(),
        correlation_id: Some(correlation_id.clone()),
    };
    let task_id = match state.queue.enqueue(task).await {
        Ok(task_id) => task_id,
        Err(e) => {
            error!(error = %e, "enqueue_failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "enqueue_failed"})),
            );
        }
    };

    // observability only, never fails the webhook
    let log_entry = ProcessingLogEntry {
        inbound_event_id: inbound_event_id.clone(),
        received_at: Utc::now(),
        enqueued: true,
        signature_validated,
        signature_skipped,
        correlation_id: Some(correlation_id),
    };
    if let Err(e) = state.processing_log.record(&log_entry).await {
        warn!(error = %e, "processing_log_write_failed");
    }

    info!(
        task_id = %task_id,
        inbound_event_id = %inbound_event_id,
        signature_validated,
        "webhook_enqueued"
    );
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "enqueued": true,
            "task_id": task_id,
            "inbound_event_id": inbound_event_id,
            "signature_validated": signature_validated,
            "signature_skipped": signature_skipped,
        })),
    )
}

fn internal_token_valid(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(ref expected) = state.settings.internal_task_token else {
        // development without a token configured accepts internal calls
        return state.settings.environment.is_development();
    };
    headers
        .get(PushHttpQueue::TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|provided| constant_time_token_eq(provided, expected))
}

#[derive(serde::Deserialize)]
pub(super) struct ProcessInboundBody {
    pub payload: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub inbound_event_id: Option<String>,
}

/// POST /internal/process_inbound — worker entry point for inbound tasks.
pub(super) async fn handle_process_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !internal_token_valid(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized_internal_call"})),
        );
    }

    let Ok(task) = serde_json::from_slice::<ProcessInboundBody>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_json"})),
        );
    };

    let inbound_event_id = task
        .inbound_event_id
        .unwrap_or_else(|| compute_inbound_event_id(&task.payload, &body));
    let correlation_id = task.correlation_id.unwrap_or_else(new_correlation_id);

    match state
        .pipeline
        .process_inbound(&task.payload, &inbound_event_id, &correlation_id)
        .await
    {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::to_value(&summary).unwrap_or_default()),
        ),
        Err(GatewayError::Dedupe(e)) => {
            error!(error = %e, "worker_dedupe_unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "dedupe_backend_unavailable"})),
            )
        }
        Err(GatewayError::Queue(e)) => {
            error!(error = %e, "worker_enqueue_outbound_failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "enqueue_outbound_failed"})),
            )
        }
        Err(e) => {
            error!(error = %e, "worker_internal_error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            )
        }
    }
}

/// POST /internal/process_outbound — idempotent send with retry-aware codes:
/// 200 sent/duplicate, 400 permanent, 503 retryable (queue retries), 502
/// unclassified.
pub(super) async fn handle_process_outbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !internal_token_valid(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized_internal_call"})),
        );
    }

    let Ok(request) = serde_json::from_slice::<OutboundMessageRequest>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_outbound_payload"})),
        );
    };

    if request.idempotency_key.as_deref().map_or(true, str::is_empty) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing_idempotency_key"})),
        );
    }

    match state.outbound.send(&request).await {
        Ok(response) => (
            StatusCode::OK,
            Json(outbound_response_body(&response, &request)),
        ),
        Err(e) => {
            let status = match e {
                crate::error::OutboundError::Validation(_)
                | crate::error::OutboundError::PayloadBuild(_)
                | crate::error::OutboundError::Permanent(_) => StatusCode::BAD_REQUEST,
                crate::error::OutboundError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
                crate::error::OutboundError::Api { .. } => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %e, code = e.code(), "outbound_task_failed");
            let response = OutboundMessageResponse::failed(&e);
            (status, Json(outbound_response_body(&response, &request)))
        }
    }
}

/// Serialize the dispatch result and wrap it with the task envelope fields.
fn outbound_response_body(
    response: &OutboundMessageResponse,
    request: &OutboundMessageRequest,
) -> Value {
    let mut body = serde_json::to_value(response).unwrap_or_else(|_| json!({}));
    if let Some(object) = body.as_object_mut() {
        object.insert("ok".into(), json!(response.success));
        object.insert(
            "status".into(),
            json!(if response.success { "sent" } else { "failed" }),
        );
        object.insert("idempotency_key".into(), json!(request.idempotency_key));
        object.insert("correlation_id".into(), json!(request.correlation_id));
        object.insert("inbound_event_id".into(), json!(request.inbound_event_id));
    }
    body
}
