//! Outbound dispatcher — idempotent send with the full failure taxonomy.
//!
//! Flow: validate → outbound dedupe lookup (already sent ⇒ stored result,
//! no provider call) → build payload → POST → upgrade the dedupe entry.
//! Retryable provider errors leave the entry `pending` so the queue retry
//! path reuses it; permanent failures mark it `failed`.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::builders::build_full_payload;
use super::http::HttpSender;
use super::models::{OutboundMessageRequest, OutboundMessageResponse};
use super::sanitize::sanitize_payload;
use super::validators::validate_outbound_request;
use crate::dedupe::{OutboundDedupe, SendStatus};
use crate::error::OutboundError;

pub struct OutboundClient {
    http: HttpSender,
    api_base_url: String,
    api_version: String,
    phone_number_id: String,
    access_token: String,
    dedupe: Arc<dyn OutboundDedupe>,
    dedupe_ttl_seconds: i64,
}

impl OutboundClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: HttpSender,
        api_base_url: &str,
        api_version: &str,
        phone_number_id: &str,
        access_token: &str,
        dedupe: Arc<dyn OutboundDedupe>,
        dedupe_ttl_seconds: i64,
    ) -> Self {
        OutboundClient {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            phone_number_id: phone_number_id.to_string(),
            access_token: access_token.to_string(),
            dedupe,
            dedupe_ttl_seconds,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.api_base_url, self.api_version, self.phone_number_id
        )
    }

    /// Send one message with end-to-end idempotency.
    pub async fn send(
        &self,
        request: &OutboundMessageRequest,
    ) -> Result<OutboundMessageResponse, OutboundError> {
        validate_outbound_request(request)
            .map_err(|e| OutboundError::Validation(e.to_string()))?;

        let key = request
            .idempotency_key
            .as_deref()
            .ok_or_else(|| OutboundError::Validation("idempotency_key is required".into()))?;

        let dedupe_result = self
            .dedupe
            .check_and_mark(key, key, self.dedupe_ttl_seconds)
            .await
            .map_err(|e| OutboundError::Retryable(format!("outbound dedupe unavailable: {e}")))?;

        if dedupe_result.is_duplicate && dedupe_result.status == SendStatus::Sent {
            info!(
                idempotency_key = key,
                "outbound_duplicate_short_circuit"
            );
            return Ok(OutboundMessageResponse::already_sent(
                dedupe_result.original_message_id.as_deref(),
            ));
        }

        let payload = build_full_payload(request)?;
        info!(
            message_type = %request.message_type,
            payload = %sanitize_payload(&payload),
            "outbound_payload_ready"
        );

        let response = match self
            .http
            .post_json(&self.endpoint(), &self.access_token, &payload)
            .await
        {
            Ok(body) => body,
            Err(e) if e.is_retryable() => {
                // leave the entry pending so the queue retry reuses it
                warn!(idempotency_key = key, error = %e, "outbound_send_retryable");
                return Err(e);
            }
            Err(e) => {
                self.safe_mark_failed(key, &e.to_string()).await;
                return Err(e);
            }
        };

        let message_id = response
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|m| m.first())
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .unwrap_or("unknown")
            .to_string();

        if !self.safe_mark_sent(key, &message_id).await {
            warn!(idempotency_key = key, "outbound_mark_sent_skipped");
        }

        info!(
            message_id = %message_id,
            idempotency_key = key,
            "message_sent_to_provider"
        );
        Ok(OutboundMessageResponse::sent(&message_id))
    }

    async fn safe_mark_sent(&self, key: &str, message_id: &str) -> bool {
        match self
            .dedupe
            .mark_sent(key, message_id, self.dedupe_ttl_seconds)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(error = %e, "outbound_mark_sent_error");
                false
            }
        }
    }

    async fn safe_mark_failed(&self, key: &str, error_message: &str) {
        if let Err(e) = self
            .dedupe
            .mark_failed(key, Some(error_message), self.dedupe_ttl_seconds)
            .await
        {
            error!(error = %e, "outbound_mark_failed_error");
        }
    }
}
