//! Provider HTTP sender with retry classification and an optional circuit
//! breaker.
//!
//! 429 and 5xx are retryable with exponential backoff `base * 2^attempt`
//! capped at `max_backoff`; transport timeouts and connection errors are
//! treated the same. Other 4xx are permanent and exhausted immediately.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::breaker::CircuitBreaker;
use crate::error::OutboundError;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt)).min(max)
}

/// Parse the provider error envelope `{"error": {"message", "type", "code"}}`.
fn provider_error(status: u16, body: &Value) -> OutboundError {
    let block = body.get("error");
    let message = block
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("provider error")
        .to_string();
    let error_type = block
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let error_code = block
        .and_then(|e| e.get("code"))
        .map(ToString::to_string)
        .unwrap_or_else(|| status.to_string());
    OutboundError::Api {
        error_type,
        error_code,
        message,
    }
}

pub struct HttpSender {
    client: reqwest::Client,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl HttpSender {
    pub fn new(timeout: Duration, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        HttpSender {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            breaker,
        }
    }

    /// Test hook: shrink retry/backoff windows.
    pub fn with_retry_policy(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// POST JSON with bearer auth, classified retries and breaker gating.
    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        payload: &Value,
    ) -> Result<Value, OutboundError> {
        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request().await {
                warn!("circuit_breaker_fast_fail");
                return Err(OutboundError::Permanent("circuit breaker open".into()));
            }
        }

        let result = self.post_with_retry(url, bearer_token, payload).await;

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.record_success().await,
                Err(e) => {
                    breaker.record_failure(e.is_retryable()).await;
                }
            }
        }

        result
    }

    async fn post_with_retry(
        &self,
        url: &str,
        bearer_token: &str,
        payload: &Value,
    ) -> Result<Value, OutboundError> {
        let mut last_error = OutboundError::Retryable("no attempts made".into());

        for attempt in 0..=self.max_retries {
            debug!(attempt = attempt + 1, max = self.max_retries + 1, "provider_request");

            match self
                .client
                .post(url)
                .bearer_auth(bearer_token)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            OutboundError::Api {
                                error_type: "decode".into(),
                                error_code: status.to_string(),
                                message: e.to_string(),
                            }
                        });
                    }

                    let body: Value = response.json().await.unwrap_or(Value::Null);
                    if is_retryable_status(status) {
                        warn!(status, attempt = attempt + 1, "provider_retryable_status");
                        last_error = OutboundError::Retryable(format!("HTTP {status}"));
                    } else {
                        error!(status, "provider_permanent_status");
                        let api = provider_error(status, &body);
                        return Err(OutboundError::Permanent(api.to_string()));
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(attempt = attempt + 1, error = %e, "provider_transport_error");
                    last_error = OutboundError::Retryable(format!("transport: {e}"));
                }
                Err(e) => {
                    error!(error = %e, "provider_unexpected_error");
                    return Err(OutboundError::Api {
                        error_type: "transport".into(),
                        error_code: "unknown".into(),
                        message: e.to_string(),
                    });
                }
            }

            if attempt < self.max_retries {
                let delay = backoff_delay(attempt, self.backoff_base, self.backoff_max);
                info!(backoff_ms = delay.as_millis() as u64, next_attempt = attempt + 2, "provider_backoff");
                tokio::time::sleep(delay).await;
            }
        }

        error!(total_attempts = self.max_retries + 1, "provider_retries_exhausted");
        Err(last_error)
    }
}
