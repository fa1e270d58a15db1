use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `ZapGate`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Dedupe ───────────────────────────────────────────────────────────
    #[error("dedupe: {0}")]
    Dedupe(#[from] DedupeError),

    // ── Session ──────────────────────────────────────────────────────────
    #[error("session: {0}")]
    Session(#[from] SessionError),

    // ── Task queue ───────────────────────────────────────────────────────
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    // ── LLM stages ───────────────────────────────────────────────────────
    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    // ── Outbound dispatch ────────────────────────────────────────────────
    #[error("outbound: {0}")]
    Outbound(#[from] OutboundError),

    // ── Audit chain ──────────────────────────────────────────────────────
    #[error("audit: {0}")]
    Audit(#[from] AuditError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

// ─── Dedupe errors ──────────────────────────────────────────────────────────

/// Backend failure during a dedupe operation.
///
/// Policy is fail-closed: callers must not process the message, surface 5xx
/// instead so the queue retries.
#[derive(Debug, Error)]
pub enum DedupeError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("sqlx: {0}")]
    Sqlx(String),
}

impl From<sqlx::Error> for DedupeError {
    fn from(e: sqlx::Error) -> Self {
        DedupeError::Sqlx(e.to_string())
    }
}

// ─── Session errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store: {0}")]
    Store(String),

    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        SessionError::Store(e.to_string())
    }
}

// ─── Task queue errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("queue closed")]
    Closed,
}

// ─── LLM errors ─────────────────────────────────────────────────────────────

/// Stage-internal failures. These never cross the pipeline boundary — every
/// stage converts them into its deterministic fallback.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("stage timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("response parse failed: {0}")]
    Parse(String),

    #[error("llm disabled")]
    Disabled,
}

// ─── Outbound errors ────────────────────────────────────────────────────────

/// Failure taxonomy surfaced to dispatch callers.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("payload build error: {0}")]
    PayloadBuild(String),

    #[error("whatsapp api error ({error_type}/{error_code}): {message}")]
    Api {
        error_type: String,
        error_code: String,
        message: String,
    },

    #[error("retryable provider error: {0}")]
    Retryable(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl OutboundError {
    /// Stable error code for wire responses and dedupe records.
    pub fn code(&self) -> &'static str {
        match self {
            OutboundError::Validation(_) => "VALIDATION_ERROR",
            OutboundError::PayloadBuild(_) => "PAYLOAD_BUILD_ERROR",
            OutboundError::Api { .. } => "WHATSAPP_API_ERROR",
            OutboundError::Retryable(_) => "WHATSAPP_RETRYABLE_ERROR",
            OutboundError::Permanent(_) => "WHATSAPP_PERMANENT_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, OutboundError::Retryable(_))
    }
}

// ─── Audit errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("chain conflict for user_key {user_key}: expected prev {expected:?}, observed {observed:?}")]
    ChainConflict {
        user_key: String,
        expected: Option<String>,
        observed: Option<String>,
    },

    #[error("store: {0}")]
    Store(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Store(e.to_string())
    }
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
