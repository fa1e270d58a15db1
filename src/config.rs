//! Environment-driven settings with boot-time validation.
//!
//! ZapGate is configured entirely through environment variables so the same
//! image runs unchanged across development, staging and production. The
//! validation step is deliberately strict outside development: unconfigured
//! secrets and in-memory backends are boot failures, not warnings.

use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment. Gates in-memory backends and secret requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid {
                name: "ENVIRONMENT",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_development(self) -> bool {
        self == Environment::Development
    }
}

/// Persistence backend selector for dedupe, sessions and audit.
///
/// `kv` and `document` are accepted as aliases for `sqlite`: both substrate
/// roles are served by the same SQLite store (TTL column + transactions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl StoreBackend {
    fn parse(name: &'static str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" | "kv" | "document" => Ok(StoreBackend::Sqlite),
            other => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
            }),
        }
    }
}

/// Task queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    PushHttp,
}

impl QueueBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "memory" => Ok(QueueBackend::Memory),
            "push_http" => Ok(QueueBackend::PushHttp),
            other => Err(ConfigError::Invalid {
                name: "QUEUE_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-stage LLM settings.
#[derive(Debug, Clone)]
pub struct LlmStageSettings {
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub confidence_threshold: f64,
    pub detector: LlmStageSettings,
    pub responder: LlmStageSettings,
    pub selector: LlmStageSettings,
    pub decider: LlmStageSettings,
    /// Minimum interactive options LLM #2 must produce.
    pub min_responses: usize,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub fail_max: u32,
    pub reset_timeout: Duration,
    pub half_open_max: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: &'static str,
    pub version: &'static str,
    pub environment: Environment,

    // HTTP surface
    pub host: String,
    pub port: u16,

    // Signature & secrets
    pub webhook_secret: Option<String>,
    pub verify_token: Option<String>,
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub user_key_pepper: Option<String>,

    // Provider endpoint
    pub whatsapp_api_base_url: String,
    pub whatsapp_api_version: String,
    pub whatsapp_request_timeout: Duration,
    pub whatsapp_max_retries: u32,
    pub whatsapp_retry_backoff: Duration,
    pub whatsapp_retry_backoff_max: Duration,

    // Dedupe
    pub dedupe_backend: StoreBackend,
    pub outbound_dedupe_backend: StoreBackend,
    pub dedupe_ttl_seconds: i64,

    // Queue
    pub queue_backend: QueueBackend,
    pub internal_task_token: Option<String>,
    pub internal_base_url: String,

    // Session
    pub session_store_backend: StoreBackend,
    pub session_timeout_minutes: i64,
    pub session_max_intents: usize,
    pub session_history_max_entries: usize,

    // Flood
    pub flood_threshold: u32,
    pub flood_window_seconds: i64,

    // Audit / export
    pub audit_store_backend: StoreBackend,
    pub export_dir: String,

    // LLM
    pub llm: LlmSettings,

    // Circuit breaker
    pub circuit_breaker: CircuitBreakerSettings,

    // Persistence
    pub sqlite_path: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
    }
}

fn stage(prefix: &str, default_model: &str, default_timeout_secs: u64) -> Result<LlmStageSettings, ConfigError> {
    let model = env_or(&format!("{prefix}_MODEL"), default_model);
    let timeout_secs = match env_var(&format!("{prefix}_TIMEOUT_SECONDS")) {
        None => default_timeout_secs,
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Validation(format!(
            "{prefix}_TIMEOUT_SECONDS must be an integer, got {raw}"
        )))?,
    };
    Ok(LlmStageSettings {
        model,
        timeout: Duration::from_secs(timeout_secs),
    })
}

impl Settings {
    /// Load settings from the process environment and validate them.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::parse(&env_or("ENVIRONMENT", "development"))?;

        let llm = LlmSettings {
            enabled: env_parse("LLM_ENABLED", true)?,
            api_key: env_var("LLM_API_KEY"),
            base_url: env_or("LLM_BASE_URL", "https://api.openai.com/v1"),
            confidence_threshold: env_parse("LLM_CONFIDENCE_THRESHOLD", 0.7)?,
            detector: stage("LLM_DETECTOR", "gpt-4o-mini", 10)?,
            responder: stage("LLM_RESPONDER", "gpt-4o-mini", 10)?,
            selector: stage("LLM_SELECTOR", "gpt-4o-mini", 10)?,
            decider: stage("LLM_DECIDER", "gpt-4o-mini", 10)?,
            min_responses: env_parse("RESPONSE_GENERATOR_MIN_RESPONSES", 3)?,
        };

        let circuit_breaker = CircuitBreakerSettings {
            enabled: env_parse("CB_ENABLED", false)?,
            fail_max: env_parse("CB_FAIL_MAX", 5)?,
            reset_timeout: Duration::from_secs(env_parse("CB_RESET_TIMEOUT_SECONDS", 60)?),
            half_open_max: env_parse("CB_HALF_OPEN_MAX", 1)?,
        };

        let settings = Settings {
            service_name: "zapgate",
            version: env!("CARGO_PKG_VERSION"),
            environment,
            host: env_or("HOST", "127.0.0.1"),
            port: env_parse("PORT", 8080)?,
            webhook_secret: env_var("WEBHOOK_SECRET"),
            verify_token: env_var("VERIFY_TOKEN"),
            access_token: env_var("ACCESS_TOKEN"),
            phone_number_id: env_var("PHONE_NUMBER_ID"),
            user_key_pepper: env_var("USER_KEY_PEPPER"),
            whatsapp_api_base_url: env_or("WHATSAPP_API_BASE_URL", "https://graph.facebook.com"),
            whatsapp_api_version: env_or("WHATSAPP_API_VERSION", "v19.0"),
            whatsapp_request_timeout: Duration::from_secs(env_parse(
                "WHATSAPP_REQUEST_TIMEOUT_SECONDS",
                30,
            )?),
            whatsapp_max_retries: env_parse("WHATSAPP_MAX_RETRIES", 3)?,
            whatsapp_retry_backoff: Duration::from_millis(env_parse(
                "WHATSAPP_RETRY_BACKOFF_MS",
                2_000,
            )?),
            whatsapp_retry_backoff_max: Duration::from_millis(env_parse(
                "WHATSAPP_RETRY_BACKOFF_MAX_MS",
                30_000,
            )?),
            dedupe_backend: StoreBackend::parse("DEDUPE_BACKEND", &env_or("DEDUPE_BACKEND", "memory"))?,
            outbound_dedupe_backend: StoreBackend::parse(
                "OUTBOUND_DEDUPE_BACKEND",
                &env_or("OUTBOUND_DEDUPE_BACKEND", "memory"),
            )?,
            dedupe_ttl_seconds: env_parse("DEDUPE_TTL_SECONDS", 604_800)?,
            queue_backend: QueueBackend::parse(&env_or("QUEUE_BACKEND", "memory"))?,
            internal_task_token: env_var("INTERNAL_TASK_TOKEN"),
            internal_base_url: env_or("INTERNAL_BASE_URL", "http://127.0.0.1:8080"),
            session_store_backend: StoreBackend::parse(
                "SESSION_STORE_BACKEND",
                &env_or("SESSION_STORE_BACKEND", "memory"),
            )?,
            session_timeout_minutes: env_parse("SESSION_TIMEOUT_MINUTES", 1_440)?,
            session_max_intents: env_parse("SESSION_MAX_INTENTS", 3)?,
            session_history_max_entries: env_parse("SESSION_HISTORY_MAX_ENTRIES", 200)?,
            flood_threshold: env_parse("FLOOD_THRESHOLD", 10)?,
            flood_window_seconds: env_parse("FLOOD_WINDOW_SECONDS", 60)?,
            audit_store_backend: StoreBackend::parse(
                "AUDIT_STORE_BACKEND",
                &env_or("AUDIT_STORE_BACKEND", "memory"),
            )?,
            export_dir: env_or("EXPORT_DIR", "./exports"),
            llm,
            circuit_breaker,
            sqlite_path: env_or("SQLITE_PATH", "./zapgate.db"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Boot-time invariants. Fail-closed: a misconfigured staging/production
    /// instance must not come up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.environment.is_development() {
            if self.webhook_secret.is_none() {
                return Err(ConfigError::Missing("WEBHOOK_SECRET"));
            }
            if self.user_key_pepper.is_none() {
                return Err(ConfigError::Missing("USER_KEY_PEPPER"));
            }
            for (name, backend) in [
                ("DEDUPE_BACKEND", self.dedupe_backend),
                ("OUTBOUND_DEDUPE_BACKEND", self.outbound_dedupe_backend),
                ("SESSION_STORE_BACKEND", self.session_store_backend),
                ("AUDIT_STORE_BACKEND", self.audit_store_backend),
            ] {
                if backend == StoreBackend::Memory {
                    return Err(ConfigError::Validation(format!(
                        "{name}=memory is not allowed outside development"
                    )));
                }
            }
        }

        if self.queue_backend == QueueBackend::PushHttp && self.internal_task_token.is_none() {
            return Err(ConfigError::Missing("INTERNAL_TASK_TOKEN"));
        }

        if !(0.0..=1.0).contains(&self.llm.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "LLM_CONFIDENCE_THRESHOLD must be within [0,1], got {}",
                self.llm.confidence_threshold
            )));
        }

        if self.flood_threshold == 0 {
            return Err(ConfigError::Validation(
                "FLOOD_THRESHOLD must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Test/dev defaults without touching the process environment.
    pub fn for_development() -> Self {
        Settings {
            service_name: "zapgate",
            version: env!("CARGO_PKG_VERSION"),
            environment: Environment::Development,
            host: "127.0.0.1".into(),
            port: 8080,
            webhook_secret: None,
            verify_token: None,
            access_token: None,
            phone_number_id: None,
            user_key_pepper: None,
            whatsapp_api_base_url: "https://graph.facebook.com".into(),
            whatsapp_api_version: "v19.0".into(),
            whatsapp_request_timeout: Duration::from_secs(30),
            whatsapp_max_retries: 3,
            whatsapp_retry_backoff: Duration::from_secs(2),
            whatsapp_retry_backoff_max: Duration::from_secs(30),
            dedupe_backend: StoreBackend::Memory,
            outbound_dedupe_backend: StoreBackend::Memory,
            dedupe_ttl_seconds: 604_800,
            queue_backend: QueueBackend::Memory,
            internal_task_token: None,
            internal_base_url: "http://127.0.0.1:8080".into(),
            session_store_backend: StoreBackend::Memory,
            session_timeout_minutes: 1_440,
            session_max_intents: 3,
            session_history_max_entries: 200,
            flood_threshold: 10,
            flood_window_seconds: 60,
            audit_store_backend: StoreBackend::Memory,
            export_dir: "./exports".into(),
            llm: LlmSettings {
                enabled: false,
                api_key: None,
                base_url: "https://api.openai.com/v1".into(),
                confidence_threshold: 0.7,
                detector: LlmStageSettings {
                    model: "gpt-4o-mini".into(),
                    timeout: Duration::from_secs(10),
                },
                responder: LlmStageSettings {
                    model: "gpt-4o-mini".into(),
                    timeout: Duration::from_secs(10),
                },
                selector: LlmStageSettings {
                    model: "gpt-4o-mini".into(),
                    timeout: Duration::from_secs(10),
                },
                decider: LlmStageSettings {
                    model: "gpt-4o-mini".into(),
                    timeout: Duration::from_secs(10),
                },
                min_responses: 3,
            },
            circuit_breaker: CircuitBreakerSettings {
                enabled: false,
                fail_max: 5,
                reset_timeout: Duration::from_secs(60),
                half_open_max: 1,
            },
            sqlite_path: "./zapgate.db".into(),
        }
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes)
    }

    /// Namespaced dedupe key: prevents cross-environment collisions when the
    /// substrate is shared.
    pub fn dedupe_key(&self, key: &str) -> String {
        let env = match self.environment {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        let phone = self.phone_number_id.as_deref().unwrap_or("unknown_phone");
        format!("{}:{env}:{phone}:dedupe:{key}", self.service_name)
    }
}
