//! Axum HTTP gateway: webhook admission plus the internal task handlers.
//!
//! Admission never blocks on external calls beyond the signature check,
//! JSON parse, dedupe mark and enqueue — everything slower runs behind the
//! task boundary. Body limits and request timeouts guard the listener.

mod handlers;
mod processing_log;
mod signature;

pub use processing_log::{
    InMemoryProcessingLog, ProcessingLogEntry, ProcessingLogStore, SqliteProcessingLog,
};
pub use signature::verify_meta_signature;

#[cfg(test)]
pub(crate) use signature::compute_signature_header;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use crate::abuse::{AbuseGuard, FloodDetector, InMemoryFloodDetector, SqliteFloodDetector};
use crate::audit::{
    AuditRecorder, AuditStore, InMemoryAuditStore, SqliteAuditStore,
};
use crate::config::{QueueBackend, Settings, StoreBackend};
use crate::dedupe::{
    InMemoryInboundDedupe, InMemoryOutboundDedupe, InboundDedupe, OutboundDedupe,
    SqliteInboundDedupe, SqliteOutboundDedupe,
};
use crate::llm::{LlmClient, OpenAiChatClient};
use crate::pipeline::Pipeline;
use crate::queue::{InMemoryQueue, PushHttpQueue, QueuedTask, TaskQueue};
use crate::session::{InMemorySessionStore, SessionManager, SessionStore, SqliteSessionStore};
use crate::whatsapp::{CircuitBreaker, HttpSender, OutboundClient};

use handlers::{
    handle_health, handle_process_inbound, handle_process_outbound, handle_webhook,
    handle_whatsapp_verify,
};

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s) — prevents slow-loris attacks
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Dev worker retries for retryable outbound failures.
const MEMORY_QUEUE_SEND_ATTEMPTS: u32 = 3;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub admission_dedupe: Arc<dyn InboundDedupe>,
    pub queue: Arc<dyn TaskQueue>,
    pub pipeline: Arc<Pipeline>,
    pub outbound: Arc<OutboundClient>,
    pub processing_log: Arc<dyn ProcessingLogStore>,
}

/// `WhatsApp` verification query params
#[derive(serde::Deserialize)]
pub struct WhatsAppVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/webhooks/whatsapp", get(handle_whatsapp_verify))
        .route("/webhooks/whatsapp", post(handle_webhook))
        .route("/internal/process_inbound", post(handle_process_inbound))
        .route("/internal/process_outbound", post(handle_process_outbound))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

async fn sqlite_pool(settings: &Settings) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&format!("sqlite://{}?mode=rwc", settings.sqlite_path))
        .await
        .with_context(|| format!("open sqlite database at {}", settings.sqlite_path))
}

struct Stores {
    admission_dedupe: Arc<dyn InboundDedupe>,
    worker_dedupe: Arc<dyn InboundDedupe>,
    outbound_dedupe: Arc<dyn OutboundDedupe>,
    session_store: Arc<dyn SessionStore>,
    flood: Arc<dyn FloodDetector>,
    audit: Arc<dyn AuditStore>,
    processing_log: Arc<dyn ProcessingLogStore>,
}

async fn build_stores(settings: &Settings) -> Result<Stores> {
    let needs_pool = [
        settings.dedupe_backend,
        settings.outbound_dedupe_backend,
        settings.session_store_backend,
        settings.audit_store_backend,
    ]
    .contains(&StoreBackend::Sqlite);

    let pool = if needs_pool {
        Some(sqlite_pool(settings).await?)
    } else {
        None
    };
    let pool = |_name: &str| -> Result<SqlitePool> {
        pool.clone().context("sqlite pool not initialized")
    };

    let (admission_dedupe, worker_dedupe): (Arc<dyn InboundDedupe>, Arc<dyn InboundDedupe>) =
        match settings.dedupe_backend {
            StoreBackend::Memory => (
                Arc::new(InMemoryInboundDedupe::new()),
                Arc::new(InMemoryInboundDedupe::new()),
            ),
            StoreBackend::Sqlite => {
                let store: Arc<dyn InboundDedupe> =
                    Arc::new(SqliteInboundDedupe::new(pool("dedupe")?).await?);
                (store.clone(), store)
            }
        };

    let outbound_dedupe: Arc<dyn OutboundDedupe> = match settings.outbound_dedupe_backend {
        StoreBackend::Memory => Arc::new(InMemoryOutboundDedupe::new()),
        StoreBackend::Sqlite => Arc::new(SqliteOutboundDedupe::new(pool("outbound")?).await?),
    };

    let session_store: Arc<dyn SessionStore> = match settings.session_store_backend {
        StoreBackend::Memory => Arc::new(InMemorySessionStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteSessionStore::new(pool("sessions")?).await?),
    };

    let flood: Arc<dyn FloodDetector> = match settings.dedupe_backend {
        StoreBackend::Memory => Arc::new(InMemoryFloodDetector::new(
            settings.flood_threshold,
            settings.flood_window_seconds,
        )),
        StoreBackend::Sqlite => Arc::new(
            SqliteFloodDetector::new(
                pool("flood")?,
                settings.flood_threshold,
                settings.flood_window_seconds,
            )
            .await?,
        ),
    };

    let audit: Arc<dyn AuditStore> = match settings.audit_store_backend {
        StoreBackend::Memory => Arc::new(InMemoryAuditStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteAuditStore::new(pool("audit")?).await?),
    };

    let processing_log: Arc<dyn ProcessingLogStore> = match settings.session_store_backend {
        StoreBackend::Memory => Arc::new(InMemoryProcessingLog::new()),
        StoreBackend::Sqlite => Arc::new(SqliteProcessingLog::new(pool("processing_log")?).await?),
    };

    Ok(Stores {
        admission_dedupe,
        worker_dedupe,
        outbound_dedupe,
        session_store,
        flood,
        audit,
        processing_log,
    })
}

fn build_outbound_client(settings: &Settings, outbound_dedupe: Arc<dyn OutboundDedupe>) -> OutboundClient {
    let breaker = settings
        .circuit_breaker
        .enabled
        .then(|| Arc::new(CircuitBreaker::new(&settings.circuit_breaker)));
    OutboundClient::new(
        HttpSender::new(settings.whatsapp_request_timeout, breaker).with_retry_policy(
            settings.whatsapp_max_retries,
            settings.whatsapp_retry_backoff,
            settings.whatsapp_retry_backoff_max,
        ),
        &settings.whatsapp_api_base_url,
        &settings.whatsapp_api_version,
        settings.phone_number_id.as_deref().unwrap_or_default(),
        settings.access_token.as_deref().unwrap_or_default(),
        outbound_dedupe,
        settings.dedupe_ttl_seconds,
    )
}

/// In-process worker loop for the development queue.
async fn run_memory_worker(
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<(String, QueuedTask)>,
    pipeline: Arc<Pipeline>,
    outbound: Arc<OutboundClient>,
) {
    while let Some((task_id, task)) = receiver.recv().await {
        match task {
            QueuedTask::Inbound {
                payload,
                inbound_event_id,
                correlation_id,
            } => {
                let correlation_id =
                    correlation_id.unwrap_or_else(crate::ids::new_correlation_id);
                if let Err(e) = pipeline
                    .process_inbound(&payload, &inbound_event_id, &correlation_id)
                    .await
                {
                    error!(task_id = %task_id, error = %e, "inbound_task_failed");
                }
            }
            QueuedTask::Outbound { request } => {
                for attempt in 1..=MEMORY_QUEUE_SEND_ATTEMPTS {
                    match outbound.send(&request).await {
                        Ok(_) => break,
                        Err(e) if e.is_retryable() && attempt < MEMORY_QUEUE_SEND_ATTEMPTS => {
                            warn!(task_id = %task_id, attempt, error = %e, "outbound_task_retry");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Err(e) => {
                            error!(task_id = %task_id, error = %e, "outbound_task_failed");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("memory_worker_stopped");
}

/// Bind per settings and serve until shutdown.
pub async fn run_gateway(settings: Settings) -> Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    run_gateway_with_listener(listener, settings).await
}

/// Wire up stores, services and routes on a pre-bound listener, then serve
/// until shutdown.
pub async fn run_gateway_with_listener(
    listener: tokio::net::TcpListener,
    settings: Settings,
) -> Result<()> {
    let settings = Arc::new(settings);
    let stores = build_stores(&settings).await?;

    let sessions = Arc::new(SessionManager::new(
        stores.session_store,
        settings.session_timeout(),
        settings.session_max_intents,
        settings.session_history_max_entries,
    ));
    let abuse = AbuseGuard::new(stores.flood, settings.session_max_intents);
    let audit = Arc::new(AuditRecorder::new(stores.audit));

    let llm: Option<Arc<dyn LlmClient>> = settings.llm.enabled.then(|| {
        Arc::new(OpenAiChatClient::new(
            &settings.llm.base_url,
            settings.llm.api_key.as_deref(),
        )) as Arc<dyn LlmClient>
    });

    let outbound = Arc::new(build_outbound_client(&settings, stores.outbound_dedupe));

    let (queue, worker_receiver): (Arc<dyn TaskQueue>, Option<_>) = match settings.queue_backend {
        QueueBackend::Memory => {
            let (queue, receiver) = InMemoryQueue::channel();
            (Arc::new(queue), Some(receiver))
        }
        QueueBackend::PushHttp => {
            let token = settings
                .internal_task_token
                .as_deref()
                .context("push_http queue requires INTERNAL_TASK_TOKEN")?;
            (
                Arc::new(PushHttpQueue::new(&settings.internal_base_url, token)),
                None,
            )
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        settings.clone(),
        stores.worker_dedupe,
        sessions,
        abuse,
        llm,
        queue.clone(),
        audit,
    ));

    let worker_handle = worker_receiver.map(|receiver| {
        tokio::spawn(run_memory_worker(
            receiver,
            pipeline.clone(),
            outbound.clone(),
        ))
    });

    let state = AppState {
        settings: settings.clone(),
        admission_dedupe: stores.admission_dedupe,
        queue,
        pipeline,
        outbound,
        processing_log: stores.processing_log,
    };

    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "gateway_listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown_signal_received");
        })
        .await
        .context("serve gateway")?;

    // the dev worker holds its own queue handle; tear it down with the server
    if let Some(handle) = worker_handle {
        handle.abort();
    }

    Ok(())
}
