//! Task queue boundary between webhook admission and processing.
//!
//! The in-memory backend is a channel drained by an in-process worker loop
//! (development). The push backend delivers tasks over HTTP to the internal
//! handlers with the internal token, matching how a hosted queue pushes to
//! a worker endpoint. Neither backend promises per-key FIFO; session write
//! ordering is the Session Manager's job.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::QueueError;
use crate::whatsapp::OutboundMessageRequest;

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedTask {
    Inbound {
        payload: Value,
        inbound_event_id: String,
        correlation_id: Option<String>,
    },
    Outbound {
        request: OutboundMessageRequest,
    },
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task and return its id for tracing.
    async fn enqueue(&self, task: QueuedTask) -> Result<String, QueueError>;
}

/// Development queue: an unbounded channel plus a worker loop owned by the
/// gateway. Tasks die with the process.
pub struct InMemoryQueue {
    sender: mpsc::UnboundedSender<(String, QueuedTask)>,
    counter: AtomicU64,
}

impl InMemoryQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(String, QueuedTask)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            InMemoryQueue {
                sender,
                counter: AtomicU64::new(0),
            },
            receiver,
        )
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<String, QueueError> {
        let task_id = format!("mem-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.sender
            .send((task_id.clone(), task))
            .map_err(|_| QueueError::Closed)?;
        debug!(task_id = %task_id, "task_enqueued_memory");
        Ok(task_id)
    }
}

/// Push queue: delivers each task to the matching internal handler.
pub struct PushHttpQueue {
    client: reqwest::Client,
    base_url: String,
    internal_token: String,
    token_header: &'static str,
}

impl PushHttpQueue {
    pub const TOKEN_HEADER: &'static str = "X-Internal-Token";

    pub fn new(base_url: &str, internal_token: &str) -> Self {
        PushHttpQueue {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            internal_token: internal_token.to_string(),
            token_header: Self::TOKEN_HEADER,
        }
    }

    fn url_for(&self, task: &QueuedTask) -> String {
        match task {
            QueuedTask::Inbound { .. } => format!("{}/internal/process_inbound", self.base_url),
            QueuedTask::Outbound { .. } => format!("{}/internal/process_outbound", self.base_url),
        }
    }

    fn body_for(task: &QueuedTask) -> Value {
        match task {
            QueuedTask::Inbound {
                payload,
                inbound_event_id,
                correlation_id,
            } => serde_json::json!({
                "payload": payload,
                "inbound_event_id": inbound_event_id,
                "correlation_id": correlation_id,
            }),
            QueuedTask::Outbound { request } => {
                serde_json::to_value(request).unwrap_or(Value::Null)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for PushHttpQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<String, QueueError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .client
            .post(self.url_for(&task))
            .header(self.token_header, &self.internal_token)
            .json(&Self::body_for(&task))
            .send()
            .await
            .map_err(|e| QueueError::EnqueueFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(QueueError::EnqueueFailed(format!(
                "push handler returned {}",
                response.status()
            )));
        }

        debug!(task_id = %task_id, "task_pushed_http");
        Ok(task_id)
    }
}
