//! Conversation audit export.
//!
//! Renders a user's audit trail into a text document, persists it through a
//! blob port and records an `EXPORT_GENERATED` event on the same chain, so
//! every export is itself auditable.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::audit::{AuditActor, AuditEvent, AuditRecorder, AuditStore};
use crate::error::GatewayError;

/// Blob-store port for export artifacts.
#[async_trait]
pub trait HistoryExporter: Send + Sync {
    /// Persist and return an internal (non-public) path or URI.
    async fn save(&self, user_key: &str, content: &[u8]) -> Result<String, GatewayError>;
}

/// Filesystem-backed exporter.
pub struct FsHistoryExporter {
    base_dir: PathBuf,
}

impl FsHistoryExporter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FsHistoryExporter {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl HistoryExporter for FsHistoryExporter {
    async fn save(&self, user_key: &str, content: &[u8]) -> Result<String, GatewayError> {
        let dir = self.base_dir.join(user_key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| GatewayError::Other(e.into()))?;
        let path = dir.join(format!("export-{}.txt", Utc::now().timestamp()));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| GatewayError::Other(e.into()))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

pub struct ExportResult {
    pub export_text: String,
    pub export_path: String,
    pub event_hash: String,
}

pub struct ExportUseCase {
    audit_store: Arc<dyn AuditStore>,
    audit_recorder: Arc<AuditRecorder>,
    exporter: Arc<dyn HistoryExporter>,
}

impl ExportUseCase {
    pub fn new(
        audit_store: Arc<dyn AuditStore>,
        audit_recorder: Arc<AuditRecorder>,
        exporter: Arc<dyn HistoryExporter>,
    ) -> Self {
        ExportUseCase {
            audit_store,
            audit_recorder,
            exporter,
        }
    }

    fn render_audit_lines(events: &[AuditEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| {
                format!(
                    "[{}] {} {} {} {} {} prev={}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S %z"),
                    event.action,
                    event.actor,
                    event.reason,
                    event.event_id,
                    event.hash,
                    event.prev_hash.as_deref().unwrap_or("-"),
                )
            })
            .collect()
    }

    fn render(user_key: &str, events: &[AuditEvent]) -> String {
        let mut parts = vec![
            "HISTÓRICO DE AUDITORIA — ZapGate".to_string(),
            format!("UserKey: {user_key}"),
            format!("Gerado em: {}", Utc::now().to_rfc3339()),
            String::new(),
            "AUDITORIA (APPEND-ONLY)".to_string(),
        ];
        if events.is_empty() {
            parts.push("N/A".to_string());
        } else {
            parts.extend(Self::render_audit_lines(events));
        }
        parts.join("\n")
    }

    /// Export the audit trail for `user_key`, recording the export itself.
    pub async fn execute(
        &self,
        user_key: &str,
        requester: AuditActor,
        reason: &str,
    ) -> Result<ExportResult, GatewayError> {
        let events = self
            .audit_store
            .list_events(user_key, 1_000)
            .await
            .map_err(GatewayError::Audit)?;

        let export_text = Self::render(user_key, &events);
        let export_path = self.exporter.save(user_key, export_text.as_bytes()).await?;

        let export_event = self
            .audit_recorder
            .record(user_key, requester, "EXPORT_GENERATED", reason, None)
            .await
            .map_err(GatewayError::Audit)?;

        info!(
            user_key = %&user_key[..user_key.len().min(8)],
            export_path = %export_path,
            "export_generated"
        );
        Ok(ExportResult {
            export_text,
            export_path,
            event_hash: export_event.hash,
        })
    }
}
