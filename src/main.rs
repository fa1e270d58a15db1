use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zapgate::Settings;
use zapgate::audit::AuditActor;
use zapgate::ids::derive_user_key;

#[derive(Parser)]
#[command(name = "zapgate", version, about = "WhatsApp conversational gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and worker.
    Serve {
        /// Bind host (overrides HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Export a user's audit trail to the export directory.
    Export {
        /// Phone number in E.164; the stored user key is derived from it.
        #[arg(long)]
        phone: String,
        /// Reason recorded on the audit chain.
        #[arg(long, default_value = "ADMIN_REQUEST")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = Settings::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            zapgate::gateway::run_gateway(settings).await
        }
        Command::Export { phone, reason } => {
            let user_key = derive_user_key(settings.user_key_pepper.as_deref(), &phone);
            let result = export_audit_trail(&settings, &user_key, &reason).await?;
            println!("export written to {result}");
            Ok(())
        }
    }
}

async fn export_audit_trail(
    settings: &Settings,
    user_key: &str,
    reason: &str,
) -> Result<String> {
    use std::sync::Arc;
    use zapgate::audit::{AuditRecorder, AuditStore, InMemoryAuditStore, SqliteAuditStore};
    use zapgate::config::StoreBackend;
    use zapgate::export::{ExportUseCase, FsHistoryExporter};

    let store: Arc<dyn AuditStore> = match settings.audit_store_backend {
        StoreBackend::Memory => Arc::new(InMemoryAuditStore::new()),
        StoreBackend::Sqlite => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(2)
                .connect(&format!("sqlite://{}?mode=rwc", settings.sqlite_path))
                .await?;
            Arc::new(SqliteAuditStore::new(pool).await?)
        }
    };

    let use_case = ExportUseCase::new(
        store.clone(),
        Arc::new(AuditRecorder::new(store)),
        Arc::new(FsHistoryExporter::new(settings.export_dir.clone())),
    );
    let result = use_case.execute(user_key, AuditActor::Admin, reason).await?;
    Ok(result.export_path)
}
