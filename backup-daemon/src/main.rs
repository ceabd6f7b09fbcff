mod commands;
mod config;
mod error;
mod lock;
mod notify;
mod pterodactyl;
mod routes;
mod services;
mod state;

use crate::commands::Command;
use crate::lock::InstanceLock;
use crate::notify::WebhookNotifier;
use crate::pterodactyl::PterodactylClient;
use crate::services::scheduler::BackupScheduler;
use crate::services::storage_watch::start_storage_watch;
use crate::state::AppState;
use anyhow::Context;
use backup_engine::audit::JsonlAuditLog;
use backup_engine::notify::{LogNotifier, Notifier};
use backup_engine::utils::logger;
use backup_engine::Engine;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long `run` waits for an interrupted job to unwind before exiting.
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "world-backup", version, about = "Hard-linked backups and restores of a game server world")]
struct Cli {
    /// Configuration file (default: $WORLD_BACKUP_CONFIG, then /etc/world-backup/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configured level
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::CheckConfig = cli.command {
        return commands::check_config(cli.config);
    }

    let (path, config) = config::load(cli.config)?;
    logger::init(&config.log, cli.log_level.as_deref())?;
    tracing::debug!(config = %path.display(), "Configuration loaded");

    // Held for the whole process; mutating commands must not race a running daemon
    let _lock = if cli.command.mutates() {
        Some(InstanceLock::acquire(&config.backup.backup_dir)?)
    } else {
        None
    };

    let audit = Arc::new(JsonlAuditLog::new(&config.audit.log_dir));
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.as_str())?),
        None => Arc::new(LogNotifier),
    };
    let api = Arc::new(PterodactylClient::new(&config.server)?);
    let engine = Arc::new(Engine::new(config, api, audit.clone(), notifier)?);

    if cli.command.mutates() {
        engine.clean_stale_staging()?;
    }

    match cli.command {
        Command::Run => run_daemon(engine, audit).await,
        command => commands::execute(command, &engine, &audit).await,
    }
}

async fn run_daemon(engine: Arc<Engine>, audit: Arc<JsonlAuditLog>) -> anyhow::Result<()> {
    let sync_version = engine
        .check_sync()
        .await
        .context("Configured sync method is not available")?;
    tracing::info!(sync = %sync_version, "Starting world backup daemon");

    let cancel = CancellationToken::new();
    let watch = start_storage_watch(engine.clone(), audit.clone(), cancel.clone());

    // Initialize cron scheduler
    let scheduler = match BackupScheduler::new(engine.clone()).await {
        Ok(s) => {
            match s.init_schedules(&engine.config().backup.schedules).await {
                Ok(count) => tracing::info!(count, "Backup schedules registered"),
                Err(e) => tracing::warn!("Failed to initialize schedules: {}", e),
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let api = engine.config().api.clone();
    if api.enabled {
        let state = Arc::new(AppState::new(engine.clone(), audit));
        let app = routes::create_router(state);

        let listener = tokio::net::TcpListener::bind(&api.bind)
            .await
            .with_context(|| format!("Failed to bind {}", api.bind))?;
        tracing::info!("Listening on {}", api.bind);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await?;
    } else {
        tracing::info!("HTTP API disabled");
        shutdown_signal(cancel.clone()).await;
    }

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    if let Err(e) = watch.await {
        tracing::warn!("Storage watch ended abnormally: {}", e);
    }

    drain_job(&engine).await;
    tracing::info!("Daemon stopped");

    Ok(())
}

/// Cancel the running job, if any, and give it time to restart the server.
async fn drain_job(engine: &Engine) {
    if engine.current_job().is_none() {
        return;
    }
    if let Err(e) = engine.cancel("shutdown") {
        tracing::debug!("Nothing to cancel: {}", e);
        return;
    }
    let drained = tokio::time::timeout(JOB_DRAIN_TIMEOUT, async {
        while engine.current_job().is_some() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::error!(
            timeout_secs = JOB_DRAIN_TIMEOUT.as_secs(),
            "Job did not finish before shutdown, check the server state"
        );
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
