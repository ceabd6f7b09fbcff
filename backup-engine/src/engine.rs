//! Engine: every component wired together from one validated [`Config`].
//!
//! Entry points that mutate the backup root (jobs, deletions, cleanup) go
//! through the job slot; read-only queries never touch it.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::catalog::{BackupCatalog, BackupInfo};
use crate::checksum::{ChecksumDiff, ChecksumManager, VerifyReport};
use crate::config::{CapacityModelKind, Config, SyncMethod};
use crate::job::{JobKind, JobRecord, JobSlot};
use crate::notify::Notifier;
use crate::orchestrator::{
    BackupOrchestrator, BackupResult, Components, RestoreOrchestrator, RestoreResult,
};
use crate::server::{ControllerTimings, LifecycleApi, ServerResources, ServerStateController};
use crate::storage::monitor::{AlertCheck, Fs2Probe, SpaceProbe, StorageStats};
use crate::storage::retention::RetentionStats;
use crate::storage::{CapacityModel, CleanupReport, RetentionManager, StorageMonitor};
use crate::sync::{FileSyncPort, NativeSync, RsyncSync};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub server: Option<ServerResources>,
    /// Set when the lifecycle API could not be reached
    pub server_error: Option<String>,
    pub job: Option<JobRecord>,
    pub latest: Option<String>,
    pub sync_method: &'static str,
    pub storage: StorageStats,
    pub retention: RetentionStats,
}

pub struct Engine {
    config: Config,
    ctx: Arc<Components>,
    backups: Arc<BackupOrchestrator>,
    restores: Arc<RestoreOrchestrator>,
}

impl Engine {
    /// Build the engine with the sync port and capacity probe the
    /// configuration selects.
    pub fn new(
        config: Config,
        api: Arc<dyn LifecycleApi>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let sync: Arc<dyn FileSyncPort> = match config.backup.sync_method {
            SyncMethod::Rsync => Arc::new(RsyncSync::new(&config.backup.rsync_path)),
            SyncMethod::Native => Arc::new(NativeSync::new()),
        };
        Self::with_parts(config, api, audit, notifier, sync, Arc::new(Fs2Probe))
    }

    pub fn with_parts(
        config: Config,
        api: Arc<dyn LifecycleApi>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        sync: Arc<dyn FileSyncPort>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self> {
        let catalog = BackupCatalog::new(&config.backup.backup_dir);
        catalog.ensure_layout()?;
        let checksums = ChecksumManager::new(catalog.checksum_dir());

        let model = match config.storage.capacity_model {
            CapacityModelKind::Filesystem => CapacityModel::Filesystem,
            CapacityModelKind::Quota => CapacityModel::Quota {
                max_bytes: config.quota_bytes().ok_or_else(|| {
                    EngineError::Configuration(vec![
                        "storage.max_backup_size_gb is required for the quota model".to_string(),
                    ])
                })?,
            },
        };
        let storage = StorageMonitor::new(
            catalog.root(),
            model,
            config.storage.warning_percent,
            config.storage.critical_percent,
            audit.clone(),
            notifier.clone(),
        )
        .with_probe(probe);

        let retention = RetentionManager::new(
            catalog.clone(),
            checksums.clone(),
            config.backup.retention_days,
            audit.clone(),
        );
        let server = ServerStateController::new(
            api,
            audit.clone(),
            ControllerTimings::from(&config.timeouts),
            config.server.flush_command.clone(),
        );

        info!(
            backup_dir = %catalog.root().display(),
            live_dir = %config.source.live_dir.display(),
            sync = sync.name(),
            capacity_model = model.name(),
            "Engine initialized"
        );

        let ctx = Arc::new(Components {
            catalog,
            checksums,
            storage: Arc::new(storage),
            retention: Arc::new(retention),
            server: Arc::new(server),
            sync,
            audit,
            notifier,
            jobs: JobSlot::new(),
            live_dir: config.source.live_dir.clone(),
            sub_trees: config.sub_trees(),
        });

        Ok(Self {
            config,
            backups: Arc::new(BackupOrchestrator::new(ctx.clone())),
            restores: Arc::new(RestoreOrchestrator::new(ctx.clone())),
            ctx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.ctx.catalog
    }

    pub fn server(&self) -> &ServerStateController {
        &self.ctx.server
    }

    pub fn storage(&self) -> &StorageMonitor {
        &self.ctx.storage
    }

    /// Remove staging directories of a job interrupted by a crash. Only safe
    /// while no other process can be running a job on the same root.
    pub fn clean_stale_staging(&self) -> Result<usize> {
        let stale = self.ctx.catalog.clean_stale_staging()?;
        if stale > 0 {
            warn!(count = stale, "Removed staging directories left by an interrupted job");
        }
        Ok(stale)
    }

    /// Confirm the selected sync port can run on this host.
    pub async fn check_sync(&self) -> Result<String> {
        match self.config.backup.sync_method {
            SyncMethod::Rsync => RsyncSync::new(&self.config.backup.rsync_path).probe().await,
            SyncMethod::Native => Ok("native".to_string()),
        }
    }

    // Jobs

    pub async fn run_backup(&self, triggered_by: &str) -> Result<BackupResult> {
        self.backups.run_backup(triggered_by).await
    }

    pub fn spawn_backup(&self, triggered_by: &str) -> Result<JobRecord> {
        self.backups.spawn_backup(triggered_by)
    }

    pub async fn run_restore(&self, name: &str, triggered_by: &str) -> Result<RestoreResult> {
        self.restores.run_restore(name, triggered_by).await
    }

    pub fn spawn_restore(&self, name: &str, triggered_by: &str) -> Result<JobRecord> {
        self.restores.spawn_restore(name, triggered_by)
    }

    pub async fn rollback(&self, snapshot: &str, triggered_by: &str) -> Result<RestoreResult> {
        self.restores.rollback(snapshot, triggered_by).await
    }

    pub fn spawn_rollback(&self, snapshot: &str, triggered_by: &str) -> Result<JobRecord> {
        self.restores.spawn_rollback(snapshot, triggered_by)
    }

    pub fn current_job(&self) -> Option<JobRecord> {
        self.ctx.jobs.current()
    }

    /// Ask the running job to stop. It unwinds on its own and frees the slot
    /// when done.
    pub fn cancel(&self, triggered_by: &str) -> Result<JobRecord> {
        let record = self.ctx.jobs.cancel()?;
        warn!(job = %record.id, kind = %record.kind, target = %record.target, "Cancellation requested");
        self.ctx.audit.record(AuditEvent::warning(
            AuditAction::JobCancelRequested,
            triggered_by,
            json!({
                "job_id": record.id,
                "kind": record.kind,
                "target": record.target,
                "job_triggered_by": record.triggered_by,
            }),
        ));
        Ok(record)
    }

    // Catalog queries

    pub async fn list_backups(&self, with_sizes: bool) -> Result<Vec<BackupInfo>> {
        let catalog = self.ctx.catalog.clone();
        tokio::task::spawn_blocking(move || {
            let list = catalog.list_backups()?;
            if with_sizes {
                catalog.measure(list)
            } else {
                Ok(list)
            }
        })
        .await?
    }

    pub async fn list_snapshots(&self, with_sizes: bool) -> Result<Vec<BackupInfo>> {
        let catalog = self.ctx.catalog.clone();
        tokio::task::spawn_blocking(move || {
            let list = catalog.list_snapshots()?;
            if with_sizes {
                catalog.measure(list)
            } else {
                Ok(list)
            }
        })
        .await?
    }

    pub async fn verify(&self, name: &str) -> Result<VerifyReport> {
        let catalog = self.ctx.catalog.clone();
        let lookup = name.to_string();
        let info = tokio::task::spawn_blocking(move || catalog.require(&lookup)).await??;
        self.ctx.checksums.verify(&info.path, name).await
    }

    pub async fn diff(&self, from: &str, to: &str) -> Result<ChecksumDiff> {
        self.ctx.checksums.diff(from, to).await
    }

    // Deletion

    pub async fn delete_backup(&self, name: &str, triggered_by: &str) -> Result<u64> {
        let _guard = self.ctx.jobs.try_acquire(JobKind::Maintenance, name, triggered_by)?;
        self.ctx.retention.delete_backup(name, triggered_by).await
    }

    pub async fn delete_snapshot(&self, name: &str, triggered_by: &str) -> Result<u64> {
        let _guard = self.ctx.jobs.try_acquire(JobKind::Maintenance, name, triggered_by)?;
        self.ctx.retention.delete_snapshot(name, triggered_by).await
    }

    pub async fn cleanup(&self, triggered_by: &str) -> Result<CleanupReport> {
        let _guard = self.ctx.jobs.try_acquire(JobKind::Maintenance, "cleanup", triggered_by)?;
        self.ctx.retention.run_cleanup(triggered_by).await
    }

    // Status

    pub async fn check_storage(&self, triggered_by: &str) -> Result<AlertCheck> {
        self.ctx.storage.check_and_alert(triggered_by).await
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        self.ctx.storage.stats().await
    }

    pub async fn retention_stats(&self) -> Result<RetentionStats> {
        self.ctx.retention.retention_stats().await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (server, server_error) = match self.ctx.server.status().await {
            Ok(resources) => (Some(resources), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(EngineStatus {
            server,
            server_error,
            job: self.current_job(),
            latest: self.ctx.catalog.latest(),
            sync_method: self.ctx.sync.name(),
            storage: self.storage_stats().await?,
            retention: self.retention_stats().await?,
        })
    }

    /// Restart the managed server. Holds the job slot for the whole stop
    /// and start, so no backup or restore can begin underneath it.
    pub async fn restart_server(&self, triggered_by: &str) -> Result<()> {
        let guard = self.ctx.jobs.try_acquire(JobKind::Maintenance, "restart", triggered_by)?;
        self.ctx.server.restart(triggered_by, guard.token()).await.map(|_| ())
    }
}
