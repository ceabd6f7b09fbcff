//! Backup and restore jobs.
//!
//! Both orchestrators share one [`Components`] set and one [`JobSlot`], so a
//! backup and a restore can never run at the same time.

pub mod backup;
pub mod restore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::catalog::{BackupCatalog, BackupInfo};
use crate::checksum::ChecksumManager;
use crate::job::JobSlot;
use crate::notify::Notifier;
use crate::server::ServerStateController;
use crate::storage::{RetentionManager, StorageMonitor};
use crate::sync::{FileSyncPort, SyncRequest, SyncStats};
use crate::utils::errors::{EngineError, Result};

pub use backup::{BackupOrchestrator, BackupResult};
pub use restore::{RestoreOrchestrator, RestoreResult};

/// Everything a job touches.
pub struct Components {
    pub catalog: BackupCatalog,
    pub checksums: ChecksumManager,
    pub storage: Arc<StorageMonitor>,
    pub retention: Arc<RetentionManager>,
    pub server: Arc<ServerStateController>,
    pub sync: Arc<dyn FileSyncPort>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub jobs: JobSlot,
    pub live_dir: PathBuf,
    /// Empty means the live directory is copied as a single tree
    pub sub_trees: Vec<String>,
}

impl Components {
    /// `(relative tree, absolute source)` pairs of the live directory.
    pub(crate) fn trees(&self) -> Vec<(Option<String>, PathBuf)> {
        if self.sub_trees.is_empty() {
            vec![(None, self.live_dir.clone())]
        } else {
            self.sub_trees
                .iter()
                .map(|t| (Some(t.clone()), self.live_dir.join(t)))
                .collect()
        }
    }

    /// Combined size of every configured tree of the live directory.
    pub(crate) async fn estimate_live_size(&self) -> Result<u64> {
        let mut total = 0;
        for (tree, source) in self.trees() {
            if !source.is_dir() {
                return Err(EngineError::Precondition(format!(
                    "source tree {} does not exist",
                    tree.unwrap_or_else(|| source.display().to_string())
                )));
            }
            total += self.sync.estimate_size(&source).await?;
        }
        Ok(total)
    }

    /// Copy the live trees into a staging directory, checksum it and move it
    /// into place as `name`. Nothing named `name` exists unless this succeeds.
    pub(crate) async fn capture(
        &self,
        name: &str,
        base: Option<&BackupInfo>,
        cancel: &CancellationToken,
    ) -> Result<(SyncStats, usize)> {
        let staging = self.catalog.staging_path(name);
        match self.capture_into(&staging, name, base, cancel).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.discard_staging(&staging, name).await;
                Err(e)
            }
        }
    }

    async fn capture_into(
        &self,
        staging: &Path,
        name: &str,
        base: Option<&BackupInfo>,
        cancel: &CancellationToken,
    ) -> Result<(SyncStats, usize)> {
        tokio::fs::create_dir_all(staging).await?;

        let mut stats = SyncStats::default();
        for (tree, source) in self.trees() {
            // only reachable for snapshots: backups check every tree up front
            if !source.is_dir() {
                warn!(path = %source.display(), "Tree missing from live directory, not captured");
                continue;
            }
            let destination = match &tree {
                Some(t) => staging.join(t),
                None => staging.to_path_buf(),
            };
            let reference = base.map(|b| match &tree {
                Some(t) => b.path.join(t),
                None => b.path.clone(),
            });
            let request = SyncRequest::new(&source, destination).with_reference(reference);
            let tree_stats = self.sync.sync(&request, cancel).await?;
            info!(
                tree = tree.as_deref().unwrap_or("."),
                files = tree_stats.files_total,
                transferred = tree_stats.files_transferred,
                "Tree copied"
            );
            stats += tree_stats;
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let summary = self.checksums.generate(staging, name).await?;
        tokio::fs::rename(staging, self.catalog.backup_path(name)).await?;
        Ok((stats, summary.files))
    }

    async fn discard_staging(&self, staging: &Path, name: &str) {
        if let Err(e) = tokio::fs::remove_dir_all(staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
        if let Err(e) = self.checksums.delete(name).await {
            warn!(backup = %name, error = %e, "Failed to remove checksum set");
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::server::{ControllerTimings, ServerState};
    use crate::storage::CapacityModel;
    use crate::testing::{FakeLifecycle, FixedProbe, RecordingAudit, RecordingNotifier};
    use std::time::Duration;
    use tempfile::TempDir;

    pub struct Fixture {
        pub dir: TempDir,
        pub components: Arc<Components>,
        pub api: Arc<FakeLifecycle>,
        pub audit: Arc<RecordingAudit>,
        pub notifier: Arc<RecordingNotifier>,
        pub probe: Arc<FixedProbe>,
    }

    impl Fixture {
        pub fn live(&self) -> PathBuf {
            self.dir.path().join("live")
        }

        pub fn backups(&self) -> PathBuf {
            self.dir.path().join("backups")
        }
    }

    pub fn timings() -> ControllerTimings {
        ControllerTimings {
            flush_settle: Duration::from_millis(10),
            graceful_stop: Duration::from_secs(60),
            forced_stop: Duration::from_secs(30),
            start: Duration::from_secs(60),
            startup_monitor: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn fixture(api: FakeLifecycle, sync: Arc<dyn FileSyncPort>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        for tree in ["world", "world_nether"] {
            std::fs::create_dir_all(live.join(tree).join("region")).unwrap();
            std::fs::write(live.join(tree).join("level.dat"), format!("{tree}-level")).unwrap();
            std::fs::write(live.join(tree).join("region/r.0.0.mca"), vec![7u8; 100]).unwrap();
        }

        let backups = dir.path().join("backups");
        let catalog = BackupCatalog::new(&backups);
        catalog.ensure_layout().unwrap();
        let checksums = ChecksumManager::new(catalog.checksum_dir());

        let api = Arc::new(api);
        let audit = Arc::new(RecordingAudit::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let probe = Arc::new(FixedProbe::new(1_000_000_000, 500_000_000));

        let storage = StorageMonitor::new(
            &backups,
            CapacityModel::Filesystem,
            80.0,
            95.0,
            audit.clone(),
            notifier.clone(),
        )
        .with_probe(probe.clone());
        let retention = RetentionManager::new(catalog.clone(), checksums.clone(), 10, audit.clone());
        let server = ServerStateController::new(api.clone(), audit.clone(), timings(), "save-all");

        let components = Arc::new(Components {
            catalog,
            checksums,
            storage: Arc::new(storage),
            retention: Arc::new(retention),
            server: Arc::new(server),
            sync,
            audit: audit.clone(),
            notifier: notifier.clone(),
            jobs: JobSlot::new(),
            live_dir: live,
            sub_trees: vec!["world".to_string(), "world_nether".to_string()],
        });

        Fixture {
            dir,
            components,
            api,
            audit,
            notifier,
            probe,
        }
    }

    pub fn running() -> FakeLifecycle {
        FakeLifecycle::new(ServerState::Running)
    }
}
