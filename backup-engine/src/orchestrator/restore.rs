//! Restore job with a safety snapshot of the live world.
//!
//! Nothing live is touched until the target has been found, verified and
//! sized. From the snapshot step on, any failure still tries to bring the
//! server back up before the error is returned.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Components;
use crate::audit::{AuditAction, AuditEvent};
use crate::catalog::is_snapshot_name;
use crate::fs::walker::directory_size;
use crate::job::{JobGuard, JobKind, JobRecord};
use crate::notify::Notification;
use crate::server::StopReport;
use crate::sync::{SyncRequest, SyncStats};
use crate::utils::errors::{EngineError, Result};
use crate::utils::format::format_bytes;

/// Allowed relative difference between the restored live size and the backup.
const SIZE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub backup: String,
    pub snapshot: String,
    pub duration_secs: f64,
    pub stop: StopReport,
    pub stats: SyncStats,
    pub restored_size: u64,
    pub startup_secs: f64,
}

/// How far a restore got before it stopped.
#[derive(Debug, Default)]
struct Progress {
    snapshot: Option<String>,
    live_touched: bool,
}

pub struct RestoreOrchestrator {
    ctx: Arc<Components>,
}

impl RestoreOrchestrator {
    pub fn new(ctx: Arc<Components>) -> Self {
        Self { ctx }
    }

    pub async fn run_restore(&self, name: &str, triggered_by: &str) -> Result<RestoreResult> {
        let guard = self.ctx.jobs.try_acquire(JobKind::Restore, name, triggered_by)?;
        self.execute(guard, name, triggered_by).await
    }

    /// Restore a pre-restore snapshot, undoing the restore that created it.
    pub async fn rollback(&self, snapshot: &str, triggered_by: &str) -> Result<RestoreResult> {
        require_snapshot(snapshot)?;
        self.run_restore(snapshot, triggered_by).await
    }

    pub fn spawn_restore(self: &Arc<Self>, name: &str, triggered_by: &str) -> Result<JobRecord> {
        let guard = self.ctx.jobs.try_acquire(JobKind::Restore, name, triggered_by)?;
        let record = guard.record().clone();
        let this = Arc::clone(self);
        let name = name.to_string();
        let triggered_by = triggered_by.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.execute(guard, &name, &triggered_by).await {
                error!(backup = %name, error = %e, triggered_by = %triggered_by, "Background restore failed");
            }
        });
        Ok(record)
    }

    pub fn spawn_rollback(self: &Arc<Self>, snapshot: &str, triggered_by: &str) -> Result<JobRecord> {
        require_snapshot(snapshot)?;
        self.spawn_restore(snapshot, triggered_by)
    }

    async fn execute(&self, guard: JobGuard, name: &str, triggered_by: &str) -> Result<RestoreResult> {
        let started = Instant::now();
        let cancel = guard.token().clone();

        info!(backup = %name, triggered_by = %triggered_by, "Restore started");
        self.ctx.audit.record(AuditEvent::pending(
            AuditAction::RestoreInitiated,
            triggered_by,
            json!({ "backup": name, "job_id": guard.record().id }),
        ));

        let mut progress = Progress::default();
        match self.steps(name, triggered_by, &cancel, &mut progress, started).await {
            Ok(result) => {
                info!(
                    backup = %name,
                    snapshot = %result.snapshot,
                    duration_secs = result.duration_secs,
                    "Restore completed"
                );
                self.ctx.audit.record(AuditEvent::success(
                    AuditAction::RestoreCompleted,
                    triggered_by,
                    json!(result),
                ));
                self.ctx.notifier.notify(Notification::RestoreCompleted {
                    backup: name.to_string(),
                    snapshot: result.snapshot.clone(),
                    triggered_by: triggered_by.to_string(),
                    duration_secs: result.duration_secs as u64,
                });
                Ok(result)
            }
            Err(e) => {
                error!(backup = %name, error = %e, "Restore failed");
                let server_restarted = if progress.live_touched {
                    Some(self.recover_server(triggered_by).await)
                } else {
                    None
                };
                self.ctx.audit.record(AuditEvent::failure(
                    AuditAction::RestoreFailed,
                    triggered_by,
                    json!({
                        "backup": name,
                        "snapshot": progress.snapshot,
                        "error": e.to_string(),
                        "error_kind": e.kind(),
                        "duration_secs": started.elapsed().as_secs_f64(),
                        "server_restarted": server_restarted,
                    }),
                ));
                self.ctx.notifier.notify(Notification::RestoreFailed {
                    backup: name.to_string(),
                    snapshot: progress.snapshot,
                    triggered_by: triggered_by.to_string(),
                    error_kind: e.kind().to_string(),
                    error: e.to_string(),
                    server_restarted,
                });
                Err(e)
            }
        }
    }

    async fn steps(
        &self,
        name: &str,
        triggered_by: &str,
        cancel: &CancellationToken,
        progress: &mut Progress,
        started: Instant,
    ) -> Result<RestoreResult> {
        let ctx = &self.ctx;

        // Pre-checks
        let catalog = ctx.catalog.clone();
        let lookup = name.to_string();
        let target = tokio::task::spawn_blocking(move || catalog.require(&lookup)).await??;
        let _pin = ctx.retention.pin(name);

        for tree in ctx.trees().into_iter().filter_map(|(t, _)| t) {
            if !target.path.join(&tree).is_dir() {
                return Err(EngineError::Precondition(format!(
                    "backup {name} does not contain tree {tree}"
                )));
            }
        }

        let report = ctx.checksums.verify(&target.path, name).await?;
        if !report.valid {
            return Err(EngineError::Verification(format!(
                "backup {name} has {} mismatched file(s) out of {}",
                report.mismatch_count(),
                report.checked
            )));
        }

        let root = target.path.clone();
        let size = tokio::task::spawn_blocking(move || directory_size(&root)).await??;
        let required = size.saturating_mul(2);
        let capacity = ctx.storage.has_capacity(required).await?;
        if !capacity.sufficient {
            return Err(EngineError::InsufficientSpace(format!(
                "available {}, required {} (snapshot plus restored copy of {})",
                format_bytes(capacity.available),
                format_bytes(required),
                format_bytes(size)
            )));
        }

        // Safety snapshot, taken while the server keeps running
        progress.live_touched = true;
        let snapshot = ctx.catalog.new_snapshot_name(Utc::now());
        let (snapshot_stats, _) = ctx.capture(&snapshot, None, cancel).await?;
        info!(snapshot = %snapshot, files = snapshot_stats.files_total, "Pre-restore snapshot created");
        ctx.audit.record(AuditEvent::success(
            AuditAction::SnapshotCreated,
            triggered_by,
            json!({ "snapshot": snapshot, "restoring": name, "stats": snapshot_stats }),
        ));
        progress.snapshot = Some(snapshot.clone());

        let stop = ctx.server.stop(triggered_by, cancel).await?;

        let mut stats = SyncStats::default();
        for (tree, live) in ctx.trees() {
            let source = match &tree {
                Some(t) => target.path.join(t),
                None => target.path.clone(),
            };
            stats += ctx.sync.sync(&SyncRequest::new(source, &live), cancel).await?;
        }

        let live_roots: Vec<PathBuf> = ctx.trees().into_iter().map(|(_, p)| p).collect();
        let restored_size = tokio::task::spawn_blocking(move || {
            live_roots
                .iter()
                .try_fold(0u64, |acc, root| directory_size(root).map(|s| acc + s))
        })
        .await??;
        if !within_tolerance(restored_size, size) {
            return Err(EngineError::Verification(format!(
                "live directory holds {} after restore, backup holds {}",
                format_bytes(restored_size),
                format_bytes(size)
            )));
        }

        let startup = ctx
            .server
            .start_monitored(triggered_by, ctx.server.timings().startup_monitor, cancel)
            .await?;

        Ok(RestoreResult {
            backup: name.to_string(),
            snapshot,
            duration_secs: started.elapsed().as_secs_f64(),
            stop,
            stats,
            restored_size,
            startup_secs: startup.as_secs_f64(),
        })
    }

    /// Best-effort start after a failed restore. Runs on a fresh token so a
    /// cancelled job still brings the server back.
    async fn recover_server(&self, triggered_by: &str) -> bool {
        warn!("Attempting to start server after failed restore");
        match self.ctx.server.start(triggered_by, &CancellationToken::new()).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Server could not be started after failed restore");
                false
            }
        }
    }
}

fn require_snapshot(name: &str) -> Result<()> {
    if is_snapshot_name(name) {
        Ok(())
    } else {
        Err(EngineError::Precondition(format!(
            "{name} is not a pre-restore snapshot"
        )))
    }
}

fn within_tolerance(actual: u64, expected: u64) -> bool {
    if expected == 0 {
        return actual == 0;
    }
    (actual as f64 - expected as f64).abs() <= expected as f64 * SIZE_TOLERANCE
}
