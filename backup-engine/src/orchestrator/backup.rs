//! Zero-downtime backup job.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::Components;
use crate::audit::{AuditAction, AuditEvent};
use crate::job::{JobGuard, JobKind, JobRecord};
use crate::notify::Notification;
use crate::storage::AlertLevel;
use crate::sync::SyncStats;
use crate::utils::errors::{EngineError, Result};
use crate::utils::format::{format_bytes, round_percent};

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub name: String,
    pub path: PathBuf,
    pub duration_secs: f64,
    pub stats: SyncStats,
    /// Share of the source not transferred thanks to hard links, in percent
    pub space_saved_percent: f64,
    pub reference_base: Option<String>,
    pub checksum_files: usize,
    pub deleted_backups: Vec<String>,
}

/// `1 - transferred / total` in percent with two decimals, 0 for an empty source.
pub fn space_saved_percent(stats: &SyncStats) -> f64 {
    if stats.bytes_total == 0 {
        return 0.0;
    }
    let ratio = 1.0 - stats.bytes_transferred as f64 / stats.bytes_total as f64;
    round_percent(ratio * 100.0)
}

pub struct BackupOrchestrator {
    ctx: Arc<Components>,
}

impl BackupOrchestrator {
    pub fn new(ctx: Arc<Components>) -> Self {
        Self { ctx }
    }

    /// Run a backup to completion on the calling task.
    pub async fn run_backup(&self, triggered_by: &str) -> Result<BackupResult> {
        let guard = self.ctx.jobs.try_acquire(JobKind::Backup, "pending", triggered_by)?;
        self.execute(guard, triggered_by).await
    }

    /// Claim the job slot now and run the backup in the background.
    pub fn spawn_backup(self: &Arc<Self>, triggered_by: &str) -> Result<JobRecord> {
        let guard = self.ctx.jobs.try_acquire(JobKind::Backup, "pending", triggered_by)?;
        let record = guard.record().clone();
        let this = Arc::clone(self);
        let triggered_by = triggered_by.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.execute(guard, &triggered_by).await {
                error!(error = %e, triggered_by = %triggered_by, "Background backup failed");
            }
        });
        Ok(record)
    }

    async fn execute(&self, mut guard: JobGuard, triggered_by: &str) -> Result<BackupResult> {
        let started = Instant::now();
        let name = self.ctx.catalog.new_backup_name(Utc::now());
        guard.set_target(&name);
        let cancel = guard.token().clone();

        info!(backup = %name, triggered_by = %triggered_by, "Backup started");
        self.ctx.audit.record(AuditEvent::pending(
            AuditAction::BackupStarted,
            triggered_by,
            json!({
                "backup": name,
                "source": self.ctx.live_dir,
                "sub_trees": self.ctx.sub_trees,
                "job_id": guard.record().id,
            }),
        ));

        match self.steps(&name, triggered_by, &cancel, started).await {
            Ok(result) => {
                info!(
                    backup = %name,
                    duration_secs = result.duration_secs,
                    files = result.stats.files_total,
                    transferred = %format_bytes(result.stats.bytes_transferred),
                    saved_percent = result.space_saved_percent,
                    "Backup completed"
                );
                self.ctx.audit.record(AuditEvent::success(
                    AuditAction::BackupCompleted,
                    triggered_by,
                    json!(result),
                ));
                self.ctx.notifier.notify(Notification::BackupCompleted {
                    backup: result.name.clone(),
                    triggered_by: triggered_by.to_string(),
                    duration_secs: result.duration_secs as u64,
                    stats: result.stats,
                    space_saved_percent: result.space_saved_percent,
                    deleted_backups: result.deleted_backups.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                let elapsed = started.elapsed();
                error!(backup = %name, error = %e, "Backup failed");
                self.ctx.audit.record(AuditEvent::failure(
                    AuditAction::BackupFailed,
                    triggered_by,
                    json!({
                        "backup": name,
                        "error": e.to_string(),
                        "error_kind": e.kind(),
                        "duration_secs": elapsed.as_secs_f64(),
                    }),
                ));
                self.ctx.notifier.notify(Notification::BackupFailed {
                    triggered_by: triggered_by.to_string(),
                    error_kind: e.kind().to_string(),
                    error: e.to_string(),
                    duration_secs: elapsed.as_secs(),
                });
                Err(e)
            }
        }
    }

    async fn steps(
        &self,
        name: &str,
        triggered_by: &str,
        cancel: &tokio_util::sync::CancellationToken,
        started: Instant,
    ) -> Result<BackupResult> {
        let ctx = &self.ctx;

        let estimate = ctx.estimate_live_size().await?;
        let required = estimate.saturating_mul(2);
        let capacity = ctx.storage.has_capacity(required).await?;
        if !capacity.sufficient {
            return Err(EngineError::InsufficientSpace(format!(
                "available {}, required {} (2 x {} estimated)",
                format_bytes(capacity.available),
                format_bytes(required),
                format_bytes(estimate)
            )));
        }
        if capacity.level == AlertLevel::Critical {
            return Err(EngineError::InsufficientSpace(
                "backup storage usage is at or above the critical threshold".to_string(),
            ));
        }

        ctx.server.flush(triggered_by, cancel).await?;

        let catalog = ctx.catalog.clone();
        let base = tokio::task::spawn_blocking(move || catalog.list_backups())
            .await??
            .into_iter()
            .next();
        let pin = base.as_ref().map(|b| ctx.retention.pin(&b.name));
        if let Some(base) = &base {
            info!(base = %base.name, "Hard-linking against previous backup");
        }

        let (stats, checksum_files) = ctx.capture(name, base.as_ref(), cancel).await?;
        drop(pin);

        let catalog = ctx.catalog.clone();
        let latest = name.to_string();
        match tokio::task::spawn_blocking(move || catalog.set_latest(&latest)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(backup = %name, error = %e, "Failed to update latest pointer"),
            Err(e) => warn!(backup = %name, error = %e, "Latest pointer task failed"),
        }

        let cleanup = ctx.retention.run_cleanup(triggered_by).await?;

        Ok(BackupResult {
            name: name.to_string(),
            path: ctx.catalog.backup_path(name),
            duration_secs: round_secs(started.elapsed()),
            space_saved_percent: space_saved_percent(&stats),
            stats,
            reference_base: base.map(|b| b.name),
            checksum_files,
            deleted_backups: cleanup.deleted,
        })
    }
}

fn round_secs(d: Duration) -> f64 {
    (d.as_secs_f64() * 1000.0).round() / 1000.0
}
