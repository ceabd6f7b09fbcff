//! Job outcome notifications.
//!
//! The orchestrators hand a [`Notification`] to a [`Notifier`] after every
//! job. Implementations must not block: anything slow is spawned.

use serde::Serialize;
use std::fmt;
use tracing::info;

use crate::storage::monitor::AlertLevel;
use crate::sync::SyncStats;
use crate::utils::format::{format_bytes, format_duration};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BackupCompleted {
        backup: String,
        triggered_by: String,
        duration_secs: u64,
        stats: SyncStats,
        space_saved_percent: f64,
        deleted_backups: Vec<String>,
    },
    BackupFailed {
        triggered_by: String,
        error_kind: String,
        error: String,
        duration_secs: u64,
    },
    RestoreCompleted {
        backup: String,
        snapshot: String,
        triggered_by: String,
        duration_secs: u64,
    },
    RestoreFailed {
        backup: String,
        snapshot: Option<String>,
        triggered_by: String,
        error_kind: String,
        error: String,
        /// None when the server was never touched
        server_restarted: Option<bool>,
    },
    StorageAlert {
        level: AlertLevel,
        percentage: f64,
        used: u64,
        total: u64,
    },
}

impl Notification {
    pub fn event(&self) -> &'static str {
        match self {
            Notification::BackupCompleted { .. } => "backup_completed",
            Notification::BackupFailed { .. } => "backup_failed",
            Notification::RestoreCompleted { .. } => "restore_completed",
            Notification::RestoreFailed { .. } => "restore_failed",
            Notification::StorageAlert { .. } => "storage_alert",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::BackupCompleted {
                backup,
                triggered_by,
                duration_secs,
                stats,
                space_saved_percent,
                deleted_backups,
            } => {
                write!(
                    f,
                    "Backup {backup} completed in {} ({} files, {} transferred of {}, {space_saved_percent:.2}% saved by hard links), triggered by {triggered_by}",
                    format_duration(std::time::Duration::from_secs(*duration_secs)),
                    stats.files_total,
                    format_bytes(stats.bytes_transferred),
                    format_bytes(stats.bytes_total),
                )?;
                if !deleted_backups.is_empty() {
                    write!(f, "; {} expired backup(s) removed", deleted_backups.len())?;
                }
                Ok(())
            }
            Notification::BackupFailed {
                triggered_by,
                error,
                duration_secs,
                ..
            } => write!(
                f,
                "Backup failed after {}: {error} (triggered by {triggered_by})",
                format_duration(std::time::Duration::from_secs(*duration_secs))
            ),
            Notification::RestoreCompleted {
                backup,
                snapshot,
                triggered_by,
                duration_secs,
            } => write!(
                f,
                "Restore of {backup} completed in {}, server is running. Rollback snapshot: {snapshot} (triggered by {triggered_by})",
                format_duration(std::time::Duration::from_secs(*duration_secs))
            ),
            Notification::RestoreFailed {
                backup,
                snapshot,
                error,
                server_restarted,
                ..
            } => {
                write!(f, "Restore of {backup} failed: {error}")?;
                if let Some(snapshot) = snapshot {
                    write!(f, ". Rollback snapshot: {snapshot}")?;
                }
                if *server_restarted == Some(false) {
                    write!(f, ". Server may be offline")?;
                }
                Ok(())
            }
            Notification::StorageAlert {
                level,
                percentage,
                used,
                total,
            } => write!(
                f,
                "Storage {level:?}: {percentage:.1}% used ({} of {})",
                format_bytes(*used),
                format_bytes(*total)
            ),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(event = notification.event(), "{notification}");
    }
}
