//! Retention policy: which backups expire, and deleting them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::catalog::{is_snapshot_name, validate_name, BackupCatalog, BackupInfo, BackupKind};
use crate::checksum::ChecksumManager;
use crate::fs::walker::directory_size;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    /// Apparent size of the deleted backups
    pub bytes_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgedBackup {
    pub name: String,
    pub age_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionStats {
    pub retention_days: u32,
    pub total: usize,
    pub expired: usize,
    pub kept: usize,
    pub snapshots: usize,
    pub oldest: Option<AgedBackup>,
    pub newest: Option<AgedBackup>,
}

type PinTable = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps a backup out of every deletion path while held.
pub struct PinGuard {
    pins: PinTable,
    name: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = pins.get_mut(&self.name) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.name);
            }
        }
    }
}

pub struct RetentionManager {
    catalog: BackupCatalog,
    checksums: ChecksumManager,
    retention_days: u32,
    audit: Arc<dyn AuditSink>,
    pins: PinTable,
}

/// Backups older than the window, oldest first. Snapshots never qualify.
pub fn expired_among(
    backups: &[BackupInfo],
    now: DateTime<Utc>,
    retention_days: u32,
) -> Vec<BackupInfo> {
    let window = Duration::days(i64::from(retention_days));
    let mut expired: Vec<BackupInfo> = backups
        .iter()
        .filter(|b| b.kind == BackupKind::Backup && !is_snapshot_name(&b.name))
        .filter(|b| now - b.created > window)
        .cloned()
        .collect();
    expired.sort_by(|a, b| a.created.cmp(&b.created));
    expired
}

impl RetentionManager {
    pub fn new(
        catalog: BackupCatalog,
        checksums: ChecksumManager,
        retention_days: u32,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            catalog,
            checksums,
            retention_days,
            audit,
            pins: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn pin(&self, name: &str) -> PinGuard {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        *pins.entry(name.to_string()).or_insert(0) += 1;
        PinGuard {
            pins: self.pins.clone(),
            name: name.to_string(),
        }
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Completed backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || catalog.list_backups()).await?
    }

    pub async fn select_expired(&self, now: DateTime<Utc>, retention_days: u32) -> Result<Vec<BackupInfo>> {
        let backups = self.list_backups().await?;
        Ok(expired_among(&backups, now, retention_days)
            .into_iter()
            .filter(|b| !self.is_pinned(&b.name))
            .collect())
    }

    /// Delete every expired backup. A failed deletion is logged and skipped.
    pub async fn run_cleanup(&self, triggered_by: &str) -> Result<CleanupReport> {
        let expired = self.select_expired(Utc::now(), self.retention_days).await?;
        let mut report = CleanupReport::default();

        for backup in expired {
            match self.remove(&backup.name).await {
                Ok(bytes) => {
                    info!(backup = %backup.name, age_days = backup.age_days(Utc::now()), "Deleted expired backup");
                    report.bytes_removed += bytes;
                    report.deleted.push(backup.name);
                }
                Err(e) => {
                    warn!(backup = %backup.name, error = %e, "Failed to delete expired backup");
                    report.failed.push(backup.name);
                }
            }
        }

        if !report.deleted.is_empty() {
            self.repair_latest().await;
        }

        self.audit.record(AuditEvent::success(
            AuditAction::CleanupExecuted,
            triggered_by,
            json!({
                "retention_days": self.retention_days,
                "deleted": report.deleted,
                "failed": report.failed,
                "bytes_removed": report.bytes_removed,
            }),
        ));
        Ok(report)
    }

    /// Operator deletion of a regular backup.
    pub async fn delete_backup(&self, name: &str, triggered_by: &str) -> Result<u64> {
        validate_name(name)?;
        if is_snapshot_name(name) {
            return Err(EngineError::Precondition(format!(
                "'{name}' is a snapshot; delete it as a snapshot"
            )));
        }
        self.delete_checked(name, triggered_by, AuditAction::BackupDeleted).await
    }

    /// Operator deletion of a pre-restore snapshot.
    pub async fn delete_snapshot(&self, name: &str, triggered_by: &str) -> Result<u64> {
        validate_name(name)?;
        if !is_snapshot_name(name) {
            return Err(EngineError::Precondition(format!("'{name}' is not a snapshot")));
        }
        self.delete_checked(name, triggered_by, AuditAction::SnapshotDeleted).await
    }

    async fn delete_checked(&self, name: &str, triggered_by: &str, action: AuditAction) -> Result<u64> {
        if self.is_pinned(name) {
            return Err(EngineError::Precondition(format!(
                "'{name}' is in use by the running job"
            )));
        }
        let catalog = self.catalog.clone();
        let lookup = name.to_string();
        tokio::task::spawn_blocking(move || catalog.require(&lookup)).await??;

        let bytes = self.remove(name).await?;
        self.repair_latest().await;
        self.audit.record(AuditEvent::success(
            action,
            triggered_by,
            json!({ "name": name, "bytes_removed": bytes }),
        ));
        Ok(bytes)
    }

    async fn remove(&self, name: &str) -> Result<u64> {
        let path = self.catalog.backup_path(name);
        let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            let bytes = directory_size(&path).unwrap_or(0);
            std::fs::remove_dir_all(&path)?;
            Ok(bytes)
        })
        .await??;
        self.checksums.delete(name).await?;
        Ok(bytes)
    }

    async fn repair_latest(&self) {
        let catalog = self.catalog.clone();
        match tokio::task::spawn_blocking(move || catalog.repair_latest()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to repair latest pointer"),
            Err(e) => warn!(error = %e, "Latest pointer repair task failed"),
        }
    }

    pub async fn retention_stats(&self) -> Result<RetentionStats> {
        let now = Utc::now();
        let backups = self.list_backups().await?;
        let catalog = self.catalog.clone();
        let snapshots = tokio::task::spawn_blocking(move || catalog.list_snapshots()).await??;
        let expired = expired_among(&backups, now, self.retention_days).len();

        let aged = |b: &BackupInfo| AgedBackup {
            name: b.name.clone(),
            age_days: b.age_days(now),
        };
        Ok(RetentionStats {
            retention_days: self.retention_days,
            total: backups.len(),
            expired,
            kept: backups.len() - expired,
            snapshots: snapshots.len(),
            oldest: backups.last().map(aged),
            newest: backups.first().map(aged),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SNAPSHOT_PREFIX;
    use crate::testing::RecordingAudit;
    use std::path::Path;
    use tempfile::TempDir;

    fn name_aged(now: DateTime<Utc>, days: i64) -> String {
        (now - Duration::days(days)).format("%Y-%m-%d_%H%M%S").to_string()
    }

    fn make(root: &Path, name: &str) {
        std::fs::create_dir_all(root.join(name).join("world")).unwrap();
        std::fs::write(root.join(name).join("world/level.dat"), b"0123456789").unwrap();
    }

    async fn setup(ages: &[i64]) -> (TempDir, RetentionManager, BackupCatalog, Arc<RecordingAudit>) {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();
        let checksums = ChecksumManager::new(catalog.checksum_dir());
        let now = Utc::now();
        for age in ages {
            let name = name_aged(now, *age);
            make(dir.path(), &name);
            checksums.generate(&dir.path().join(&name), &name).await.unwrap();
        }
        make(dir.path(), &format!("{SNAPSHOT_PREFIX}{}", name_aged(now, 40)));

        let audit = Arc::new(RecordingAudit::default());
        let manager = RetentionManager::new(catalog.clone(), checksums, 10, audit.clone());
        (dir, manager, catalog, audit)
    }

    #[tokio::test]
    async fn test_select_expired_scenario() {
        let (_dir, manager, _, _) = setup(&[1, 5, 11, 40]).await;
        let now = Utc::now();
        let expired = manager.select_expired(now, 10).await.unwrap();
        let names: Vec<_> = expired.iter().map(|b| b.name.clone()).collect();
        assert_eq!(names, vec![name_aged(now, 40), name_aged(now, 11)]);
        assert!(names.iter().all(|n| !n.starts_with(SNAPSHOT_PREFIX)));
    }

    #[test]
    fn test_expired_among_ignores_snapshots() {
        let now = Utc::now();
        let snapshot = BackupInfo {
            name: format!("{SNAPSHOT_PREFIX}{}", name_aged(now, 40)),
            path: "/tmp/x".into(),
            created: now - Duration::days(40),
            kind: BackupKind::Snapshot,
            sub_trees: vec![],
            size: None,
        };
        assert!(expired_among(&[snapshot], now, 10).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (dir, manager, catalog, audit) = setup(&[1, 5, 11, 40]).await;
        catalog.set_latest(&name_aged(Utc::now(), 40)).unwrap();

        let first = manager.run_cleanup("scheduled").await.unwrap();
        assert_eq!(first.deleted.len(), 2);
        assert_eq!(first.bytes_removed, 20);
        assert!(first.failed.is_empty());

        let second = manager.run_cleanup("scheduled").await.unwrap();
        assert!(second.deleted.is_empty());

        // checksum sets went with their backups, snapshot untouched
        let remaining = std::fs::read_dir(dir.path().join("checksums")).unwrap().count();
        assert_eq!(remaining, 2);
        assert_eq!(catalog.list_snapshots().unwrap().len(), 1);
        // latest pointed at a deleted backup and was repaired to the newest one
        let newest = catalog.list_backups().unwrap()[0].name.clone();
        assert_eq!(catalog.latest(), Some(newest));
        assert_eq!(audit.actions().len(), 2);
    }

    #[tokio::test]
    async fn test_pinned_backup_survives_cleanup_and_delete() {
        let (_dir, manager, _, _) = setup(&[40]).await;
        let name = name_aged(Utc::now(), 40);
        let pin = manager.pin(&name);

        assert!(manager.run_cleanup("scheduled").await.unwrap().deleted.is_empty());
        assert!(matches!(
            manager.delete_backup(&name, "ops").await,
            Err(EngineError::Precondition(_))
        ));

        drop(pin);
        assert_eq!(manager.run_cleanup("scheduled").await.unwrap().deleted, vec![name]);
    }

    #[tokio::test]
    async fn test_operator_deletes_respect_kind() {
        let (_dir, manager, catalog, _) = setup(&[1]).await;
        let snapshot = catalog.list_snapshots().unwrap()[0].name.clone();
        let backup = catalog.list_backups().unwrap()[0].name.clone();

        assert!(matches!(
            manager.delete_backup(&snapshot, "ops").await,
            Err(EngineError::Precondition(_))
        ));
        assert!(matches!(
            manager.delete_snapshot(&backup, "ops").await,
            Err(EngineError::Precondition(_))
        ));
        assert!(matches!(
            manager.delete_backup("2001-01-01_000000", "ops").await,
            Err(EngineError::BackupNotFound(_))
        ));

        assert_eq!(manager.delete_snapshot(&snapshot, "ops").await.unwrap(), 10);
        assert_eq!(manager.delete_backup(&backup, "ops").await.unwrap(), 10);
        assert!(catalog.list_backups().unwrap().is_empty());
        assert_eq!(catalog.latest(), None);
    }

    #[tokio::test]
    async fn test_retention_stats() {
        let (_dir, manager, _, _) = setup(&[1, 5, 11, 40]).await;
        let stats = manager.retention_stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.snapshots, 1);
        assert_eq!(stats.oldest.unwrap().age_days, 40);
        assert_eq!(stats.newest.unwrap().age_days, 1);
    }
}
