//! On-disk catalog of backups and snapshots under the backup root.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   2025-01-31_120000/            backup
//!   pre-restore_2025-02-01_080000/ snapshot
//!   .incomplete-<name>/           staging directory of a running job
//!   checksums/<name>.sha256       checksum set
//!   latest -> 2025-01-31_120000   relative symlink
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fs::walker::directory_size;
use crate::utils::errors::{EngineError, Result};

pub const SNAPSHOT_PREFIX: &str = "pre-restore_";
pub const LATEST_POINTER: &str = "latest";
pub const CHECKSUM_DIR: &str = "checksums";
pub const INCOMPLETE_PREFIX: &str = ".incomplete-";

const NAME_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const NAME_TIMESTAMP_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Backup,
    Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub kind: BackupKind,
    /// Top-level directories inside the backup
    pub sub_trees: Vec<String>,
    /// Filled by [`BackupCatalog::measure`]
    pub size: Option<u64>,
}

impl BackupInfo {
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created).num_days()
    }
}

#[derive(Debug, Clone)]
pub struct BackupCatalog {
    root: PathBuf,
}

impl BackupCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(CHECKSUM_DIR))?;
        Ok(())
    }

    pub fn backup_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{INCOMPLETE_PREFIX}{name}"))
    }

    pub fn checksum_dir(&self) -> PathBuf {
        self.root.join(CHECKSUM_DIR)
    }

    /// Timestamp-derived name, suffixed `-N` when the second is already taken.
    pub fn new_backup_name(&self, now: DateTime<Utc>) -> String {
        self.unique_name(&now.format(NAME_FORMAT).to_string())
    }

    pub fn new_snapshot_name(&self, now: DateTime<Utc>) -> String {
        self.unique_name(&format!("{SNAPSHOT_PREFIX}{}", now.format(NAME_FORMAT)))
    }

    fn unique_name(&self, base: &str) -> String {
        let taken = |name: &str| {
            self.backup_path(name).symlink_metadata().is_ok()
                || self.staging_path(name).exists()
                || self.checksum_dir().join(format!("{name}.sha256")).exists()
        };
        if !taken(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Completed backups, newest first. Snapshots, symlinks, staging and
    /// bookkeeping entries are excluded.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.list(BackupKind::Backup)
    }

    /// Pre-restore snapshots, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<BackupInfo>> {
        self.list(BackupKind::Snapshot)
    }

    fn list(&self, kind: BackupKind) -> Result<Vec<BackupInfo>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == CHECKSUM_DIR || name == LATEST_POINTER {
                continue;
            }
            // file_type() does not follow symlinks
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if kind_of(&name) != kind {
                continue;
            }
            items.push(self.describe(&name, &entry.path())?);
        }

        items.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
        Ok(items)
    }

    /// Look up a completed backup or snapshot by name.
    pub fn find(&self, name: &str) -> Result<Option<BackupInfo>> {
        if validate_name(name).is_err() {
            return Ok(None);
        }
        let path = self.backup_path(name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(Some(self.describe(name, &path)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn require(&self, name: &str) -> Result<BackupInfo> {
        self.find(name)?
            .ok_or_else(|| EngineError::BackupNotFound(name.to_string()))
    }

    /// Fill in the hard-link aware size of each entry.
    pub fn measure(&self, mut infos: Vec<BackupInfo>) -> Result<Vec<BackupInfo>> {
        for info in &mut infos {
            info.size = Some(directory_size(&info.path)?);
        }
        Ok(infos)
    }

    fn describe(&self, name: &str, path: &Path) -> Result<BackupInfo> {
        let created = match parse_name_timestamp(name) {
            Some(ts) => ts,
            None => fs::metadata(path)?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };

        let mut sub_trees = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                sub_trees.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        sub_trees.sort();

        Ok(BackupInfo {
            name: name.to_string(),
            path: path.to_path_buf(),
            created,
            kind: kind_of(name),
            sub_trees,
            size: None,
        })
    }

    /// Name the `latest` pointer currently designates, if it resolves.
    pub fn latest(&self) -> Option<String> {
        let link = self.root.join(LATEST_POINTER);
        let target = fs::read_link(&link).ok()?;
        let name = target.file_name()?.to_string_lossy().to_string();
        self.backup_path(&name).is_dir().then_some(name)
    }

    /// Repoint `latest` by renaming a fresh link over the old one.
    pub fn set_latest(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let tmp = self.root.join(format!("{LATEST_POINTER}.tmp"));
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(name, &tmp)?;
        fs::rename(&tmp, self.root.join(LATEST_POINTER))?;
        debug!(backup = %name, "Latest pointer updated");
        Ok(())
    }

    /// Point `latest` at the newest remaining backup, or drop it when none remain.
    pub fn repair_latest(&self) -> Result<Option<String>> {
        let newest = self.list_backups()?.into_iter().next().map(|b| b.name);
        match &newest {
            Some(name) if self.latest().as_deref() != Some(name.as_str()) => {
                self.set_latest(name)?;
                info!(backup = %name, "Latest pointer repaired");
            }
            Some(_) => {}
            None => match fs::remove_file(self.root.join(LATEST_POINTER)) {
                Ok(()) => info!("Latest pointer removed, no backups remain"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(newest)
    }

    /// Remove staging directories left behind by an interrupted process.
    pub fn clean_stale_staging(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(INCOMPLETE_PREFIX) && entry.file_type()?.is_dir() {
                warn!(path = %entry.path().display(), "Removing stale staging directory");
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn is_snapshot_name(name: &str) -> bool {
    name.starts_with(SNAPSHOT_PREFIX)
}

fn kind_of(name: &str) -> BackupKind {
    if is_snapshot_name(name) {
        BackupKind::Snapshot
    } else {
        BackupKind::Backup
    }
}

/// Reject names that could escape the backup root or shadow bookkeeping entries.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name == LATEST_POINTER
        || name == CHECKSUM_DIR;
    if invalid {
        return Err(EngineError::Precondition(format!("invalid backup name '{name}'")));
    }
    Ok(())
}

fn parse_name_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(SNAPSHOT_PREFIX).unwrap_or(name);
    let stamp = stamp.get(..NAME_TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, NAME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn make(root: &Path, name: &str) {
        fs::create_dir_all(root.join(name).join("world")).unwrap();
        fs::write(root.join(name).join("world/level.dat"), name.as_bytes()).unwrap();
    }

    #[test]
    fn test_listing_excludes_snapshots_links_and_staging() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();

        make(dir.path(), "2025-01-01_000000");
        make(dir.path(), "2025-01-03_000000");
        make(dir.path(), "pre-restore_2025-01-02_000000");
        make(dir.path(), ".incomplete-2025-01-04_000000");
        catalog.set_latest("2025-01-03_000000").unwrap();

        let names: Vec<_> = catalog
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["2025-01-03_000000", "2025-01-01_000000"]);

        let snapshots = catalog.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].kind, BackupKind::Snapshot);
        assert_eq!(snapshots[0].sub_trees, vec!["world"]);
    }

    #[test]
    fn test_name_timestamp_parsed() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        make(dir.path(), "pre-restore_2025-02-01_080000");

        let info = catalog.require("pre-restore_2025-02-01_080000").unwrap();
        assert_eq!(info.created, Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_unique_names_get_suffix() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();

        assert_eq!(catalog.new_backup_name(now), "2025-01-31_120000");
        make(dir.path(), "2025-01-31_120000");
        assert_eq!(catalog.new_backup_name(now), "2025-01-31_120000-2");
        assert_eq!(catalog.new_snapshot_name(now), "pre-restore_2025-01-31_120000");
    }

    #[test]
    fn test_latest_pointer_lifecycle() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        assert_eq!(catalog.latest(), None);

        make(dir.path(), "2025-01-01_000000");
        make(dir.path(), "2025-01-02_000000");
        catalog.set_latest("2025-01-01_000000").unwrap();
        assert_eq!(catalog.latest().as_deref(), Some("2025-01-01_000000"));

        catalog.set_latest("2025-01-02_000000").unwrap();
        assert_eq!(catalog.latest().as_deref(), Some("2025-01-02_000000"));
        assert!(!dir.path().join("latest.tmp").exists());

        fs::remove_dir_all(dir.path().join("2025-01-02_000000")).unwrap();
        assert_eq!(
            catalog.repair_latest().unwrap().as_deref(),
            Some("2025-01-01_000000")
        );
        assert_eq!(catalog.latest().as_deref(), Some("2025-01-01_000000"));

        fs::remove_dir_all(dir.path().join("2025-01-01_000000")).unwrap();
        assert_eq!(catalog.repair_latest().unwrap(), None);
        assert!(fs::symlink_metadata(dir.path().join("latest")).is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("2025-01-01_000000").is_ok());
        assert!(validate_name("pre-restore_2025-01-01_000000").is_ok());
        for bad in ["", ".", "..", "../etc", "a/b", "latest", "checksums", ".incomplete-x"] {
            assert!(validate_name(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_clean_stale_staging() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::new(dir.path());
        make(dir.path(), ".incomplete-2025-01-01_000000");
        make(dir.path(), "2025-01-01_000000");

        assert_eq!(catalog.clean_stale_staging().unwrap(), 1);
        assert_eq!(catalog.list_backups().unwrap().len(), 1);
    }
}
