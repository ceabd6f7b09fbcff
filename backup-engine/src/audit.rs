//! Append-only audit trail of every operator-visible action.
//!
//! Entries are written as JSON lines to one file per UTC day
//! (`audit-YYYY-MM-DD.log`). Recording never fails from the caller's point
//! of view: write errors are logged and dropped.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::utils::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupDeleted,
    SnapshotCreated,
    SnapshotDeleted,
    RestoreInitiated,
    RestoreCompleted,
    RestoreFailed,
    ServerStopRequested,
    ServerStopped,
    ServerStopTimeout,
    ServerStopFailed,
    ServerStartRequested,
    ServerStarted,
    ServerStartFailed,
    ServerCrashed,
    SaveRequested,
    SaveCompleted,
    SaveFailed,
    CleanupExecuted,
    StorageWarning,
    StorageCritical,
    JobCancelRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub action: AuditAction,
    pub triggered_by: String,
    #[serde(default)]
    pub details: Value,
    pub result: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl AuditEvent {
    pub fn new(
        level: AuditLevel,
        action: AuditAction,
        triggered_by: &str,
        details: Value,
        result: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            action,
            triggered_by: triggered_by.to_string(),
            details,
            result,
            host: None,
        }
    }

    pub fn success(action: AuditAction, triggered_by: &str, details: Value) -> Self {
        Self::new(AuditLevel::Info, action, triggered_by, details, AuditOutcome::Success)
    }

    pub fn pending(action: AuditAction, triggered_by: &str, details: Value) -> Self {
        Self::new(AuditLevel::Info, action, triggered_by, details, AuditOutcome::Pending)
    }

    pub fn failure(action: AuditAction, triggered_by: &str, details: Value) -> Self {
        Self::new(AuditLevel::Error, action, triggered_by, details, AuditOutcome::Failure)
    }

    pub fn warning(action: AuditAction, triggered_by: &str, details: Value) -> Self {
        Self::new(AuditLevel::Warn, action, triggered_by, details, AuditOutcome::Failure)
    }
}

/// Fire-and-forget destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub triggered_by: Option<String>,
    pub level: Option<AuditLevel>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.action.map_or(true, |a| a == event.action)
            && self
                .triggered_by
                .as_deref()
                .map_or(true, |t| t == event.triggered_by)
            && self.level.map_or(true, |l| l == event.level)
            && self.since.map_or(true, |s| event.timestamp >= s)
    }
}

/// JSON-lines audit log with daily files.
pub struct JsonlAuditLog {
    dir: PathBuf,
    host: Option<String>,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let host = hostname::get().ok().and_then(|h| h.into_string().ok());
        Self {
            dir: dir.into(),
            host,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.log", date.format("%Y-%m-%d")))
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        let json = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(event.timestamp.date_naive()))?;
        writeln!(file, "{json}")?;
        file.flush()?;
        Ok(())
    }

    /// Matching entries, newest first.
    pub fn query(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut results = Vec::new();
        for (_, path) in self.log_files()?.into_iter().rev() {
            let mut day = read_events(&path)?;
            day.reverse();
            for event in day {
                if filter.matches(&event) {
                    results.push(event);
                    if results.len() >= limit {
                        return Ok(results);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Delete daily files older than the retention window.
    pub fn prune(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.date_naive() - chrono::Duration::days(i64::from(retention_days));
        let mut removed = 0;
        for (date, path) in self.log_files()? {
            if date < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, retention_days, "Pruned audit log files");
        }
        Ok(removed)
    }

    /// Daily files sorted oldest first.
    fn log_files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let date = name
                .strip_prefix("audit-")
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            if let Some(date) = date {
                files.push((date, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, mut event: AuditEvent) {
        if event.host.is_none() {
            event.host = self.host.clone();
        }
        match event.level {
            AuditLevel::Info => info!(action = ?event.action, triggered_by = %event.triggered_by, "audit"),
            AuditLevel::Warn => warn!(action = ?event.action, triggered_by = %event.triggered_by, "audit"),
            AuditLevel::Error => error!(action = ?event.action, triggered_by = %event.triggered_by, "audit"),
        }
        if let Err(e) = self.append(&event) {
            error!(error = %e, action = ?event.action, "Failed to write audit entry");
        }
    }
}

fn read_events(path: &Path) -> Result<Vec<AuditEvent>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                file = %path.display(),
                line = line_num + 1,
                error = %e,
                "Skipping unreadable audit entry"
            ),
        }
    }
    Ok(events)
}
