//! Capacity measurement and threshold alerts for the backup root.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::fs::walker::directory_size;
use crate::notify::{Notification, Notifier};
use crate::utils::errors::Result;
use crate::utils::format::{format_bytes, round_percent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    None,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapacityModel {
    /// Free space of the filesystem holding the backup root
    Filesystem,
    /// Fixed allocation minus the current size of the backup root
    Quota { max_bytes: u64 },
}

impl CapacityModel {
    pub fn name(&self) -> &'static str {
        match self {
            CapacityModel::Filesystem => "filesystem",
            CapacityModel::Quota { .. } => "quota",
        }
    }
}

/// Source of filesystem capacity figures.
pub trait SpaceProbe: Send + Sync {
    fn total_space(&self, path: &Path) -> io::Result<u64>;
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2Probe;

impl SpaceProbe for Fs2Probe {
    fn total_space(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsageSample {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percentage: f64,
    pub level: AlertLevel,
    pub last_alert: AlertLevel,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapacityCheck {
    pub available: u64,
    pub required: u64,
    pub sufficient: bool,
    /// Threshold level of the sample the check was made against
    pub level: AlertLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCheck {
    pub sample: DiskUsageSample,
    pub alerted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub model: &'static str,
    pub warning_percent: f64,
    pub critical_percent: f64,
    #[serde(flatten)]
    pub sample: DiskUsageSample,
}

pub struct StorageMonitor {
    root: PathBuf,
    model: CapacityModel,
    warning_percent: f64,
    critical_percent: f64,
    probe: Arc<dyn SpaceProbe>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    last_alert: Mutex<AlertLevel>,
}

impl StorageMonitor {
    pub fn new(
        root: impl Into<PathBuf>,
        model: CapacityModel,
        warning_percent: f64,
        critical_percent: f64,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            root: root.into(),
            model,
            warning_percent,
            critical_percent,
            probe: Arc::new(Fs2Probe),
            audit,
            notifier,
            last_alert: Mutex::new(AlertLevel::None),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn level_for(&self, percentage: f64) -> AlertLevel {
        if percentage >= self.critical_percent {
            AlertLevel::Critical
        } else if percentage >= self.warning_percent {
            AlertLevel::Warning
        } else {
            AlertLevel::None
        }
    }

    fn last_alert(&self) -> AlertLevel {
        *self.last_alert.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read current capacity under the active model.
    pub async fn sample(&self) -> Result<DiskUsageSample> {
        let (total, used, available) = match self.model {
            CapacityModel::Filesystem => {
                let probe = self.probe.clone();
                let root = self.root.clone();
                tokio::task::spawn_blocking(move || -> io::Result<(u64, u64, u64)> {
                    let total = probe.total_space(&root)?;
                    let available = probe.available_space(&root)?;
                    Ok((total, total.saturating_sub(available), available))
                })
                .await??
            }
            CapacityModel::Quota { max_bytes } => {
                let root = self.root.clone();
                let used = tokio::task::spawn_blocking(move || match directory_size(&root) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
                    other => other,
                })
                .await??;
                (max_bytes, used, max_bytes.saturating_sub(used))
            }
        };

        let percentage = if total == 0 {
            0.0
        } else {
            round_percent(used as f64 / total as f64 * 100.0)
        };

        Ok(DiskUsageSample {
            total,
            used,
            available,
            percentage,
            level: self.level_for(percentage),
            last_alert: self.last_alert(),
        })
    }

    /// Whether `required` bytes fit under the active model.
    pub async fn has_capacity(&self, required: u64) -> Result<CapacityCheck> {
        let sample = self.sample().await?;
        let check = CapacityCheck {
            available: sample.available,
            required,
            sufficient: sample.available >= required,
            level: sample.level,
        };
        debug!(
            available = %format_bytes(check.available),
            required = %format_bytes(required),
            sufficient = check.sufficient,
            "Capacity check"
        );
        Ok(check)
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            model: self.model.name(),
            warning_percent: self.warning_percent,
            critical_percent: self.critical_percent,
            sample: self.sample().await?,
        })
    }

    /// Sample usage and alert with hysteresis: a warning is announced once per
    /// transition, a critical level on every check, and returning below the
    /// warning threshold resets the state.
    pub async fn check_and_alert(&self, triggered_by: &str) -> Result<AlertCheck> {
        let sample = self.sample().await?;
        let level = sample.level;

        let alerted = {
            let mut last = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
            let fire = level != AlertLevel::None && (level != *last || level == AlertLevel::Critical);
            if level == AlertLevel::None && *last != AlertLevel::None {
                info!(percentage = sample.percentage, "Storage usage back below warning threshold");
            }
            *last = level;
            fire
        };

        if alerted {
            let action = match level {
                AlertLevel::Critical => AuditAction::StorageCritical,
                _ => AuditAction::StorageWarning,
            };
            warn!(
                level = ?level,
                percentage = sample.percentage,
                used = %format_bytes(sample.used),
                total = %format_bytes(sample.total),
                "Storage threshold exceeded"
            );
            self.audit.record(AuditEvent::warning(
                action,
                triggered_by,
                serde_json::json!({
                    "percentage": sample.percentage,
                    "used": sample.used,
                    "total": sample.total,
                    "available": sample.available,
                    "model": self.model.name(),
                }),
            ));
            self.notifier.notify(Notification::StorageAlert {
                level,
                percentage: sample.percentage,
                used: sample.used,
                total: sample.total,
            });
        }

        Ok(AlertCheck { sample, alerted })
    }
}
