//! Single-slot job exclusion.
//!
//! At most one backup, restore or maintenance operation runs at a time. A
//! job holds a [`JobGuard`] for its whole lifetime; dropping the guard frees the slot, so every exit
//! path (success, error, panic) releases it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
    /// Operator deletions, retention cleanup and server restarts
    Maintenance,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => write!(f, "backup"),
            JobKind::Restore => write!(f, "restore"),
            JobKind::Maintenance => write!(f, "maintenance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Cancelling,
}

/// Descriptor of the job currently holding the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub target: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
}

struct ActiveJob {
    record: JobRecord,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct JobSlot {
    inner: Arc<Mutex<Option<ActiveJob>>>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the slot or fail with a concurrency error naming the active job.
    pub fn try_acquire(&self, kind: JobKind, target: &str, triggered_by: &str) -> Result<JobGuard> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            return Err(EngineError::Concurrency {
                active: active.record.kind,
                target: active.record.target.clone(),
                triggered_by: active.record.triggered_by.clone(),
            });
        }

        let record = JobRecord {
            id: Uuid::new_v4(),
            kind,
            target: target.to_string(),
            triggered_by: triggered_by.to_string(),
            started_at: Utc::now(),
            status: JobStatus::Running,
        };
        let cancel = CancellationToken::new();
        *slot = Some(ActiveJob {
            record: record.clone(),
            cancel: cancel.clone(),
        });

        Ok(JobGuard {
            slot: self.clone(),
            record,
            cancel,
        })
    }

    pub fn current(&self) -> Option<JobRecord> {
        self.lock().as_ref().map(|a| a.record.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    /// Fire the active job's cancellation token. The slot stays held until
    /// the job itself unwinds and drops its guard.
    pub fn cancel(&self) -> Result<JobRecord> {
        let mut slot = self.lock();
        let active = slot.as_mut().ok_or(EngineError::NoActiveJob)?;
        active.record.status = JobStatus::Cancelling;
        active.cancel.cancel();
        Ok(active.record.clone())
    }
}

/// Proof of slot ownership for one job.
pub struct JobGuard {
    slot: JobSlot,
    record: JobRecord,
    cancel: CancellationToken,
}

impl JobGuard {
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Update the target once it is known (backup names are chosen after acquiring).
    pub fn set_target(&mut self, target: &str) {
        self.record.target = target.to_string();
        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_mut() {
            if active.record.id == self.record.id {
                active.record.target = target.to_string();
            }
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|a| a.record.id) == Some(self.record.id) {
            *slot = None;
        }
    }
}
