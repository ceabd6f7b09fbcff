//! Error taxonomy shared by every orchestration step.

use std::time::Duration;
use thiserror::Error;

use crate::job::JobKind;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Another {active} job is already running ({target}, triggered by {triggered_by})")]
    Concurrency {
        active: JobKind,
        target: String,
        triggered_by: String,
    },

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Server did not stop within {waited:?} (graceful and forced)")]
    StopTimeout { waited: Duration },

    #[error("Server did not reach running within {waited:?}")]
    StartTimeout { waited: Duration },

    #[error("Server crashed during startup: {0}")]
    ServerCrash(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Configuration error: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("Remote lifecycle API error: {0}")]
    Remote(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("No job is currently running")]
    NoActiveJob,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier used in audit entries and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Concurrency { .. } => "concurrency",
            EngineError::InsufficientSpace(_) => "insufficient_space",
            EngineError::Precondition(_) => "precondition",
            EngineError::StopTimeout { .. } => "stop_timeout",
            EngineError::StartTimeout { .. } => "start_timeout",
            EngineError::ServerCrash(_) => "server_crash",
            EngineError::Transfer(_) => "transfer",
            EngineError::Verification(_) => "verification",
            EngineError::BackupNotFound(_) => "backup_not_found",
            EngineError::Configuration(_) => "configuration",
            EngineError::Remote(_) => "remote",
            EngineError::Cancelled => "cancelled",
            EngineError::NoActiveJob => "no_active_job",
            EngineError::Io(_) => "io",
        }
    }
}

/// Join errors from `spawn_blocking` only happen when the closure panicked.
impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Io(std::io::Error::other(format!("blocking task failed: {err}")))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
