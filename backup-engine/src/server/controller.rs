//! Stop/start/save protocol over the remote lifecycle API.
//!
//! Every wait is a bounded poll with an explicit deadline. Polling errors are
//! logged and retried until the deadline; only the deadline ends a wait.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LifecycleApi, PowerSignal, ServerResources, ServerState};
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::TimeoutConfig;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy)]
pub struct ControllerTimings {
    pub flush_settle: Duration,
    pub graceful_stop: Duration,
    pub forced_stop: Duration,
    pub start: Duration,
    pub startup_monitor: Duration,
    pub poll_interval: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for ControllerTimings {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            flush_settle: Duration::from_secs(t.flush_settle_secs),
            graceful_stop: Duration::from_secs(t.graceful_stop_secs),
            forced_stop: Duration::from_secs(t.forced_stop_secs),
            start: Duration::from_secs(t.start_secs),
            startup_monitor: Duration::from_secs(t.startup_monitor_secs),
            poll_interval: Duration::from_secs(t.poll_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached { elapsed: Duration },
    TimedOut { last_seen: Option<ServerState> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    Graceful,
    Forced,
    AlreadyOffline,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StopReport {
    pub method: StopMethod,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub struct ServerStateController {
    api: Arc<dyn LifecycleApi>,
    audit: Arc<dyn AuditSink>,
    timings: ControllerTimings,
    flush_command: String,
}

impl ServerStateController {
    pub fn new(
        api: Arc<dyn LifecycleApi>,
        audit: Arc<dyn AuditSink>,
        timings: ControllerTimings,
        flush_command: impl Into<String>,
    ) -> Self {
        Self {
            api,
            audit,
            timings,
            flush_command: flush_command.into(),
        }
    }

    pub fn timings(&self) -> &ControllerTimings {
        &self.timings
    }

    pub async fn status(&self) -> Result<ServerResources> {
        self.api.get_resources().await
    }

    /// Poll until the server reports `target` or the timeout elapses.
    pub async fn wait_for_state(
        &self,
        target: ServerState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_seen = None;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.api.get_state().await {
                Ok(state) => {
                    last_seen = Some(state);
                    if state == target {
                        return Ok(WaitOutcome::Reached {
                            elapsed: started.elapsed(),
                        });
                    }
                    debug!(current = %state, target = %target, "Waiting for server state");
                }
                Err(e) => warn!(error = %e, target = %target, "State poll failed, retrying"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut { last_seen });
            }
            let pause = self.timings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Ask a running server to persist its world, then let the write settle.
    pub async fn flush(&self, triggered_by: &str, cancel: &CancellationToken) -> Result<()> {
        let state = self.api.get_state().await?;
        if state != ServerState::Running {
            self.audit.record(AuditEvent::failure(
                AuditAction::SaveFailed,
                triggered_by,
                json!({ "reason": "server not running", "state": state }),
            ));
            return Err(EngineError::Precondition(format!(
                "server must be running to save, current state is {state}"
            )));
        }

        self.audit.record(AuditEvent::pending(
            AuditAction::SaveRequested,
            triggered_by,
            json!({ "command": self.flush_command }),
        ));
        if let Err(e) = self.api.send_command(&self.flush_command).await {
            self.audit.record(AuditEvent::failure(
                AuditAction::SaveFailed,
                triggered_by,
                json!({ "error": e.to_string() }),
            ));
            return Err(e);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.timings.flush_settle) => {}
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        }

        info!(command = %self.flush_command, "World saved");
        self.audit.record(AuditEvent::success(
            AuditAction::SaveCompleted,
            triggered_by,
            json!({ "settle_secs": self.timings.flush_settle.as_secs() }),
        ));
        Ok(())
    }

    /// Graceful stop, escalating to a forced kill. Fails when the server is
    /// still not offline after both windows; files must not be touched then.
    pub async fn stop(&self, triggered_by: &str, cancel: &CancellationToken) -> Result<StopReport> {
        let started = Instant::now();

        if let Ok(ServerState::Offline) = self.api.get_state().await {
            info!("Server already offline");
            return Ok(StopReport {
                method: StopMethod::AlreadyOffline,
                elapsed: started.elapsed(),
            });
        }

        self.audit.record(AuditEvent::pending(
            AuditAction::ServerStopRequested,
            triggered_by,
            json!({ "graceful_timeout_secs": self.timings.graceful_stop.as_secs() }),
        ));
        if let Err(e) = self.api.send_power(PowerSignal::Stop).await {
            self.audit.record(AuditEvent::failure(
                AuditAction::ServerStopFailed,
                triggered_by,
                json!({ "error": e.to_string() }),
            ));
            return Err(e);
        }

        let method = match self
            .wait_for_state(ServerState::Offline, self.timings.graceful_stop, cancel)
            .await?
        {
            WaitOutcome::Reached { .. } => StopMethod::Graceful,
            WaitOutcome::TimedOut { last_seen } => {
                warn!(
                    last_seen = ?last_seen,
                    timeout_secs = self.timings.graceful_stop.as_secs(),
                    "Graceful stop timed out, killing server"
                );
                if let Err(e) = self.api.send_power(PowerSignal::Kill).await {
                    warn!(error = %e, "Kill signal failed, waiting anyway");
                }
                match self
                    .wait_for_state(ServerState::Offline, self.timings.forced_stop, cancel)
                    .await?
                {
                    WaitOutcome::Reached { .. } => StopMethod::Forced,
                    WaitOutcome::TimedOut { last_seen } => {
                        let waited = started.elapsed();
                        self.audit.record(AuditEvent::failure(
                            AuditAction::ServerStopTimeout,
                            triggered_by,
                            json!({ "waited_secs": waited.as_secs(), "last_seen": last_seen }),
                        ));
                        return Err(EngineError::StopTimeout { waited });
                    }
                }
            }
        };

        let report = StopReport {
            method,
            elapsed: started.elapsed(),
        };
        info!(method = ?report.method, elapsed_secs = report.elapsed.as_secs(), "Server stopped");
        self.audit.record(AuditEvent::success(
            AuditAction::ServerStopped,
            triggered_by,
            json!(report),
        ));
        Ok(report)
    }

    /// Start the server and wait until it reports running.
    pub async fn start(&self, triggered_by: &str, cancel: &CancellationToken) -> Result<Duration> {
        let started = Instant::now();
        if self.send_start(triggered_by).await? {
            return Ok(started.elapsed());
        }

        match self
            .wait_for_state(ServerState::Running, self.timings.start, cancel)
            .await?
        {
            WaitOutcome::Reached { elapsed } => {
                self.record_started(triggered_by, elapsed);
                Ok(elapsed)
            }
            WaitOutcome::TimedOut { last_seen } => {
                self.audit.record(AuditEvent::failure(
                    AuditAction::ServerStartFailed,
                    triggered_by,
                    json!({ "reason": "timeout", "last_seen": last_seen }),
                ));
                Err(EngineError::StartTimeout {
                    waited: self.timings.start,
                })
            }
        }
    }

    /// Start and watch the boot: going offline after having left offline is a
    /// crash, not reaching running within `window` is a timeout.
    pub async fn start_monitored(
        &self,
        triggered_by: &str,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let started = Instant::now();
        if self.send_start(triggered_by).await? {
            return Ok(started.elapsed());
        }

        let deadline = started + window;
        let mut left_offline = false;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.api.get_state().await {
                Ok(ServerState::Running) => {
                    let elapsed = started.elapsed();
                    self.record_started(triggered_by, elapsed);
                    return Ok(elapsed);
                }
                Ok(ServerState::Offline) if left_offline => {
                    let elapsed = started.elapsed();
                    self.audit.record(AuditEvent::failure(
                        AuditAction::ServerCrashed,
                        triggered_by,
                        json!({ "after_secs": elapsed.as_secs() }),
                    ));
                    return Err(EngineError::ServerCrash(format!(
                        "server went offline {}s into startup",
                        elapsed.as_secs()
                    )));
                }
                Ok(ServerState::Offline) => {}
                Ok(state) => {
                    left_offline = true;
                    debug!(state = %state, "Server booting");
                }
                Err(e) => warn!(error = %e, "State poll failed during startup, retrying"),
            }

            let now = Instant::now();
            if now >= deadline {
                self.audit.record(AuditEvent::failure(
                    AuditAction::ServerStartFailed,
                    triggered_by,
                    json!({ "reason": "timeout", "window_secs": window.as_secs() }),
                ));
                return Err(EngineError::StartTimeout { waited: window });
            }
            let pause = self.timings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    pub async fn restart(&self, triggered_by: &str, cancel: &CancellationToken) -> Result<Duration> {
        self.stop(triggered_by, cancel).await?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        }
        self.start(triggered_by, cancel).await
    }

    /// Returns true when the server was already running and no signal was sent.
    async fn send_start(&self, triggered_by: &str) -> Result<bool> {
        if let Ok(ServerState::Running) = self.api.get_state().await {
            info!("Server already running");
            return Ok(true);
        }
        self.audit.record(AuditEvent::pending(
            AuditAction::ServerStartRequested,
            triggered_by,
            json!({}),
        ));
        if let Err(e) = self.api.send_power(PowerSignal::Start).await {
            self.audit.record(AuditEvent::failure(
                AuditAction::ServerStartFailed,
                triggered_by,
                json!({ "error": e.to_string() }),
            ));
            return Err(e);
        }
        Ok(false)
    }

    fn record_started(&self, triggered_by: &str, elapsed: Duration) {
        info!(elapsed_secs = elapsed.as_secs(), "Server running");
        self.audit.record(AuditEvent::success(
            AuditAction::ServerStarted,
            triggered_by,
            json!({ "elapsed_secs": elapsed.as_secs() }),
        ));
    }
}
