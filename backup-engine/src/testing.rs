//! In-memory fakes for the engine's ports.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::notify::{Notification, Notifier};
use crate::server::{LifecycleApi, PowerSignal, ServerResources, ServerState};
use crate::storage::monitor::SpaceProbe;
use crate::sync::{FileSyncPort, NativeSync, SyncRequest, SyncStats};
use crate::utils::errors::{EngineError, Result};

type Script = Vec<(Duration, ServerState)>;

struct LifecycleState {
    current: ServerState,
    active: Option<(Script, Instant)>,
    signals: Vec<PowerSignal>,
    commands: Vec<String>,
    failing_polls: usize,
}

/// Lifecycle API whose state follows a per-signal script of
/// `(time since signal, state)` transitions.
pub struct FakeLifecycle {
    on_stop: Script,
    on_kill: Script,
    on_start: Script,
    state: Mutex<LifecycleState>,
}

impl FakeLifecycle {
    pub fn new(initial: ServerState) -> Self {
        Self {
            on_stop: vec![(Duration::ZERO, ServerState::Offline)],
            on_kill: vec![(Duration::ZERO, ServerState::Offline)],
            on_start: vec![(Duration::ZERO, ServerState::Running)],
            state: Mutex::new(LifecycleState {
                current: initial,
                active: None,
                signals: Vec::new(),
                commands: Vec::new(),
                failing_polls: 0,
            }),
        }
    }

    pub fn on_stop(mut self, script: Script) -> Self {
        self.on_stop = script;
        self
    }

    pub fn on_kill(mut self, script: Script) -> Self {
        self.on_kill = script;
        self
    }

    pub fn on_start(mut self, script: Script) -> Self {
        self.on_start = script;
        self
    }

    pub fn fail_next_polls(&self, n: usize) {
        self.state.lock().unwrap().failing_polls = n;
    }

    pub fn signals(&self) -> Vec<PowerSignal> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    fn resolve(state: &mut LifecycleState) -> ServerState {
        if let Some((script, at)) = &state.active {
            let elapsed = at.elapsed();
            for (delay, next) in script {
                if elapsed >= *delay {
                    state.current = *next;
                }
            }
        }
        state.current
    }
}

#[async_trait]
impl LifecycleApi for FakeLifecycle {
    async fn get_resources(&self) -> Result<ServerResources> {
        let mut state = self.state.lock().unwrap();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(EngineError::Remote("connection reset".to_string()));
        }
        Ok(ServerResources {
            state: Self::resolve(&mut state),
            cpu_percent: 12.5,
            memory_bytes: 1024,
            disk_bytes: 2048,
            uptime_ms: 0,
        })
    }

    async fn send_power(&self, signal: PowerSignal) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::resolve(&mut state);
        let script = match signal {
            PowerSignal::Stop => self.on_stop.clone(),
            PowerSignal::Kill => self.on_kill.clone(),
            PowerSignal::Start | PowerSignal::Restart => self.on_start.clone(),
        };
        state.active = Some((script, Instant::now()));
        state.signals.push(signal);
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        self.state.lock().unwrap().commands.push(command.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|n| n.event()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

pub struct FixedProbe {
    total: u64,
    available: AtomicU64,
}

impl FixedProbe {
    pub fn new(total: u64, available: u64) -> Self {
        Self {
            total,
            available: AtomicU64::new(available),
        }
    }

    pub fn set_available(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedProbe {
    fn total_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.total)
    }

    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// Native sync that can be told to fail or stall a given call (1-based).
///
/// A stalled call waits for cancellation and then returns `Cancelled`.
#[derive(Default)]
pub struct FlakySync {
    inner: NativeSync,
    calls: AtomicUsize,
    fail_on: AtomicUsize,
    stall_on: AtomicUsize,
    requests: Mutex<Vec<SyncRequest>>,
}

impl FlakySync {
    pub fn failing_on(call: usize) -> Self {
        let sync = Self::default();
        sync.fail_on.store(call, Ordering::SeqCst);
        sync
    }

    pub fn stalling_on(call: usize) -> Self {
        let sync = Self::default();
        sync.stall_on.store(call, Ordering::SeqCst);
        sync
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileSyncPort for FlakySync {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncStats> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if call == self.fail_on.load(Ordering::SeqCst) {
            return Err(EngineError::Transfer("injected failure".to_string()));
        }
        if call == self.stall_on.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(EngineError::Cancelled);
        }
        self.inner.sync(request, cancel).await
    }
}
