//! Remote game server lifecycle.

pub mod controller;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::errors::Result;

pub use controller::{ControllerTimings, ServerStateController, StopMethod, StopReport, WaitOutcome};

/// Power state as reported by the panel. The panel owns it; we only observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Offline,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(ServerState::Offline),
            "starting" => Some(ServerState::Starting),
            "running" => Some(ServerState::Running),
            "stopping" => Some(ServerState::Stopping),
            _ => None,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Offline => "offline",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSignal {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerSignal::Start => "start",
            PowerSignal::Stop => "stop",
            PowerSignal::Restart => "restart",
            PowerSignal::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResources {
    pub state: ServerState,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub uptime_ms: u64,
}

/// Remote lifecycle API of the managed server.
#[async_trait]
pub trait LifecycleApi: Send + Sync {
    async fn get_resources(&self) -> Result<ServerResources>;

    async fn get_state(&self) -> Result<ServerState> {
        Ok(self.get_resources().await?.state)
    }

    async fn send_power(&self, signal: PowerSignal) -> Result<()>;

    /// Run a console command on the server.
    async fn send_command(&self, command: &str) -> Result<()>;
}
