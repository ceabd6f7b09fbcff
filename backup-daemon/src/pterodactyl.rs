//! Pterodactyl client API as the engine's lifecycle port.

use anyhow::Context;
use async_trait::async_trait;
use backup_engine::config::ServerConfig;
use backup_engine::server::{LifecycleApi, PowerSignal, ServerResources, ServerState};
use backup_engine::{EngineError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct ResourcesResponse {
    attributes: ResourceAttributes,
}

#[derive(Deserialize)]
struct ResourceAttributes {
    current_state: String,
    #[serde(default)]
    resources: ResourceUsage,
}

#[derive(Deserialize, Default)]
struct ResourceUsage {
    #[serde(default)]
    memory_bytes: u64,
    #[serde(default)]
    cpu_absolute: f64,
    #[serde(default)]
    disk_bytes: u64,
    #[serde(default)]
    uptime: u64,
}

/// Decode a `GET /resources` body.
pub fn parse_resources(body: &str) -> Result<ServerResources> {
    let response: ResourcesResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::Remote(format!("unexpected resources payload: {e}")))?;
    let attributes = response.attributes;
    let state = ServerState::parse(&attributes.current_state).ok_or_else(|| {
        EngineError::Remote(format!("unknown server state '{}'", attributes.current_state))
    })?;
    Ok(ServerResources {
        state,
        cpu_percent: attributes.resources.cpu_absolute,
        memory_bytes: attributes.resources.memory_bytes,
        disk_bytes: attributes.resources.disk_bytes,
        uptime_ms: attributes.resources.uptime,
    })
}

pub struct PterodactylClient {
    client: reqwest::Client,
    base_url: String,
    server_id: String,
}

impl PterodactylClient {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("API key is not a valid header value")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.panel_url.trim_end_matches('/').to_string(),
            server_id: config.server_id.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/client/servers/{}/{endpoint}",
            self.base_url, self.server_id
        )
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<()> {
        self.client
            .post(self.url(endpoint))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| remote(endpoint, e))?;
        Ok(())
    }
}

fn remote(endpoint: &str, err: reqwest::Error) -> EngineError {
    EngineError::Remote(format!("{endpoint}: {err}"))
}

#[async_trait]
impl LifecycleApi for PterodactylClient {
    async fn get_resources(&self) -> Result<ServerResources> {
        let body = self
            .client
            .get(self.url("resources"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| remote("resources", e))?
            .text()
            .await
            .map_err(|e| remote("resources", e))?;
        parse_resources(&body)
    }

    async fn send_power(&self, signal: PowerSignal) -> Result<()> {
        debug!(signal = signal.as_str(), "Sending power signal");
        self.post("power", json!({ "signal": signal.as_str() })).await
    }

    async fn send_command(&self, command: &str) -> Result<()> {
        debug!(command = %command, "Sending console command");
        self.post("command", json!({ "command": command })).await
    }
}
