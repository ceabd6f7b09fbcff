//! Configuration management for the world backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Validation is a pure function over the parsed structure and runs once at load.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use crate::utils::errors::{EngineError, Result};

/// Environment variable that overrides `server.api_key`.
pub const API_KEY_ENV: &str = "WORLD_BACKUP_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Panel base URL (Pterodactyl client API)
    pub panel_url: String,

    /// Client API key
    #[serde(default)]
    pub api_key: String,

    /// Short server identifier as shown in the panel
    pub server_id: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Console command that makes the server persist its world
    #[serde(default = "default_flush_command")]
    pub flush_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Live server directory
    pub live_dir: PathBuf,

    /// Sub-trees of `live_dir` to back up; empty means the whole directory
    #[serde(default)]
    pub sub_trees: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Rsync,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Cron expressions (5, 6 or 7 fields)
    #[serde(default)]
    pub schedules: Vec<String>,

    #[serde(default = "default_sync_method")]
    pub sync_method: SyncMethod,

    #[serde(default = "default_rsync_path")]
    pub rsync_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityModelKind {
    Filesystem,
    Quota,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_capacity_model")]
    pub capacity_model: CapacityModelKind,

    /// Quota size in GiB, required for the quota model
    #[serde(default)]
    pub max_backup_size_gb: Option<f64>,

    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,

    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_flush_settle")]
    pub flush_settle_secs: u64,
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop_secs: u64,
    #[serde(default = "default_forced_stop")]
    pub forced_stop_secs: u64,
    #[serde(default = "default_start")]
    pub start_secs: u64,
    #[serde(default = "default_startup_monitor")]
    pub startup_monitor_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_audit_retention")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Discord-compatible webhook; notifications are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    #[serde(default = "default_api_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub show_targets: bool,

    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

// Default values
fn default_request_timeout() -> u64 {
    30
}

fn default_flush_command() -> String {
    "save-all".to_string()
}

fn default_retention_days() -> u32 {
    14
}

fn default_sync_method() -> SyncMethod {
    SyncMethod::Rsync
}

fn default_rsync_path() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_capacity_model() -> CapacityModelKind {
    CapacityModelKind::Filesystem
}

fn default_warning_percent() -> f64 {
    80.0
}

fn default_critical_percent() -> f64 {
    95.0
}

fn default_check_interval() -> u64 {
    300
}

fn default_flush_settle() -> u64 {
    5
}

fn default_graceful_stop() -> u64 {
    60
}

fn default_forced_stop() -> u64 {
    30
}

fn default_start() -> u64 {
    60
}

fn default_startup_monitor() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    2
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("/var/log/world-backup")
}

fn default_audit_retention() -> u32 {
    90
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> String {
    "127.0.0.1:9980".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_model: default_capacity_model(),
            max_backup_size_gb: None,
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            flush_settle_secs: default_flush_settle(),
            graceful_stop_secs: default_graceful_stop(),
            forced_stop_secs: default_forced_stop(),
            start_secs: default_start(),
            startup_monitor_secs: default_startup_monitor(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: default_audit_dir(),
            retention_days: default_audit_retention(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_targets: false,
            ansi: default_ansi(),
        }
    }
}

impl Config {
    /// Parse a TOML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| EngineError::Configuration(vec![format!("{}: {e}", path.display())]))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        let violations = validate(&config);
        if !violations.is_empty() {
            return Err(EngineError::Configuration(violations));
        }
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.server.api_key = key;
            }
        }
    }

    /// Directories that make up one backup, relative to the live dir.
    /// An empty list stands for the live directory itself.
    pub fn sub_trees(&self) -> Vec<String> {
        self.source.sub_trees.clone()
    }

    /// Quota in bytes when the quota model is selected.
    pub fn quota_bytes(&self) -> Option<u64> {
        self.storage
            .max_backup_size_gb
            .map(|gb| (gb * 1024.0 * 1024.0 * 1024.0) as u64)
    }
}

/// Check every rule and return all violations; an empty list means valid.
pub fn validate(config: &Config) -> Vec<String> {
    let mut errors = Vec::new();

    if !is_http_url(&config.server.panel_url) {
        errors.push("server.panel_url must start with http:// or https://".to_string());
    }
    if config.server.api_key.trim().is_empty() {
        errors.push(format!("server.api_key is required (or set {API_KEY_ENV})"));
    }
    if config.server.server_id.trim().is_empty() {
        errors.push("server.server_id is required".to_string());
    }
    if config.server.request_timeout_secs == 0 {
        errors.push("server.request_timeout_secs must be at least 1".to_string());
    }
    if config.server.flush_command.trim().is_empty() {
        errors.push("server.flush_command must not be empty".to_string());
    }

    let live = &config.source.live_dir;
    let backups = &config.backup.backup_dir;
    if live.as_os_str().is_empty() {
        errors.push("source.live_dir is required".to_string());
    }
    if backups.as_os_str().is_empty() {
        errors.push("backup.backup_dir is required".to_string());
    }
    if !live.as_os_str().is_empty() && !backups.as_os_str().is_empty() {
        if live == backups {
            errors.push("backup.backup_dir must differ from source.live_dir".to_string());
        } else if backups.starts_with(live) {
            errors.push("backup.backup_dir must not be inside source.live_dir".to_string());
        }
    }
    for tree in &config.source.sub_trees {
        if !is_plain_relative(tree) {
            errors.push(format!(
                "source.sub_trees entry '{tree}' must be a plain relative directory name"
            ));
        }
    }

    if config.backup.retention_days < 1 {
        errors.push("backup.retention_days must be at least 1".to_string());
    }
    for schedule in &config.backup.schedules {
        if let Err(reason) = check_cron(schedule) {
            errors.push(format!("backup.schedules entry '{schedule}' is invalid: {reason}"));
        }
    }
    if config.backup.rsync_path.as_os_str().is_empty() {
        errors.push("backup.rsync_path must not be empty".to_string());
    }

    let storage = &config.storage;
    for (name, value) in [
        ("warning_percent", storage.warning_percent),
        ("critical_percent", storage.critical_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            errors.push(format!("storage.{name} must be between 0 and 100"));
        }
    }
    if storage.warning_percent >= storage.critical_percent {
        errors.push("storage.warning_percent must be lower than storage.critical_percent".to_string());
    }
    if storage.capacity_model == CapacityModelKind::Quota {
        match storage.max_backup_size_gb {
            Some(gb) if gb > 0.0 => {}
            _ => errors.push(
                "storage.max_backup_size_gb must be greater than 0 for the quota model".to_string(),
            ),
        }
    }
    if storage.check_interval_secs == 0 {
        errors.push("storage.check_interval_secs must be at least 1".to_string());
    }

    let t = &config.timeouts;
    for (name, value) in [
        ("graceful_stop_secs", t.graceful_stop_secs),
        ("forced_stop_secs", t.forced_stop_secs),
        ("start_secs", t.start_secs),
        ("startup_monitor_secs", t.startup_monitor_secs),
        ("poll_interval_secs", t.poll_interval_secs),
    ] {
        if value == 0 {
            errors.push(format!("timeouts.{name} must be at least 1"));
        }
    }

    if config.audit.retention_days < 1 {
        errors.push("audit.retention_days must be at least 1".to_string());
    }
    if let Some(url) = &config.notify.webhook_url {
        if !is_http_url(url) {
            errors.push("notify.webhook_url must start with http:// or https://".to_string());
        }
    }
    if config.api.bind.parse::<SocketAddr>().is_err() {
        errors.push(format!("api.bind '{}' is not a socket address", config.api.bind));
    }

    errors
}

/// Expand a 5-field cron expression to the 6-field form (seconds first).
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

fn check_cron(expr: &str) -> std::result::Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if !(5..=7).contains(&fields.len()) {
        return Err(format!("expected 5 to 7 fields, got {}", fields.len()));
    }
    for field in fields {
        let ok = field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?' | '#'));
        if !ok {
            return Err(format!("unexpected character in field '{field}'"));
        }
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    (url.starts_with("http://") && url.len() > "http://".len())
        || (url.starts_with("https://") && url.len() > "https://".len())
}

fn is_plain_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
