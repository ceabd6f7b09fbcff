use anyhow::Context;
use backup_engine::config::{validate, Config};
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "WORLD_BACKUP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/world-backup/config.toml";

/// `--config` wins over `WORLD_BACKUP_CONFIG`, then the default path.
pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load `.env`, then read and validate the configuration file.
pub fn load(cli: Option<PathBuf>) -> anyhow::Result<(PathBuf, Config)> {
    let _ = dotenvy::dotenv();
    let path = resolve_path(cli);
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Ok((path, config))
}

/// Every violation of the file at `path`, without failing on the first.
pub fn check(path: &Path) -> anyhow::Result<Vec<String>> {
    let _ = dotenvy::dotenv();
    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
    config.apply_env_overrides();
    Ok(validate(&config))
}
