//! Configuration resolution for Fluxgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/fluxgate/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`FLUXGATE_*`)
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Fluxgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// Listener, storage, and observer-auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    /// HMAC secret used to verify observer tokens.
    pub jwt_secret: String,
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6365".to_string(),
            database_path: None,
            jwt_secret: "dev-secret-change-me".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Agent RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Deadline for a single correlated call (seconds).
    pub rpc_timeout_secs: u64,
    /// Outbound frame buffer per node connection.
    pub outbound_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: 10,
            outbound_buffer: 256,
        }
    }
}

/// Traffic ingestion, flush, and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub flush_interval_secs: u64,
    /// Bounded ingestion queue; reports beyond this are dropped.
    pub queue_capacity: usize,
    /// Hourly ledger rows older than this are pruned.
    pub retention_days: u32,
    /// Local hour (0-23) at which the daily reset/expiry sweep runs.
    pub daily_sweep_hour: u32,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
            queue_capacity: 2000,
            retention_days: 30,
            daily_sweep_hour: 0,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fluxgate").join("settings.json"))
}

/// Default on-disk location of the panel database.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("fluxgate").join("panel.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.server.database_path.is_some() {
        base.server.database_path = overlay.server.database_path;
    }
    base.server.listen_addr = overlay.server.listen_addr;
    base.server.jwt_secret = overlay.server.jwt_secret;
    base.server.log_level = overlay.server.log_level;
    base.server.log_json = overlay.server.log_json;

    base.agent = overlay.agent;
    base.traffic = overlay.traffic;
}

/// Apply `FLUXGATE_*` overrides read through `lookup`.
///
/// Unparseable numeric values are ignored and the previous value is kept.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("FLUXGATE_LISTEN_ADDR") {
        config.server.listen_addr = val;
    }
    if let Some(val) = lookup("FLUXGATE_DATABASE_PATH") {
        config.server.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FLUXGATE_JWT_SECRET") {
        config.server.jwt_secret = val;
    }
    if let Some(val) = lookup("FLUXGATE_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("FLUXGATE_LOG_JSON") {
        config.server.log_json = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Some(n) = lookup("FLUXGATE_RPC_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.agent.rpc_timeout_secs = n;
    }
    if let Some(n) = lookup("FLUXGATE_FLUSH_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.traffic.flush_interval_secs = n;
    }
    if let Some(n) = lookup("FLUXGATE_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.traffic.queue_capacity = n;
    }
    if let Some(n) = lookup("FLUXGATE_RETENTION_DAYS").and_then(|v| v.parse().ok()) {
        config.traffic.retention_days = n;
    }
    if let Some(n) = lookup("FLUXGATE_DAILY_SWEEP_HOUR")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|h| *h < 24)
    {
        config.traffic.daily_sweep_hour = n;
    }
}
