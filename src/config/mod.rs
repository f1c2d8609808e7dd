use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Remote telemetry API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Raw `Cookie` header value forwarded with every request
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay before each retry; the number of entries is the retry count
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_client_id() -> String {
    format!("sessiontap/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![1_000, 2_000, 5_000]
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            cookies: None,
            client_id: default_client_id(),
            timeout_secs: default_timeout_secs(),
            retry_delays_ms: default_retry_delays_ms(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
    /// Active sessions without any activity for this long are closed as `recovered`
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    120
}

fn default_stale_after_hours() -> u64 {
    24
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sync_interval(),
            dry_run: false,
            stale_after_hours: default_stale_after_hours(),
        }
    }
}

/// Timing knobs for correlation and the incremental watch loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    /// Used when the agent adapter does not specify its own settle delay
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_correlation_attempts")]
    pub correlation_attempts: u32,
    #[serde(default = "default_correlation_retry_delay_ms")]
    pub correlation_retry_delay_ms: u64,
    /// Double the retry delay after each failed round
    #[serde(default)]
    pub correlation_backoff: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_debounce_ms() -> u64 {
    5_000
}

fn default_discovery_interval() -> u64 {
    30
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_correlation_attempts() -> u32 {
    5
}

fn default_correlation_retry_delay_ms() -> u64 {
    1_000
}

fn default_idle_timeout() -> u64 {
    300
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            discovery_interval_secs: default_discovery_interval(),
            settle_delay_ms: default_settle_delay_ms(),
            correlation_attempts: default_correlation_attempts(),
            correlation_retry_delay_ms: default_correlation_retry_delay_ms(),
            correlation_backoff: false,
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl MonitoringConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the per-user data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

pub fn config_dir() -> Result<PathBuf> {
    let dir = directories::ProjectDirs::from("", "", "sessiontap")
        .context("Could not determine config directory")?
        .config_dir()
        .to_path_buf();
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Root for session records and telemetry streams.
pub fn data_dir(config: &Config) -> Result<PathBuf> {
    if let Some(dir) = &config.storage.data_dir {
        return Ok(dir.clone());
    }
    let dir = directories::ProjectDirs::from("", "", "sessiontap")
        .context("Could not determine data directory")?
        .data_dir()
        .to_path_buf();
    Ok(dir)
}

/// Load configuration; a missing file yields defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Credentials and storage location may come from the environment.
///
/// Sync toggles are read once by `sync::SyncSettings::resolve` instead.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(token) = var("SESSIONTAP_API_TOKEN").filter(|t| !t.is_empty()) {
        config.api.token = Some(token);
    }
    if let Some(url) = var("SESSIONTAP_API_URL").filter(|u| !u.is_empty()) {
        config.api.base_url = url;
    }
    if let Some(dir) = var("SESSIONTAP_DATA_DIR").filter(|d| !d.is_empty()) {
        config.storage.data_dir = Some(PathBuf::from(dir));
    }
}

/// Parse a boolean-ish environment value ("1", "true", "yes", "on").
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
