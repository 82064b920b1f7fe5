//! Configuration system for Veil.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VEIL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/veil/config.toml
//!   3. ~/.config/veil/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CommunityDiscoveryResult, CommunityId};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub directory: DirectoryConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the node id file. Auto-generated on first run.
    pub node_id_path: PathBuf,
    /// Local identity used when joining communities.
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the overlay listener binds to.
    pub listen_addr: String,
    /// TCP port for the overlay. 0 = OS-assigned.
    pub listen_port: u16,
    /// Loopback port for the local HTTP API.
    pub api_port: u16,
    /// Peers dialed on bootstrap, as host:port.
    pub bootstrap_peers: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Route all overlay traffic through the anonymizing proxy.
    pub anonymize: bool,
    /// SOCKS5 proxy of the anonymizing transport (e.g. a local onion router).
    pub socks_proxy: String,
    /// Upper bound for a single bootstrap attempt.
    pub bootstrap_timeout_ms: u64,
    /// Retries after the first failed attempt.
    pub bootstrap_retries: u32,
    pub bootstrap_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where published and fetched content is kept.
    pub storage_path: PathBuf,
    /// Retries for transient failures, after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// A stream read that stalls this long counts as a timeout.
    pub read_timeout_ms: u64,
    pub read_buffer_bytes: usize,
    /// Terminal operations kept for metrics.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Non-connected peers unseen for this long are evicted.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sliding window for transfer metrics.
    pub metrics_window_secs: u64,
    /// Computed snapshots are reused for this long.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub page_size: usize,
    /// Communities this node hosts and answers queries for.
    pub hosted: Vec<HostedCommunity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedCommunity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl HostedCommunity {
    pub fn to_result(&self, member_count: u64) -> CommunityDiscoveryResult {
        CommunityDiscoveryResult {
            community_id: CommunityId(self.id.clone()),
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            member_count,
            host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Durable settings file.
    pub settings_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id_path: config_dir().join("node_id"),
            alias: "anonymous".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 7420,
            api_port: 7421,
            bootstrap_peers: Vec::new(),
            heartbeat_interval_secs: 15,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            anonymize: true,
            socks_proxy: "127.0.0.1:9050".to_string(),
            bootstrap_timeout_ms: 30_000,
            bootstrap_retries: 3,
            bootstrap_backoff_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("content"),
            max_retries: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            read_timeout_ms: 20_000,
            read_buffer_bytes: 64 * 1024,
            history_capacity: 256,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            metrics_window_secs: 60,
            debounce_ms: 250,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            hosted: Vec::new(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            settings_path: config_dir().join("settings.json"),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl TransportConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn bootstrap_backoff(&self) -> Duration {
        Duration::from_millis(self.bootstrap_backoff_ms)
    }
}

impl TransferConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl RegistryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl HealthConfig {
    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("veil")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("veil")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VeilConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            VeilConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VEIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VeilConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VEIL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Split out so tests do not have
    /// to touch the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("VEIL_TRANSPORT__ANONYMIZE") {
            self.transport.anonymize = flag(v);
        }
        if let Some(v) = lookup("VEIL_TRANSPORT__SOCKS_PROXY") {
            self.transport.socks_proxy = v;
        }
        if let Some(p) = lookup("VEIL_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(p) = lookup("VEIL_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = lookup("VEIL_NETWORK__BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = lookup("VEIL_TRANSFER__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.transfer.max_retries = n;
        }
        if let Some(v) = lookup("VEIL_TRANSFER__STORAGE_PATH") {
            self.transfer.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VEIL_IDENTITY__ALIAS") {
            self.identity.alias = v;
        }
    }
}
