//! Configuration structures.
//!
//! Configuration is loaded from an optional JSON file and overridden by CLI
//! flags / environment variables in the server binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};

/// Global gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Invocation bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Session front configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Watch source configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Backend substrate configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(Error::validation("server.listen_addr cannot be empty"));
        }
        if self.bridge.max_timeout.is_zero() {
            return Err(Error::validation("bridge.max_timeout must be positive"));
        }
        if self.session.channel_capacity == 0 {
            return Err(Error::validation("session.channel_capacity must be positive"));
        }
        if self.watch.resync_period.is_zero() {
            return Err(Error::validation("watch.resync_period must be positive"));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen_addr: String,

    /// Namespace scope to watch. Empty means every namespace.
    pub namespace: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            namespace: String::new(),
        }
    }
}

/// Invocation bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Timeout used when neither the caller nor the function record provides one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Upper bound applied to every resolved timeout.
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(600),
        }
    }
}

/// Session front configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// SSE keep-alive comment interval.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Bounded queue of outbound messages per session.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            channel_capacity: 64,
        }
    }
}

/// Watch source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Resource manifest read by the file-backed watch source.
    pub manifest: Option<PathBuf>,

    /// How often the manifest is re-read and diffed.
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            manifest: None,
            resync_period: Duration::from_secs(30),
        }
    }
}

/// Backend substrate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the HTTP function gateway. When unset, only the in-process
    /// bus substrate is available.
    pub base_url: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable JSON log formatting.
    pub json_logs: bool,
}
