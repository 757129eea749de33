//! Configuration system for ubus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ubus/config.toml
//!   3. ~/.config/ubus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{API_VERSION, DEFAULT_MASTER_PORT, DEFAULT_MAX_FRAME};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UbusConfig {
    pub master: MasterConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the control port binds to.
    pub bind_ip: String,
    pub port: u16,
    /// Version participants must present in INITIATION.
    pub api_version: String,
    /// Watchdog period. Runtimes should send keep-alives at least this often.
    pub keep_alive_interval_ms: u64,
    /// Missed keep-alive periods before a participant is reaped.
    pub watchdog_threshold: u32,
    /// Control loop reconciliation period.
    pub tick_ms: u64,
    /// Once a frame header arrives, its payload must follow within this.
    pub frame_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub master_ip: String,
    pub master_port: u16,
    pub keep_alive_interval_ms: u64,
    /// Bounds every control request, the peer handshake, and method calls.
    pub request_timeout_ms: u64,
    /// Bounds connects to the master and to peers.
    pub connect_timeout_ms: u64,
    pub tick_ms: u64,
    pub max_frame_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: DEFAULT_MASTER_PORT,
            api_version: API_VERSION.to_string(),
            keep_alive_interval_ms: 1000,
            watchdog_threshold: 3,
            tick_ms: 100,
            frame_timeout_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            master_ip: "127.0.0.1".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            keep_alive_interval_ms: 1000,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3000,
            tick_ms: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl MasterConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl RuntimeConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("ubus")
}

fn home_dir() -> PathBuf {
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

impl UbusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            UbusConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("UBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&UbusConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply UBUS_* overrides. `lookup` is `std::env::var` outside tests.
    /// Unparseable numbers are ignored.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("UBUS_MASTER__BIND_IP") {
            self.master.bind_ip = v;
        }
        if let Some(p) = lookup("UBUS_MASTER__PORT").and_then(|v| v.parse().ok()) {
            self.master.port = p;
        }
        if let Some(ms) = lookup("UBUS_MASTER__KEEP_ALIVE_INTERVAL_MS").and_then(|v| v.parse().ok())
        {
            self.master.keep_alive_interval_ms = ms;
        }
        if let Some(v) = lookup("UBUS_RUNTIME__MASTER_IP") {
            self.runtime.master_ip = v;
        }
        if let Some(p) = lookup("UBUS_RUNTIME__MASTER_PORT").and_then(|v| v.parse().ok()) {
            self.runtime.master_port = p;
        }
        if let Some(ms) =
            lookup("UBUS_RUNTIME__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.runtime.request_timeout_ms = ms;
        }
    }
}
