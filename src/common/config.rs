//! Configuration file handling

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Default target address
    #[serde(default)]
    pub target: TargetConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Wire protocol limits
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Front-end polling cadence
    #[serde(default)]
    pub poll: PollConfig,
}

/// Where the script VM listens for the debugger
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1337
}

/// Timeout settings
#[derive(Debug, Deserialize)]
pub struct Timeouts {
    /// TCP connect timeout
    #[serde(default = "default_connect")]
    pub connect_secs: u64,

    /// How long the target has to answer the initial thread list request
    #[serde(default = "default_initial_sync")]
    pub initial_sync_secs: u64,

    /// Per-command write timeout
    #[serde(default = "default_send")]
    pub send_millis: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect(),
            initial_sync_secs: default_initial_sync(),
            send_millis: default_send(),
        }
    }
}

fn default_connect() -> u64 {
    5
}
fn default_initial_sync() -> u64 {
    5
}
fn default_send() -> u64 {
    1000
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest payload accepted in either direction
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

/// Polling cadence for front-ends that drive `update()` from a timer
#[derive(Debug, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_millis: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_millis: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    50
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Interval between `update()` calls in the CLI front-end
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_millis.max(1))
    }
}
