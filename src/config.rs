// config.rs

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::task::{Pattern, Task, DEFAULT_CLIENT_QUEUE_SIZE};

fn default_nodes() -> Vec<String> {
    vec!["127.0.0.1:8002".to_string()]
}
fn default_local_limit() -> String {
    "20M".to_string()
}
fn default_min_rate() -> String {
    "64K".to_string()
}
fn default_timeout_secs() -> u64 {
    // 0 = derive from the file length.
    0
}
fn default_client_queue_size() -> usize {
    DEFAULT_CLIENT_QUEUE_SIZE
}
fn default_peer_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid rate {0:?}")]
    InvalidRate(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupernodeConfig {
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
}

impl Default for SupernodeConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_local_limit")]
    pub local_limit: String,
    #[serde(default = "default_min_rate")]
    pub min_rate: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,
    #[serde(default)]
    pub not_back_source: bool,
    #[serde(default)]
    pub pattern: Pattern,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            local_limit: default_local_limit(),
            min_rate: default_min_rate(),
            timeout_secs: default_timeout_secs(),
            client_queue_size: default_client_queue_size(),
            not_back_source: false,
            pattern: Pattern::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_peer_ip")]
    pub ip: String,
    /// Port of the local upload server announced on registration.
    #[serde(default)]
    pub port: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ip: default_peer_ip(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supernode: SupernodeConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

impl Config {
    /// Reads `path`, or returns the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Builds a task for `url` from the configured defaults.
    pub fn task(&self, url: &str, target: &Path) -> Result<Task, ConfigError> {
        let mut task = Task::new(url, target).with_peer(self.peer.ip.clone(), self.peer.port);
        task.local_limit = parse_rate(&self.download.local_limit)?;
        task.min_rate = parse_rate(&self.download.min_rate)?;
        task.timeout = Duration::from_secs(self.download.timeout_secs);
        task.client_queue_size = self.download.client_queue_size;
        task.not_back_source = self.download.not_back_source;
        task.pattern = self.download.pattern;
        Ok(task)
    }
}

/// Parses a rate such as `20M` or `512k` into bytes per second.
/// A bare number is taken as bytes.
pub fn parse_rate(raw: &str) -> Result<u64, ConfigError> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidRate(raw.to_string());
    let (digits, unit) = match raw.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&raw[..i], c),
        Some(_) => (raw, 'B'),
        None => return Err(invalid()),
    };
    let multiplier: u64 = match unit {
        'G' | 'g' => 1024 * 1024 * 1024,
        'M' | 'm' => 1024 * 1024,
        'K' | 'k' => 1024,
        'B' | 'b' => 1,
        _ => return Err(invalid()),
    };
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) DFGET_LOG
    // 3) general.log_level
    // 4) info
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var("DFGET_LOG").ok())
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
