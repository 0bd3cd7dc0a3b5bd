//! Configuration system for Learnify.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LEARNIFY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/learnify/config.toml
//!   3. ~/.config/learnify/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnifyConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub downloads: DownloadSettings,
    pub desktop: DesktopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertised instance name. Also the identity peers key us by.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Preferred transfer server port. Falls back to an OS-assigned port
    /// when busy.
    pub transfer_port: u16,
    /// UDP port advertisements are sent to and received on.
    pub announce_port: u16,
    /// IPv4 multicast group for advertisements.
    pub multicast_group: Ipv4Addr,
    pub announce_interval_secs: u64,
    /// A peer not heard from for this long is reported lost.
    pub peer_ttl_secs: u64,
    /// Ceiling for info/listing/metadata requests.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub max_concurrent: usize,
    pub max_retries: u32,
    /// Backoff before retry N is `retry_delays_ms[N-1]`, clamped to the last.
    pub retry_delays_ms: Vec<u64>,
    pub progress_throttle_ms: u64,
    /// Where video files and their metadata sidecars live.
    pub videos_dir: PathBuf,
    /// Where the persisted queue lives.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Paired desktop server, e.g. `http://192.168.1.10:8765`. Empty = not paired.
    pub server_url: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transfer_port: DEFAULT_PORT,
            announce_port: 53320,
            multicast_group: Ipv4Addr::new(239, 255, 77, 77),
            announce_interval_secs: 2,
            peer_ttl_secs: 10,
            request_timeout_secs: 10,
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 3,
            retry_delays_ms: vec![1_000, 3_000, 10_000],
            progress_throttle_ms: 250,
            videos_dir: data_dir().join("videos"),
            state_dir: data_dir().join("state"),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DownloadSettings {
    /// Delay before the given retry (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) - 1) as usize;
        let ms = self
            .retry_delays_ms
            .get(idx)
            .or_else(|| self.retry_delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
}

impl DesktopConfig {
    pub fn server_url(&self) -> Option<&str> {
        let url = self.server_url.trim();
        (!url.is_empty()).then_some(url)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn default_device_name() -> String {
    std::env::var("LEARNIFY_DEVICE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Learnify Device".to_string())
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("learnify")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("learnify")
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

impl LearnifyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LearnifyConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LEARNIFY_CONFIG")
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
            let text = toml::to_string_pretty(&LearnifyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LEARNIFY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LEARNIFY_DEVICE__NAME") {
            self.device.name = v;
        }
        if let Ok(v) = std::env::var("LEARNIFY_NETWORK__TRANSFER_PORT") {
            if let Ok(p) = v.parse() {
                self.network.transfer_port = p;
            }
        }
        if let Ok(v) = std::env::var("LEARNIFY_DOWNLOADS__MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.downloads.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("LEARNIFY_DOWNLOADS__VIDEOS_DIR") {
            self.downloads.videos_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LEARNIFY_DESKTOP__SERVER_URL") {
            self.desktop.server_url = v;
        }
    }
}
