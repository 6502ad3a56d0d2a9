//! Configuration system for mbt.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MBT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mbt/config.toml
//!   3. ~/.config/mbt/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::timeout::BLOCK_RETRIES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MbtConfig {
    pub blob_client: BlobClientConfig,
    pub blob_server: BlobServerConfig,
    pub dfu: DfuConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobClientConfig {
    /// Send attempts per broadcast step before silent targets are dropped.
    pub block_retries: u8,
    /// Pause after each chunk, in milliseconds.
    pub chunk_interval_ms: u64,
    /// Largest chunk the client will send.
    pub max_chunk_size: u16,
    /// Most chunks per block the client can track.
    pub max_chunks: u16,
    /// MTU advertised in Transfer Start.
    pub mtu_size: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobServerConfig {
    pub block_size_log_min: u8,
    pub block_size_log_max: u8,
    pub max_chunks: u16,
    pub max_chunk_size: u16,
    /// Largest BLOB accepted, in bytes.
    pub max_blob_size: u32,
    pub mtu_size: u16,
    /// Transfer modes offered, bitmask of Push (1) and Pull (2).
    pub modes: u8,
    /// Chunks requested per Pull-mode report.
    pub pull_req_count: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    pub fwid_max: usize,
    pub metadata_max: usize,
    pub uri_max: usize,
    /// Distribution slots kept by a slot store.
    pub slot_max: usize,
    /// Wait for a single-target request before reporting a timeout, ms.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of simulated target nodes.
    pub targets: u16,
    /// Group address the targets subscribe to. 0 = unicast only.
    pub group: u16,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
    /// Chance in percent that a frame is lost in flight.
    pub loss_percent: u8,
    /// Use Pull mode instead of Push.
    pub pull: bool,
    /// Image to distribute. Empty = generate one of `image_size` bytes.
    pub image_path: PathBuf,
    pub image_size: u32,
    /// Directory for persisted server and slot state.
    pub state_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BlobClientConfig {
    fn default() -> Self {
        Self {
            block_retries: BLOCK_RETRIES,
            chunk_interval_ms: 0,
            max_chunk_size: 377,
            max_chunks: 256,
            mtu_size: 384,
        }
    }
}

impl Default for BlobServerConfig {
    fn default() -> Self {
        Self {
            block_size_log_min: 6,
            block_size_log_max: 12,
            max_chunks: 256,
            max_chunk_size: 377,
            max_blob_size: 524_288,
            mtu_size: 384,
            modes: 0x03,
            pull_req_count: 4,
        }
    }
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            fwid_max: 106,
            metadata_max: 255,
            uri_max: 255,
            slot_max: 8,
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            targets: 3,
            group: 0xc000,
            app_idx: 0,
            ttl: 7,
            timeout_base: 0,
            loss_percent: 0,
            pull: false,
            image_path: PathBuf::new(),
            image_size: 16 * 1024,
            state_dir: data_dir().join("state"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mbt")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("mbt")
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

impl MbtConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MbtConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MBT_CONFIG")
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
            let text = toml::to_string_pretty(&MbtConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MBT_* overrides. `lookup` stands in for the process environment.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }

        if let Some(v) = parsed(lookup("MBT_BLOB_CLIENT__BLOCK_RETRIES")) {
            self.blob_client.block_retries = v;
        }
        if let Some(v) = parsed(lookup("MBT_BLOB_CLIENT__CHUNK_INTERVAL_MS")) {
            self.blob_client.chunk_interval_ms = v;
        }
        if let Some(v) = parsed(lookup("MBT_BLOB_SERVER__BLOCK_SIZE_LOG_MAX")) {
            self.blob_server.block_size_log_max = v;
        }
        if let Some(v) = parsed(lookup("MBT_SIM__TARGETS")) {
            self.sim.targets = v;
        }
        if let Some(v) = parsed(lookup("MBT_SIM__LOSS_PERCENT")) {
            self.sim.loss_percent = v;
        }
        if let Some(v) = parsed(lookup("MBT_SIM__TIMEOUT_BASE")) {
            self.sim.timeout_base = v;
        }
        if let Some(v) = lookup("MBT_SIM__PULL") {
            self.sim.pull = v == "true" || v == "1";
        }
        if let Some(v) = lookup("MBT_SIM__IMAGE_PATH") {
            self.sim.image_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MBT_SIM__STATE_DIR") {
            self.sim.state_dir = PathBuf::from(v);
        }
    }
}
