//! Configuration for the meshpix transport.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHPIX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshpix/config.toml
//!   3. ~/.config/meshpix/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, HEADER_LEN, MAX_FRAME, MAX_TOTAL_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshpixConfig {
    pub link: LinkConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Mesh port carrying both data chunks and control messages.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Frame size (header + data) used when fragmenting. Must be in
    /// (HEADER_LEN, MAX_FRAME].
    pub chunk_size: usize,
    /// Baseline inter-chunk delay in seconds.
    pub chunk_delay_secs: f64,
    /// Lower bound the adaptive controller may reach.
    pub min_chunk_delay_secs: f64,
    /// Upper bound the adaptive controller may reach.
    pub max_chunk_delay_secs: f64,
    /// Adjust the delay from the observed per-chunk success rate.
    pub adaptive: bool,
    /// Fast mode: pin the delay to the minimum and disable adaptation.
    pub fast: bool,
    /// Per-chunk link-layer retry budget.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt (3 s, 6 s, 12 s).
    pub initial_retry_delay_secs: f64,
    /// Attempt payload compression when it saves more than 5%.
    pub compress: bool,
    /// Floor for the post-send completion wait.
    pub ok_wait_floor_secs: u64,
    /// Ceiling for the post-send completion wait.
    pub ok_wait_ceil_secs: u64,
    /// Expected-duration multiplier for the completion wait.
    pub timeout_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// How often the stall sweeper walks the buffer table.
    pub stall_check_interval_secs: u64,
    /// Idle time after which missing chunks are requested.
    pub stall_request_timeout_secs: u64,
    /// Idle time after which an active transfer is marked timed out.
    /// Timed-out buffers are deleted after twice this.
    pub transfer_timeout_secs: u64,
    /// How long a completed transfer keeps answering late duplicates
    /// with a fresh OK.
    pub completed_retention_secs: u64,
    /// Upper bound on a reassembled (and decompressed) payload.
    pub max_payload_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshpixConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_secs: 4.0,
            min_chunk_delay_secs: 1.0,
            max_chunk_delay_secs: 10.0,
            adaptive: true,
            fast: false,
            max_retries: 3,
            initial_retry_delay_secs: 3.0,
            compress: true,
            ok_wait_floor_secs: 60,
            ok_wait_ceil_secs: 300,
            timeout_multiplier: 1.5,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            stall_check_interval_secs: 15,
            stall_request_timeout_secs: 20,
            transfer_timeout_secs: 60,
            completed_retention_secs: 300,
            max_payload_bytes: MAX_TOTAL_SIZE as usize,
        }
    }
}

// ── Duration helpers ──────────────────────────────────────────────────────────

impl SenderConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_retry_delay_secs)
    }
}

impl ReceiverConfig {
    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs)
    }

    pub fn stall_request_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_request_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

impl MeshpixConfig {
    /// Clamp out-of-range knobs into their permitted windows and reject
    /// settings the wire format cannot carry.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let s = &mut self.sender;
        if s.chunk_size <= HEADER_LEN || s.chunk_size > MAX_FRAME {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} outside ({}, {}]",
                s.chunk_size, HEADER_LEN, MAX_FRAME
            )));
        }
        if s.min_chunk_delay_secs <= 0.0 || s.min_chunk_delay_secs > s.max_chunk_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "chunk delay window [{}, {}] is empty",
                s.min_chunk_delay_secs, s.max_chunk_delay_secs
            )));
        }
        s.chunk_delay_secs = s
            .chunk_delay_secs
            .clamp(s.min_chunk_delay_secs, s.max_chunk_delay_secs);
        if s.ok_wait_floor_secs > s.ok_wait_ceil_secs {
            return Err(ConfigError::Invalid(format!(
                "ok_wait window [{}, {}] is empty",
                s.ok_wait_floor_secs, s.ok_wait_ceil_secs
            )));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshpix")
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshpixConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshpixConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHPIX_CONFIG")
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
            let text = toml::to_string_pretty(&MeshpixConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHPIX_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESHPIX_LINK__PORT") {
            if let Ok(p) = v.parse() {
                self.link.port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHPIX_SENDER__CHUNK_DELAY") {
            if let Ok(d) = v.parse() {
                self.sender.chunk_delay_secs = d;
            }
        }
        if let Ok(v) = std::env::var("MESHPIX_SENDER__ADAPTIVE") {
            self.sender.adaptive = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MESHPIX_SENDER__FAST") {
            self.sender.fast = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MESHPIX_SENDER__COMPRESS") {
            self.sender.compress = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MESHPIX_RECEIVER__TRANSFER_TIMEOUT") {
            if let Ok(t) = v.parse() {
                self.receiver.transfer_timeout_secs = t;
            }
        }
    }
}
