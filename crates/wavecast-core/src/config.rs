//! Configuration system for Wavecast
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/wavecast/config.toml
//! - Linux: ~/.config/wavecast/config.toml
//! - Windows: %APPDATA%/wavecast/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DEFAULT_SIGNAL_PORT, DEFAULT_SIGNAL_URL, DEFAULT_STUN_SERVER};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling server settings
    pub signal: SignalConfig,
    /// Host/client session settings
    pub session: SessionConfig,
    /// Native UDP fallback settings
    pub native: NativeConfig,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Ping interval; peers silent for a whole interval are dropped
    pub heartbeat_interval_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIGNAL_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            heartbeat_interval_secs: 30,
        }
    }
}

impl SignalConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Host/client session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling URL used when a start call leaves it blank
    pub signaling_url: String,
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Host clock beacon period (milliseconds)
    pub clock_beacon_interval_ms: u64,
    /// Lead time added to `sync-start` for a newly opened channel (milliseconds)
    pub sync_lead_ms: i64,
    /// Client transport stats poll period (milliseconds)
    pub stats_interval_ms: u64,
    /// Signaling connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNAL_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            clock_beacon_interval_ms: 2500,
            sync_lead_ms: 1200,
            stats_interval_ms: 1500,
            connect_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn clock_beacon_interval(&self) -> Duration {
        Duration::from_millis(self.clock_beacon_interval_ms.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Native UDP fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// UDP port shared by host and client
    pub port: u16,
    /// PCM sample rate
    pub sample_rate: u32,
    /// PCM channel count (1 or 2)
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_size: u16,
    /// Frames held by the client before playout
    pub jitter_frames: usize,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            port: 5052,
            sample_rate: 48_000,
            channels: 2,
            frame_size: 960,
            jitter_frames: 3,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "wavecast", "wavecast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
