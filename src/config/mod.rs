//! Configuration module
//!
//! Handles loading and saving bridge configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::bridge::{BridgeConfig, DeferralPolicy};
use crate::network::NetworkConfig as NetConfig;
use crate::protocol::{PacketKind, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Cluster connection settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// World-load gate settings
    #[serde(default)]
    pub gate: GateConfig,

    /// Runtime loop settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Server to join once connected (empty = lobby)
    pub join: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Cluster host
    #[serde(default = "default_host")]
    pub host: String,
    /// Cluster port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// World-load gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Packet kind that starts a world load
    #[serde(default = "default_map_change")]
    pub map_change: PacketKind,
    /// Which packets may pass while loading
    #[serde(default)]
    pub policy: DeferralPolicy,
}

fn default_map_change() -> PacketKind {
    PacketKind::MAP_CHANGE
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            map_change: default_map_change(),
            policy: DeferralPolicy::default(),
        }
    }
}

/// Headless runtime loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime ticks per second
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,
    /// Ticks before the runtime accepts server batches
    #[serde(default = "default_boot_ticks")]
    pub boot_ticks: u32,
    /// Deadline for cluster commands in ms
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

fn default_tick_rate() -> u32 {
    60
}

fn default_boot_ticks() -> u32 {
    1
}

fn default_command_timeout() -> u64 {
    10_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: default_tick_rate(),
            boot_ticks: default_boot_ticks(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("sourbridge/config.toml")),
            Some(PathBuf::from("./sourbridge.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn network_config(&self) -> NetConfig {
        NetConfig {
            host: self.network.host.clone(),
            port: self.network.port,
            connect_timeout_ms: self.network.connect_timeout_ms,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            map_change: Some(self.gate.map_change),
            policy: self.gate.policy.clone(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            verbose: false,
            join: Some("lobby".to_string()),
        },
        network: NetworkConfig {
            host: "sourga.me".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
