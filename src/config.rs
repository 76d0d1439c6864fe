//! Transport configuration module
//!
//! Handles loading and parsing of transport configuration from files and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Initial capacity of the server connection list
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Interval between polls in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Use DTLS towards the relay server
    #[serde(default)]
    pub secure: bool,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Loopback demo settings
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

/// Settings for the in-process loopback demo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Number of clients joining the host
    #[serde(default = "default_clients")]
    pub clients: usize,

    /// Number of ticks to run before shutting down (0 runs until Ctrl+C)
    #[serde(default = "default_run_ticks")]
    pub run_ticks: u64,
}

fn default_max_connections() -> usize {
    100
}

fn default_tick_rate() -> u64 {
    16
}

fn default_clients() -> usize {
    2
}

fn default_run_ticks() -> u64 {
    300
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            run_ticks: default_run_ticks(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/transport.toml"),
            max_connections: default_max_connections(),
            tick_rate_ms: default_tick_rate(),
            secure: false,
            debug: false,
            loopback: LoopbackConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("RELAY_TRANSPORT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/transport.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_TRANSPORT_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                self.max_connections = max;
            }
        }
        if let Ok(val) = env::var("RELAY_TRANSPORT_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("RELAY_TRANSPORT_SECURE") {
            self.secure = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("RELAY_TRANSPORT_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("RELAY_TRANSPORT_LOOPBACK_CLIENTS") {
            if let Ok(clients) = val.parse() {
                self.loopback.clients = clients;
            }
        }
        if let Ok(val) = env::var("RELAY_TRANSPORT_LOOPBACK_RUN_TICKS") {
            if let Ok(ticks) = val.parse() {
                self.loopback.run_ticks = ticks;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 || self.max_connections > 10000 {
            anyhow::bail!("Max connections must be between 1 and 10000");
        }

        if self.tick_rate_ms == 0 || self.tick_rate_ms > 1000 {
            anyhow::bail!("Tick rate must be between 1ms and 1000ms");
        }

        if self.loopback.clients == 0 || self.loopback.clients > 64 {
            anyhow::bail!("Loopback clients must be between 1 and 64");
        }

        Ok(())
    }
}
