//! Host configuration
//!
//! Loads `ws-hub.toml`. A missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::server::{
    ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_REQUEST_SIZE, DEFAULT_TELEMETRY_INTERVAL,
};
use crate::transport::WsTransportConfig;

/// Default configuration file name
pub const CONFIG_FILE: &str = "ws-hub.toml";

/// Default port
pub const DEFAULT_PORT: u16 = 9000;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Time allowed for reading the upgrade request, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Largest accepted upgrade request head, in bytes
    pub max_request_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

/// `[telemetry]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetrySection {
    /// Heartbeat period, in milliseconds
    pub interval_ms: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_TELEMETRY_INTERVAL.as_millis() as u64,
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: WsTransportConfig,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl HubConfig {
    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the transport does not validate itself
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.interval_ms must be non-zero".to_string(),
            ));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.handshake_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.server.max_request_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_request_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the server configuration
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.server.bind.clone(), self.server.port)
            .with_telemetry_interval(Duration::from_millis(self.telemetry.interval_ms))
            .with_transport(self.transport.clone());
        config.handshake_timeout = Duration::from_millis(self.server.handshake_timeout_ms);
        config.max_request_size = self.server.max_request_size;
        config
    }
}
