//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::UserIdMode;
use crate::relay::DEFAULT_BUFFER_SIZE;
use crate::telemetry::EmitPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub destination: DestinationMode,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

/// Relay listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Where accepted connections are relayed to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DestinationMode {
    /// Every connection goes to one fixed `host:port`
    Static { addr: String },
    /// Each client names its destination with a SOCKS4 CONNECT request
    Socks4 {
        #[serde(default)]
        user_id: UserIdMode,
    },
}

/// Telemetry feed configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub emit: EmitPolicy,
    /// Append one line per nonzero tick to this file
    pub log_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4567)),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for DestinationMode {
    fn default() -> Self {
        DestinationMode::Socks4 {
            user_id: UserIdMode::default(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9050)),
            interval: Duration::from_secs(1),
            emit: EmitPolicy::default(),
            log_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
