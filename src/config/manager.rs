//! Configuration Manager

use super::{Config, DestinationMode};
use crate::protocol::UserIdMode;
use crate::telemetry::EmitPolicy;
use crate::Result;
use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::net::SocketAddr;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::load_from_str(&content)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)
            .context("Failed to parse configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        // Override with environment variables if present
        if let Ok(bind_addr) = std::env::var("PROXYLOG_BIND_ADDR") {
            config.server.bind_addr = bind_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid PROXYLOG_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(telemetry_addr) = std::env::var("PROXYLOG_TELEMETRY_ADDR") {
            config.telemetry.bind_addr = telemetry_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid PROXYLOG_TELEMETRY_ADDR: {}", telemetry_addr))?;
        }

        if let Ok(destination) = std::env::var("PROXYLOG_DESTINATION") {
            config.destination = DestinationMode::Static { addr: destination };
        }

        if let Ok(buffer_size) = std::env::var("PROXYLOG_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size.parse::<usize>()
                .with_context(|| format!("Invalid PROXYLOG_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(timeout) = std::env::var("PROXYLOG_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PROXYLOG_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_file) = std::env::var("PROXYLOG_LOG_FILE") {
            config.telemetry.log_file = Some(PathBuf::from(log_file));
        }

        if let Ok(log_level) = std::env::var("PROXYLOG_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line; `None` keeps the loaded value
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub telemetry_bind: Option<String>,
    pub to: Option<String>,
    pub user_id_mode: Option<UserIdMode>,
    pub emit: Option<EmitPolicy>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub buffer_size: Option<usize>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_destination_config()
            .context("Destination configuration validation failed")?;

        self.validate_telemetry_config()
            .context("Telemetry configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_destination_config(&self) -> Result<()> {
        if let DestinationMode::Static { addr } = &self.destination {
            let (host, port) = addr.rsplit_once(':')
                .with_context(|| format!("Static destination '{}' must be host:port", addr))?;

            if host.is_empty() {
                bail!("Static destination '{}' has an empty host", addr);
            }

            port.parse::<u16>()
                .with_context(|| format!("Static destination '{}' has an invalid port", addr))?;
        }

        Ok(())
    }

    fn validate_telemetry_config(&self) -> Result<()> {
        if self.telemetry.interval.is_zero() {
            bail!("telemetry.interval must be greater than 0");
        }

        if self.telemetry.interval.as_secs() > 3600 {
            bail!("telemetry.interval cannot exceed 1 hour");
        }

        if self.telemetry.enabled && self.telemetry.bind_addr == self.server.bind_addr {
            bail!("telemetry.bind_addr must differ from server.bind_addr");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) -> Result<()> {
        if let Some(bind) = &overrides.bind {
            self.server.bind_addr = bind.parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", bind))?;
            tracing::info!("CLI override: bind address set to {}", self.server.bind_addr);
        }

        if let Some(bind) = &overrides.telemetry_bind {
            self.telemetry.bind_addr = bind.parse::<SocketAddr>()
                .with_context(|| format!("Invalid telemetry address: {}", bind))?;
            tracing::info!("CLI override: telemetry address set to {}", self.telemetry.bind_addr);
        }

        if let Some(to) = &overrides.to {
            self.destination = DestinationMode::Static { addr: to.clone() };
            tracing::info!("CLI override: static destination set to {}", to);
        } else if let Some(mode) = overrides.user_id_mode {
            self.destination = DestinationMode::Socks4 { user_id: mode };
            tracing::info!("CLI override: SOCKS4 user id mode set to {}", mode);
        }

        if let Some(emit) = overrides.emit {
            self.telemetry.emit = emit;
            tracing::info!("CLI override: emit policy set to {}", emit);
        }

        if let Some(log_file) = &overrides.log_file {
            self.telemetry.log_file = Some(log_file.clone());
            tracing::info!("CLI override: log file set to {}", log_file.display());
        }

        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        Ok(())
    }
}
