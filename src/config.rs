//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and key has a default, so an empty file (or no file at
//! all) yields a working configuration.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GcsError, Result};

/// Acked writes and requests give up waiting for a reply after this long
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 250;

/// Total transmissions of an acked write or request, the first included
pub const DEFAULT_TRANSACTION_ATTEMPTS: u8 = 3;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub object_log: ObjectLogConfig,
}

/// Transport used to reach the flight controller
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Serial,
    Tcp,
}

/// Link configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LinkConfig {
    #[serde(default = "default_link_kind")]
    pub kind: LinkKind,

    /// Serial device; empty means auto-detect
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// `host:port` for TCP links
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Telemetry engine configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    #[serde(default = "default_transaction_attempts")]
    pub transaction_attempts: u8,

    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// High bits OR-ed into every outgoing type byte
    #[serde(default)]
    pub type_version: u8,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write daily-rotated log files here
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Object log (JSONL) configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ObjectLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_object_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

// Default value functions
fn default_link_kind() -> LinkKind { LinkKind::Serial }
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 57600 }
fn default_address() -> String { "127.0.0.1:9000".to_string() }
fn default_reconnect_interval_ms() -> u64 { 1000 }

fn default_transaction_timeout_ms() -> u64 { DEFAULT_TRANSACTION_TIMEOUT_MS }
fn default_transaction_attempts() -> u8 { DEFAULT_TRANSACTION_ATTEMPTS }
fn default_scheduler_tick_ms() -> u64 { 10 }

fn default_log_level() -> String { "info".to_string() }

fn default_object_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: default_link_kind(),
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            address: default_address(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: default_transaction_timeout_ms(),
            transaction_attempts: default_transaction_attempts(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            type_version: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Default for ObjectLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_object_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl LinkConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl TelemetryConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

impl ObjectLogConfig {
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

fn invalid(message: impl std::fmt::Display) -> GcsError {
    GcsError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use uavtalk_gcs::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Link
        match self.link.kind {
            LinkKind::Serial => {
                if ![9600, 19200, 38400, 57600, 115200, 230400].contains(&self.link.baud_rate) {
                    return Err(invalid(
                        "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400",
                    ));
                }
            }
            LinkKind::Tcp => {
                if self.link.address.is_empty() {
                    return Err(invalid("address cannot be empty for a tcp link"));
                }
            }
        }

        if self.link.reconnect_interval_ms == 0 || self.link.reconnect_interval_ms > 60000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        // Telemetry
        if self.telemetry.transaction_timeout_ms == 0
            || self.telemetry.transaction_timeout_ms > 10000
        {
            return Err(invalid("transaction_timeout_ms must be between 1 and 10000"));
        }

        if self.telemetry.transaction_attempts == 0 || self.telemetry.transaction_attempts > 10 {
            return Err(invalid("transaction_attempts must be between 1 and 10"));
        }

        if self.telemetry.scheduler_tick_ms == 0 || self.telemetry.scheduler_tick_ms > 1000 {
            return Err(invalid("scheduler_tick_ms must be between 1 and 1000"));
        }

        if self.telemetry.type_version & 0x07 != 0 {
            return Err(invalid(format!(
                "type_version 0x{:02X} must leave the low 3 bits clear",
                self.telemetry.type_version
            )));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("level must be one of: trace, debug, info, warn, error"));
        }

        if matches!(&self.logging.log_dir, Some(dir) if dir.is_empty()) {
            return Err(invalid("logging log_dir cannot be empty when set"));
        }

        // Object log
        if self.object_log.enabled && self.object_log.log_dir.is_empty() {
            return Err(invalid("object_log log_dir cannot be empty when enabled"));
        }

        if self.object_log.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.object_log.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        Ok(())
    }
}
