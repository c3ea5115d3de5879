//! Configuration management for the EventVault engine.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/eventvault/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bootstrap_timeout_ms must be between 100 and 60000, got {0}")]
    InvalidBootstrapTimeout(u64),

    #[error("max_file_size must be greater than 0, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("progress ceilings must satisfy 0 < transfer_ceiling < finalize_ceiling < 100, got {transfer} and {finalize}")]
    InvalidProgressCeilings { transfer: u8, finalize: u8 },

    #[error("max_attempts must be between 1 and 10, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("backoff_multiplier must be at least 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("initial_backoff_ms ({initial}) must not exceed max_backoff_ms ({max})")]
    InvalidBackoffRange { initial: u64, max: u64 },

    #[error("event_buffer must be between 1 and 65536, got {0}")]
    InvalidEventBuffer(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the EventVault engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General engine configuration.
    pub engine: EngineConfig,

    /// Identity session configuration.
    pub session: SessionConfig,

    /// Upload queue configuration.
    pub upload: UploadConfig,

    /// Change-feed configuration.
    pub sync: SyncConfig,
}

/// General engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for local engine state (guest identity).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Identity session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Safety timeout for the initial identity check, in milliseconds.
    pub bootstrap_timeout_ms: u64,
}

/// Upload queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum accepted file size in bytes (default: 100MB).
    pub max_file_size: u64,

    /// Delay held in `finalizing` before a task flips to `complete`.
    pub stabilization_delay_ms: u64,

    /// How long a `complete` task stays visible before eviction.
    pub completion_display_ms: u64,

    /// Progress reached when the byte transfer finishes.
    pub transfer_ceiling: u8,

    /// Progress reached when metadata registration finishes.
    pub finalize_ceiling: u8,

    /// Transfer attempts per task (1 = no automatic retry).
    pub max_attempts: u32,

    /// Backoff before the first automatic retry.
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff between retries.
    pub max_backoff_ms: u64,

    /// Multiplier applied to the backoff after each retry.
    pub backoff_multiplier: f64,
}

/// Change-feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of the notification and event channels.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout_ms: 3_000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024, // 100MB
            stabilization_delay_ms: 800,
            completion_display_ms: 5_000,
            transfer_ceiling: 85,
            finalize_ceiling: 98,
            max_attempts: 1,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

impl SessionConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}

impl UploadConfig {
    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn completion_display(&self) -> Duration {
        Duration::from_millis(self.completion_display_ms)
    }

    /// Backoff to wait before the given retry (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventvault")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventvault")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - EVENTVAULT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - EVENTVAULT_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("EVENTVAULT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.engine.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("EVENTVAULT_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.engine.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.session.bootstrap_timeout_ms;
        if !(100..=60_000).contains(&timeout) {
            return Err(ConfigError::InvalidBootstrapTimeout(timeout));
        }

        let upload = &self.upload;
        if upload.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize(upload.max_file_size));
        }

        if upload.transfer_ceiling == 0
            || upload.transfer_ceiling >= upload.finalize_ceiling
            || upload.finalize_ceiling >= 100
        {
            return Err(ConfigError::InvalidProgressCeilings {
                transfer: upload.transfer_ceiling,
                finalize: upload.finalize_ceiling,
            });
        }

        if !(1..=10).contains(&upload.max_attempts) {
            return Err(ConfigError::InvalidMaxAttempts(upload.max_attempts));
        }

        if upload.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(upload.backoff_multiplier));
        }

        if upload.initial_backoff_ms > upload.max_backoff_ms {
            return Err(ConfigError::InvalidBackoffRange {
                initial: upload.initial_backoff_ms,
                max: upload.max_backoff_ms,
            });
        }

        if !(1..=65_536).contains(&self.sync.event_buffer) {
            return Err(ConfigError::InvalidEventBuffer(self.sync.event_buffer));
        }

        let level = self.engine.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.engine.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
