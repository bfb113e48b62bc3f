//! Configuration management for ptyhost.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/ptyhost/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interactive::{InteractiveSpec, RunnerOptions};
use crate::session::{
    detect_shell, RegistryOptions, DEFAULT_COLS, DEFAULT_MAX_SESSIONS, DEFAULT_ROWS,
    DEFAULT_WATCH_INTERVAL,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("poll_interval_ms must be greater than 0")]
    InvalidPollInterval,

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("profile '{0}' has no commands")]
    EmptyProfile(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Session defaults.
    pub session: SessionConfig,

    /// Timing of interactive runs.
    pub runner: RunnerConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Named command lists, runnable with `ptyhost run <name>`.
    pub profiles: BTreeMap<String, Profile>,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for new sessions. Falls back to `$SHELL`, then `/bin/sh`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,

    /// Width used when the terminal size is unknown.
    pub cols: u16,

    /// Height used when the terminal size is unknown.
    pub rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

/// Timing of interactive runs, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wait before the first scripted command.
    pub settle_delay_ms: u64,

    /// Pause between scripted commands.
    pub command_delay_ms: u64,

    /// Interval for polling whether the session is still running.
    pub poll_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for log files written while the terminal is in raw mode.
    pub log_dir: PathBuf,
}

/// A named, scripted session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Profile {
    /// Commands typed into the shell, in order.
    pub commands: Vec<String>,

    /// Shell override for this profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Working directory for the shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            command_delay_ms: 100,
            poll_interval_ms: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: default_log_dir(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyhost")
        .join("config.toml")
}

/// Returns the default log directory path.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyhost")
        .join("logs")
}

/// Checks that `shell` names an existing file or an executable on `PATH`.
fn check_shell(shell: &str) -> Result<(), ConfigError> {
    let path = Path::new(shell);
    let found = if path.is_absolute() {
        path.exists()
    } else {
        which::which(shell).is_ok()
    };

    if found {
        Ok(())
    } else {
        Err(ConfigError::InvalidShellPath(shell.to_string()))
    }
}

impl Profile {
    /// Builds the interactive run for this profile under session id `id`.
    pub fn interactive_spec(&self, id: impl Into<String>) -> InteractiveSpec {
        InteractiveSpec {
            id: id.into(),
            commands: self.commands.clone(),
            shell: self.shell.clone(),
            args: Vec::new(),
            cwd: self.cwd.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYHOST_SHELL: Override the default shell
    /// - PTYHOST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the names of the variables that were applied. Overrides are
    /// read before logging is set up, so reporting them is left to the caller.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(shell) = non_empty_var("PTYHOST_SHELL") {
            self.session.default_shell = Some(shell);
            applied.push("PTYHOST_SHELL");
        }

        if let Some(level) = non_empty_var("PTYHOST_LOG_LEVEL") {
            self.logging.level = level;
            applied.push("PTYHOST_LOG_LEVEL");
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.runner.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if let Some(shell) = &self.session.default_shell {
            check_shell(shell)?;
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        for (name, profile) in &self.profiles {
            if profile.commands.is_empty() {
                return Err(ConfigError::EmptyProfile(name.clone()));
            }
            if let Some(shell) = &profile.shell {
                check_shell(shell)?;
            }
        }

        Ok(())
    }

    /// Returns the shell for sessions that do not name one.
    pub fn resolve_shell(&self) -> String {
        detect_shell(self.session.default_shell.clone())
    }

    /// Options for the interactive runner.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            shell: self.resolve_shell(),
            settle_delay: Duration::from_millis(self.runner.settle_delay_ms),
            command_delay: Duration::from_millis(self.runner.command_delay_ms),
            poll_interval: Duration::from_millis(self.runner.poll_interval_ms),
            cols: self.session.cols,
            rows: self.session.rows,
        }
    }

    /// Options for the session registry.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            watch_interval: DEFAULT_WATCH_INTERVAL,
            max_sessions: self.session.max_sessions,
        }
    }

    /// Looks up a profile by name.
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
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
