//! Configuration management for the NetControl terminal server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/netcontrol/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::DisconnectPolicy;
use crate::session::{SpawnOptions, TermSize};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be non-zero, got {rows}x{cols}")]
    InvalidDefaultSize { rows: u16, cols: u16 },

    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `session.max_sessions`.
const MAX_SESSIONS_LIMIT: usize = 10_000;

/// Main configuration structure for the terminal server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and process-level settings.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// Listener and process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind: String,

    /// Port to listen on.
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Seconds to wait for connections to drain on shutdown.
    pub shutdown_timeout_secs: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for new sessions. Empty means detect from the environment.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Rows used when a client does not request a size.
    pub default_rows: u16,

    /// Columns used when a client does not request a size.
    pub default_cols: u16,

    /// Milliseconds a closed session's shell may ignore the hangup before
    /// it is killed.
    pub kill_grace_ms: u64,

    /// What happens to a session when its client disconnects.
    pub disconnect_policy: DisconnectPolicy,

    /// Working directory for new shells. Defaults to the home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for new shells.
    pub env: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7002,
            log_level: "info".to_string(),
            log_dir: None,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: String::new(),
            max_sessions: 64,
            default_rows: 24,
            default_cols: 80,
            kill_grace_ms: 2000,
            disconnect_policy: DisconnectPolicy::default(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Builds the spawn options for new shells.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            shell: Some(self.default_shell.clone()).filter(|s| !s.is_empty()),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: self.cwd.clone(),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    /// Size used for sessions whose client did not ask for one.
    pub fn default_size(&self) -> TermSize {
        TermSize::new(self.default_rows, self.default_cols).unwrap_or_default()
    }
}

/// An environment variable seen by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The variable replaced a config value.
    Applied { var: &'static str, value: String },
    /// The variable was set but could not be used.
    Ignored {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl EnvOverride {
    /// Logs the override through the installed subscriber.
    pub fn log(&self) {
        match self {
            EnvOverride::Applied { var, value } => {
                tracing::info!("Overriding config from environment: {}={}", var, value);
            }
            EnvOverride::Ignored { var, value, reason } => {
                tracing::warn!("Ignoring invalid {} in environment ({}): {}", var, value, reason);
            }
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("netcontrol")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NETCONTROL_PORT: Override the listen port (PORT is honored too)
    /// - NETCONTROL_BIND: Override the bind address
    /// - NETCONTROL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Runs before logging is set up, so nothing is logged here; the returned
    /// overrides should be passed to [`EnvOverride::log`] once it is.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut overrides = Vec::new();

        let port = non_empty_var("NETCONTROL_PORT")
            .map(|value| ("NETCONTROL_PORT", value))
            .or_else(|| non_empty_var("PORT").map(|value| ("PORT", value)));
        if let Some((var, value)) = port {
            match value.parse::<u16>() {
                Ok(port) => {
                    self.server.port = port;
                    overrides.push(EnvOverride::Applied { var, value });
                }
                Err(e) => overrides.push(EnvOverride::Ignored {
                    var,
                    value,
                    reason: e.to_string(),
                }),
            }
        }

        if let Some(bind) = non_empty_var("NETCONTROL_BIND") {
            self.server.bind = bind.clone();
            overrides.push(EnvOverride::Applied {
                var: "NETCONTROL_BIND",
                value: bind,
            });
        }

        if let Some(level) = non_empty_var("NETCONTROL_LOG_LEVEL") {
            self.server.log_level = level.clone();
            overrides.push(EnvOverride::Applied {
                var: "NETCONTROL_LOG_LEVEL",
                value: level,
            });
        }

        overrides
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if !(1..=MAX_SESSIONS_LIMIT).contains(&self.session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_rows == 0 || self.session.default_cols == 0 {
            return Err(ConfigError::InvalidDefaultSize {
                rows: self.session.default_rows,
                cols: self.session.default_cols,
            });
        }

        // An empty shell is detected at spawn time.
        let shell = &self.session.default_shell;
        if !shell.is_empty() {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Address the HTTP listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// How long shutdown waits for connections to drain.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
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

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
