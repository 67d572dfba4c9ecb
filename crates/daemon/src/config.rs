//! Configuration management for the agentdeck broker.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/agentdeck/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::AgentKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_buffer_size must be greater than 0, got {0}")]
    InvalidBufferSize(usize),

    #[error("replay_limit must be greater than 0, got {0}")]
    InvalidReplayLimit(usize),

    #[error("channel_capacity must be between 16 and 65536, got {0}")]
    InvalidChannelCapacity(usize),

    #[error("start_timeout_secs must be between 1 and 600, got {0}")]
    InvalidStartTimeout(u64),

    #[error("persist_interval_secs must be greater than 0, got {0}")]
    InvalidPersistInterval(u64),

    #[error("bind_addr is not a valid socket address: {0}")]
    InvalidBindAddr(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the agentdeck broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Agent launch commands.
    pub agents: AgentsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (session snapshot, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to a daily rolling file under `<data_dir>/logs`.
    pub log_to_file: bool,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// Outbound queue depth per connection. A connection whose queue fills
    /// up is closed so the client can reconnect and replay.
    pub channel_capacity: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions.
    pub max_sessions: usize,

    /// Output chunks retained per session.
    pub max_buffer_size: usize,

    /// Output chunks replayed to a joining connection.
    pub replay_limit: usize,

    /// Seconds to wait for an agent process to spawn.
    pub start_timeout_secs: u64,

    /// Seconds between session snapshot writes.
    pub persist_interval_secs: u64,

    /// Working directory used when a session is created without one.
    pub default_working_dir: PathBuf,

    /// Roots a session working directory must live under. Empty means any
    /// directory is allowed.
    pub allowed_roots: Vec<PathBuf>,

    /// Terminal columns when a start request does not specify them.
    pub default_cols: u16,

    /// Terminal rows when a start request does not specify them.
    pub default_rows: u16,
}

/// Launch commands for each agent kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub claude: AgentCommand,
    pub codex: AgentCommand,
    pub gemini: AgentCommand,
}

/// How to launch one agent program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentCommand {
    /// Executable name or path. Bare names are looked up on `PATH`.
    pub command: String,

    /// Arguments passed before any per-start arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl AgentCommand {
    fn named(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Executable to launch, falling back to the agent's own name when the
    /// command is left blank.
    pub fn program(&self, kind: AgentKind) -> &str {
        let command = self.command.trim();
        if command.is_empty() {
            kind.as_str()
        } else {
            command
        }
    }
}

impl AgentsConfig {
    /// Returns the launch command for an agent kind.
    pub fn get(&self, kind: AgentKind) -> &AgentCommand {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
            AgentKind::Gemini => &self.gemini,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            channel_capacity: 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_buffer_size: 1000,
            replay_limit: protocol::DEFAULT_REPLAY_LIMIT,
            start_timeout_secs: 30,
            persist_interval_secs: 30,
            default_working_dir: default_working_dir(),
            allowed_roots: Vec::new(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude: AgentCommand::named("claude"),
            codex: AgentCommand::named("codex"),
            gemini: AgentCommand::named("gemini"),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdeck")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdeck")
}

/// Returns the default session working directory.
fn default_working_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - AGENTDECK_BIND_ADDR: Override WebSocket bind address
    /// - AGENTDECK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - AGENTDECK_DATA_DIR: Override data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("AGENTDECK_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("AGENTDECK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("AGENTDECK_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.max_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.session.max_buffer_size));
        }

        if self.session.replay_limit == 0 {
            return Err(ConfigError::InvalidReplayLimit(self.session.replay_limit));
        }

        if self.server.channel_capacity < 16 || self.server.channel_capacity > 65536 {
            return Err(ConfigError::InvalidChannelCapacity(
                self.server.channel_capacity,
            ));
        }

        if self.session.start_timeout_secs == 0 || self.session.start_timeout_secs > 600 {
            return Err(ConfigError::InvalidStartTimeout(
                self.session.start_timeout_secs,
            ));
        }

        if self.session.persist_interval_secs == 0 {
            return Err(ConfigError::InvalidPersistInterval(
                self.session.persist_interval_secs,
            ));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Path of the durable session snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.daemon.data_dir.join("sessions.json")
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
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
    ///
    /// The default path is `~/.config/agentdeck/config.toml`.
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
