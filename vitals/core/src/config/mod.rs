//! TOML Configuration File Support
//!
//! Centralized configuration for the telemetry daemon, with an optional TOML
//! file at `~/.config/vroom-vitals/vitals.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8001
//! max_connections = 8
//! channel_capacity = 256
//! handshake_timeout_secs = 10
//!
//! [streaming]
//! update_interval_secs = 1.0
//! command_timeout_secs = 30
//! max_concurrent_tasks = 4
//! max_concurrent_streams = 4
//!
//! [source]
//! kind = "elm327"
//! address = "192.168.0.10:35000"
//! connect_timeout_secs = 10
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Bind address; `0.0.0.0` listens on all interfaces
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Connections handled at once (only one can own the source)
    pub max_connections: usize,
    /// Outbound frames buffered per session
    pub channel_capacity: usize,
    /// Largest accepted WebSocket message in bytes
    pub max_message_size: usize,
    /// Time a client gets to complete the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            max_connections: 8,
            channel_capacity: 256,
            max_message_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerSettings {
    /// `host:port` for binding
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session streaming settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingSettings {
    /// Time between two queries of one stream
    pub update_interval: Duration,
    /// Upper bound on one sensor query
    pub command_timeout: Duration,
    /// Physical queries in flight at once
    pub max_concurrent_tasks: usize,
    /// Live streams per session
    pub max_concurrent_streams: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            command_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 4,
            max_concurrent_streams: 4,
        }
    }
}

/// Which telemetry source backs a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    /// Built-in deterministic values, no hardware
    #[default]
    Simulated,
    /// ELM327 adapter reachable over TCP
    Elm327,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(Self::Simulated),
            "elm327" | "elm" => Ok(Self::Elm327),
            other => Err(ConfigError::ValidationError(format!(
                "unknown source kind '{other}' (expected simulated or elm327)"
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Elm327 => write!(f, "elm327"),
        }
    }
}

/// Telemetry source settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSettings {
    /// Source implementation
    pub kind: SourceKind,
    /// Adapter `host:port` (ELM327 only)
    pub address: String,
    /// Time allowed to connect and initialize the adapter
    pub connect_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::Simulated,
            address: "192.168.0.10:35000".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Bind address
    pub host: Option<String>,
    /// Bind port
    pub port: Option<u16>,
    /// Maximum simultaneous connections
    pub max_connections: Option<usize>,
    /// Outbound buffer per session
    pub channel_capacity: Option<usize>,
    /// Maximum WebSocket message size in bytes
    pub max_message_size: Option<usize>,
    /// Seconds allowed for the WebSocket upgrade
    pub handshake_timeout_secs: Option<f64>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Seconds between queries (fractions allowed)
    pub update_interval_secs: Option<f64>,
    /// Seconds before a query counts as failed
    pub command_timeout_secs: Option<f64>,
    /// Concurrent physical queries
    pub max_concurrent_tasks: Option<usize>,
    /// Concurrent streams per session
    pub max_concurrent_streams: Option<usize>,
}

/// Source section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceToml {
    /// `simulated` or `elm327`
    pub kind: Option<String>,
    /// Adapter address
    pub address: Option<String>,
    /// Adapter connect timeout in seconds
    pub connect_timeout_secs: Option<f64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VitalsToml {
    /// Server section
    pub server: ServerToml,
    /// Streaming section
    pub streaming: StreamingToml,
    /// Source section
    pub source: SourceToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the daemon
///
/// Use [`load_config`] to load with proper priority handling, then apply
/// [`ConfigOverrides`] and call [`VitalsConfig::validate`].
#[derive(Clone, Debug, Default)]
pub struct VitalsConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Streaming settings
    pub streaming: StreamingSettings,
    /// Source settings
    pub source: SourceSettings,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    origin: Option<ConfigSource>,
}

impl VitalsConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.origin.unwrap_or(ConfigSource::Default)
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.origin = Some(source);
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero interval, timeout,
    /// or capacity, or for an ELM327 source without an address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.streaming.update_interval.is_zero() {
            return invalid("update interval must be greater than zero");
        }
        if self.streaming.command_timeout.is_zero() {
            return invalid("command timeout must be greater than zero");
        }
        if self.server.handshake_timeout.is_zero() {
            return invalid("handshake timeout must be greater than zero");
        }
        if self.streaming.max_concurrent_tasks == 0 {
            return invalid("max_concurrent_tasks must be at least 1");
        }
        if self.streaming.max_concurrent_streams == 0 {
            return invalid("max_concurrent_streams must be at least 1");
        }
        if self.server.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.server.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        if self.source.kind == SourceKind::Elm327 && self.source.address.trim().is_empty() {
            return invalid("elm327 source requires an address");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/vroom-vitals/vitals.toml` or
/// `~/.config/vroom-vitals/vitals.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("vroom-vitals").join("vitals.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or an
/// environment variable holds an invalid value.
pub fn load_config() -> Result<VitalsConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error; defaults are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<VitalsConfig, ConfigError> {
    let mut config = VitalsConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: VitalsToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.set_source(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config)?;

    Ok(config)
}

fn secs(value: f64, field: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| {
            ConfigError::ValidationError(format!(
                "{field} must be a non-negative number of seconds"
            ))
        })
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut VitalsConfig, toml: &VitalsToml) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref host) = toml.server.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = toml.server.port {
        config.server.port = port;
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(capacity) = toml.server.channel_capacity {
        config.server.channel_capacity = capacity;
    }
    if let Some(size) = toml.server.max_message_size {
        config.server.max_message_size = size;
    }
    if let Some(timeout) = toml.server.handshake_timeout_secs {
        config.server.handshake_timeout = secs(timeout, "handshake_timeout_secs")?;
    }

    // Streaming settings
    if let Some(interval) = toml.streaming.update_interval_secs {
        config.streaming.update_interval = secs(interval, "update_interval_secs")?;
    }
    if let Some(timeout) = toml.streaming.command_timeout_secs {
        config.streaming.command_timeout = secs(timeout, "command_timeout_secs")?;
    }
    if let Some(tasks) = toml.streaming.max_concurrent_tasks {
        config.streaming.max_concurrent_tasks = tasks;
    }
    if let Some(streams) = toml.streaming.max_concurrent_streams {
        config.streaming.max_concurrent_streams = streams;
    }

    // Source settings
    if let Some(ref kind) = toml.source.kind {
        config.source.kind = kind.parse()?;
    }
    if let Some(ref address) = toml.source.address {
        config.source.address.clone_from(address);
    }
    if let Some(timeout) = toml.source.connect_timeout_secs {
        config.source.connect_timeout = secs(timeout, "connect_timeout_secs")?;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut VitalsConfig) -> Result<(), ConfigError> {
    apply_env_with(config, |key| std::env::var(key).ok())
}

/// Apply overrides read through `lookup`
///
/// Unparseable numbers are rejected rather than ignored so a typo in the
/// environment does not silently fall back to a default.
fn apply_env_with<F>(config: &mut VitalsConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("{key}: invalid value '{raw}'")))
    }

    let mut touched = false;

    if let Some(host) = lookup("VITALS_HOST") {
        config.server.host = host;
        touched = true;
    }
    if let Some(port) = lookup("VITALS_PORT") {
        config.server.port = parse("VITALS_PORT", &port)?;
        touched = true;
    }
    if let Some(interval) = lookup("VITALS_UPDATE_INTERVAL") {
        let value: f64 = parse("VITALS_UPDATE_INTERVAL", &interval)?;
        config.streaming.update_interval = secs(value, "VITALS_UPDATE_INTERVAL")?;
        touched = true;
    }
    if let Some(timeout) = lookup("VITALS_COMMAND_TIMEOUT") {
        let value: f64 = parse("VITALS_COMMAND_TIMEOUT", &timeout)?;
        config.streaming.command_timeout = secs(value, "VITALS_COMMAND_TIMEOUT")?;
        touched = true;
    }
    if let Some(tasks) = lookup("VITALS_MAX_CONCURRENT_TASKS") {
        config.streaming.max_concurrent_tasks = parse("VITALS_MAX_CONCURRENT_TASKS", &tasks)?;
        touched = true;
    }
    if let Some(streams) = lookup("VITALS_MAX_CONCURRENT_STREAMS") {
        config.streaming.max_concurrent_streams =
            parse("VITALS_MAX_CONCURRENT_STREAMS", &streams)?;
        touched = true;
    }
    if let Some(kind) = lookup("VITALS_SOURCE") {
        config.source.kind = kind.parse()?;
        touched = true;
    }
    if let Some(address) = lookup("VITALS_SOURCE_ADDR") {
        config.source.address = address;
        touched = true;
    }

    if touched {
        config.set_source(ConfigSource::Env);
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Bind address override
    pub host: Option<String>,
    /// Port override
    pub port: Option<u16>,
    /// Update interval override
    pub update_interval: Option<Duration>,
    /// Command timeout override
    pub command_timeout: Option<Duration>,
    /// Gate capacity override
    pub max_concurrent_tasks: Option<usize>,
    /// Stream cap override
    pub max_concurrent_streams: Option<usize>,
    /// Source kind override
    pub source_kind: Option<SourceKind>,
    /// Adapter address override
    pub source_address: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind address override
    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Set port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set update interval override
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Set command timeout override
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set gate capacity override
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = Some(tasks);
        self
    }

    /// Set stream cap override
    #[must_use]
    pub fn with_max_concurrent_streams(mut self, streams: usize) -> Self {
        self.max_concurrent_streams = Some(streams);
        self
    }

    /// Set source kind override
    #[must_use]
    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = Some(kind);
        self
    }

    /// Set adapter address override
    #[must_use]
    pub fn with_source_address(mut self, address: String) -> Self {
        self.source_address = Some(address);
        self
    }

    fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.update_interval.is_none()
            && self.command_timeout.is_none()
            && self.max_concurrent_tasks.is_none()
            && self.max_concurrent_streams.is_none()
            && self.source_kind.is_none()
            && self.source_address.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut VitalsConfig) {
        if !self.is_empty() {
            config.set_source(ConfigSource::Cli);
        }

        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(interval) = self.update_interval {
            config.streaming.update_interval = interval;
        }
        if let Some(timeout) = self.command_timeout {
            config.streaming.command_timeout = timeout;
        }
        if let Some(tasks) = self.max_concurrent_tasks {
            config.streaming.max_concurrent_tasks = tasks;
        }
        if let Some(streams) = self.max_concurrent_streams {
            config.streaming.max_concurrent_streams = streams;
        }
        if let Some(kind) = self.source_kind {
            config.source.kind = kind;
        }
        if let Some(ref address) = self.source_address {
            config.source.address.clone_from(address);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
