//! Configuration loading, validation, and management for kiln.
//!
//! Loads configuration from `~/.kiln/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use kiln_core::GenerationParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.kiln/config.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which [`ConversationStore`](kiln_core::ConversationStore) backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file; ignored by the memory backend.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    AppConfig::config_dir().join("context.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// History messages included when a request gives no window.
    #[serde(default = "default_window")]
    pub default_window: usize,
}

fn default_window() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_window: default_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// How long a request may wait for the generation slot. Unset waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,

    /// Upper bound on one non-streaming generation. Unset means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Parameters used when a request omits them.
    #[serde(default)]
    pub defaults: GenerationParams,
}

impl GenerationConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model to load at startup (path, hub repo, or preset alias).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_config: Option<serde_json::Value>,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Where context enhancement is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Another kiln instance, over HTTP.
    #[default]
    Peer,
    /// This process's own store.
    Local,
}

/// Process-wide routing settings. Mutable at runtime, never persisted back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: RoutingMode,

    #[serde(default = "default_peer_host")]
    pub peer_host: String,

    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    #[serde(default = "default_peer_timeout")]
    pub timeout_secs: u64,
}

fn default_peer_host() -> String {
    "localhost".into()
}
fn default_peer_port() -> u16 {
    8001
}
fn default_peer_timeout() -> u64 {
    5
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RoutingMode::default(),
            peer_host: default_peer_host(),
            peer_port: default_peer_port(),
            timeout_secs: default_peer_timeout(),
        }
    }
}

impl RoutingConfig {
    /// Base URL of the peer service.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.peer_host, self.peer_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.kiln/config.toml).
    ///
    /// Environment variables override the file:
    /// `KILN_HOST`, `KILN_PORT`, `KILN_DB_PATH`, `KILN_MODEL`,
    /// `KILN_PEER_HOST`, `KILN_PEER_PORT`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup, then re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("KILN_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("KILN_PORT") {
            self.server.port = parse_port("KILN_PORT", &port)?;
        }
        if let Some(path) = lookup("KILN_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(model) = lookup("KILN_MODEL") {
            self.model.path = Some(model);
        }
        if let Some(host) = lookup("KILN_PEER_HOST") {
            self.routing.peer_host = host;
        }
        if let Some(port) = lookup("KILN_PEER_PORT") {
            self.routing.peer_port = parse_port("KILN_PEER_PORT", &port)?;
        }
        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kiln")
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError("server.port must be > 0".into()));
        }

        if self.routing.peer_port == 0 {
            return Err(ConfigError::ValidationError("routing.peer_port must be > 0".into()));
        }

        if self.routing.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "routing.timeout_secs must be > 0".into(),
            ));
        }

        if self.model.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "model.retry.max_attempts must be >= 1".into(),
            ));
        }

        if self.model.retry.multiplier.is_nan() || self.model.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "model.retry.multiplier must be >= 1.0".into(),
            ));
        }

        if self.generation.acquire_timeout_secs == Some(0) || self.generation.timeout_secs == Some(0)
        {
            return Err(ConfigError::ValidationError(
                "generation timeouts must be > 0 when set".into(),
            ));
        }

        self.generation
            .defaults
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("generation.defaults: {e}")))?;

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_port(var: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{var} is not a valid port: {value}")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
