//! TOML Configuration File Support
//!
//! Loads server and RPC settings from `~/.config/parley/parley.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`PARLEY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/parley/parley.toml`. A missing file
//! is not an error.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:6543"
//! max_connections = 100
//!
//! [rpc]
//! call_timeout_ms = 5000
//! read_poll_ms = 1000
//! connect_timeout_ms = 5000
//! max_frame_size = 10485760
//! max_concurrent_requests = 64
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::config::{env_parse, RpcConfig, ServerConfig};

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

/// Tracks where the effective configuration came from
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

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_addr: Option<String>,
    /// Connection limit
    pub max_connections: Option<usize>,
}

/// `[rpc]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcToml {
    /// Call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
    /// Read loop poll interval in milliseconds
    pub read_poll_ms: Option<u64>,
    /// Dial timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Socket read buffer size in bytes
    pub read_buffer_size: Option<usize>,
    /// Largest accepted frame in bytes
    pub max_frame_size: Option<usize>,
    /// Handler concurrency per connection
    pub max_concurrent_requests: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyToml {
    /// Server section
    pub server: ServerToml,
    /// RPC section
    pub rpc: RpcToml,
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Configuration after merging every source
#[derive(Clone, Debug)]
pub struct ParleyConfig {
    /// Listener settings
    pub server: ServerConfig,
    /// Per-connection settings
    pub rpc: RpcConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rpc: RpcConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ParleyConfig {
    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the transport cannot run with
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 7] = [
            ("rpc.call_timeout_ms", self.rpc.call_timeout_ms == 0),
            ("rpc.read_poll_ms", self.rpc.read_poll_ms == 0),
            ("rpc.connect_timeout_ms", self.rpc.connect_timeout_ms == 0),
            ("rpc.read_buffer_size", self.rpc.read_buffer_size == 0),
            ("rpc.max_frame_size", self.rpc.max_frame_size == 0),
            ("rpc.max_concurrent_requests", self.rpc.max_concurrent_requests == 0),
            ("server.max_connections", self.server.max_connections == 0),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, bad)| *bad) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.server.bind_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.bind_addr must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/parley/parley.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("parley.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<ParleyConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// The result is not validated: apply [`ConfigOverrides`] first, then call
/// [`ParleyConfig::validate`] so a command-line value can replace a bad
/// file value.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ParleyConfig, ConfigError> {
    let mut config = ParleyConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ParleyToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config);
    Ok(config)
}

fn apply_toml_config(config: &mut ParleyConfig, toml: &ParleyToml) {
    if let Some(ref addr) = toml.server.bind_addr {
        config.server.bind_addr.clone_from(addr);
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }

    let rpc = &mut config.rpc;
    if let Some(ms) = toml.rpc.call_timeout_ms {
        rpc.call_timeout_ms = ms;
    }
    if let Some(ms) = toml.rpc.read_poll_ms {
        rpc.read_poll_ms = ms;
    }
    if let Some(ms) = toml.rpc.connect_timeout_ms {
        rpc.connect_timeout_ms = ms;
    }
    if let Some(size) = toml.rpc.read_buffer_size {
        rpc.read_buffer_size = size;
    }
    if let Some(size) = toml.rpc.max_frame_size {
        rpc.max_frame_size = size;
    }
    if let Some(n) = toml.rpc.max_concurrent_requests {
        rpc.max_concurrent_requests = n;
    }
}

fn apply_env_config(config: &mut ParleyConfig) {
    let mut touched = false;
    let mut set = |slot: &mut u64, key: &str| {
        if let Some(v) = env_parse(key) {
            *slot = v;
            touched = true;
        }
    };
    set(&mut config.rpc.call_timeout_ms, "PARLEY_CALL_TIMEOUT_MS");
    set(&mut config.rpc.read_poll_ms, "PARLEY_READ_POLL_MS");
    set(&mut config.rpc.connect_timeout_ms, "PARLEY_CONNECT_TIMEOUT_MS");

    let mut set = |slot: &mut usize, key: &str| {
        if let Some(v) = env_parse(key) {
            *slot = v;
            touched = true;
        }
    };
    set(&mut config.rpc.read_buffer_size, "PARLEY_READ_BUFFER_SIZE");
    set(&mut config.rpc.max_frame_size, "PARLEY_MAX_FRAME_SIZE");
    set(&mut config.rpc.max_concurrent_requests, "PARLEY_MAX_CONCURRENT_REQUESTS");
    set(&mut config.server.max_connections, "PARLEY_MAX_CONNECTIONS");

    if let Ok(addr) = std::env::var("PARLEY_BIND") {
        config.server.bind_addr = addr;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_addr: Option<String>,
    /// Connection limit override
    pub max_connections: Option<usize>,
    /// Call timeout override (milliseconds)
    pub call_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// Set connection limit override
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Set call timeout override
    #[must_use]
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ParleyConfig) {
        if self.bind_addr.is_some()
            || self.max_connections.is_some()
            || self.call_timeout_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref addr) = self.bind_addr {
            config.server.bind_addr.clone_from(addr);
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.rpc.call_timeout_ms = ms;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
