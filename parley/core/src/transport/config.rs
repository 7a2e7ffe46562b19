//! Transport Configuration
//!
//! Tunables for a single RPC connection and for the TCP server that accepts
//! them. The call timeout and the read poll interval are separate knobs: the
//! first bounds how long a caller waits for a reply, the second only bounds
//! how long the read loop sleeps before re-checking whether it should stop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port the chat server listens on
pub const DEFAULT_PORT: u16 = 6543;

/// Maximum frame size (10 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Per-connection RPC configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// How long `Proxy::call` waits for a reply, in milliseconds
    pub call_timeout_ms: u64,

    /// Read loop poll interval in milliseconds
    ///
    /// The socket read is bounded by this so that a graceful close is
    /// noticed even when no traffic arrives.
    pub read_poll_ms: u64,

    /// Connection timeout in milliseconds when dialing a peer
    pub connect_timeout_ms: u64,

    /// Size of the read buffer handed to each socket read
    pub read_buffer_size: usize,

    /// Largest frame accepted or produced, in bytes
    pub max_frame_size: usize,

    /// Maximum handler invocations running at once on one connection
    pub max_concurrent_requests: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            read_poll_ms: 1000,
            connect_timeout_ms: 5000,
            read_buffer_size: 4096,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_requests: 64,
        }
    }
}

impl RpcConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PARLEY_CALL_TIMEOUT_MS`: Call timeout in ms
    /// - `PARLEY_READ_POLL_MS`: Read loop poll interval in ms
    /// - `PARLEY_CONNECT_TIMEOUT_MS`: Connection timeout in ms
    /// - `PARLEY_READ_BUFFER_SIZE`: Read buffer size in bytes
    /// - `PARLEY_MAX_FRAME_SIZE`: Maximum frame size in bytes
    /// - `PARLEY_MAX_CONCURRENT_REQUESTS`: Handler concurrency per connection
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            call_timeout_ms: env_parse("PARLEY_CALL_TIMEOUT_MS").unwrap_or(defaults.call_timeout_ms),
            read_poll_ms: env_parse("PARLEY_READ_POLL_MS").unwrap_or(defaults.read_poll_ms),
            connect_timeout_ms: env_parse("PARLEY_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            read_buffer_size: env_parse("PARLEY_READ_BUFFER_SIZE")
                .unwrap_or(defaults.read_buffer_size),
            max_frame_size: env_parse("PARLEY_MAX_FRAME_SIZE").unwrap_or(defaults.max_frame_size),
            max_concurrent_requests: env_parse("PARLEY_MAX_CONCURRENT_REQUESTS")
                .unwrap_or(defaults.max_concurrent_requests),
        }
    }

    /// Call timeout as a `Duration`
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Read poll interval as a `Duration`
    #[must_use]
    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Override the call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = duration_ms(timeout);
        self
    }

    /// Override the read poll interval
    #[must_use]
    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_ms = duration_ms(interval);
        self
    }
}

/// TCP server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:6543`
    pub bind_addr: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: 100,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// - `PARLEY_BIND`: Listen address
    /// - `PARLEY_MAX_CONNECTIONS`: Connection limit
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("PARLEY_BIND").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("PARLEY_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
