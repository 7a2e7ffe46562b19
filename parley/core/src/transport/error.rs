//! Transport and Call Errors
//!
//! Two layers of failure:
//! - [`TransportError`]: the socket or the byte stream went wrong. The
//!   connection is torn down; nothing is retried at this layer.
//! - [`RpcError`]: what a caller of [`Proxy::call`](super::Proxy::call) sees.
//!   Remote failures and timeouts leave the connection open.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{CallId, ErrorObject};

/// Errors that can occur while moving frames over a connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Dialing the peer did not complete in time
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Address that was dialed
        addr: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// The connection is closing or closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// IO error from the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not form a valid envelope
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A frame exceeded the configured size limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Size of the offending frame (or buffered bytes)
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Envelope serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Failure of a single remote call
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer answered with an error envelope
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code from the peer (500 for handler failures)
        code: i64,
        /// Error description from the peer
        message: String,
    },

    /// No matching reply arrived in time
    #[error("Call {id} to '{method}' timed out after {timeout:?}")]
    Timeout {
        /// Method that was called
        method: String,
        /// Correlation id of the abandoned call
        id: CallId,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The connection failed underneath the call
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Call arguments could not be turned into a named-argument mapping
    #[error("Invalid params for '{method}': {reason}")]
    InvalidParams {
        /// Method that was called
        method: String,
        /// Why the arguments were rejected
        reason: String,
    },

    /// The reply could not be converted into the expected type
    #[error("Invalid result from '{method}': {reason}")]
    InvalidResult {
        /// Method that was called
        method: String,
        /// Why the result was rejected
        reason: String,
    },
}

impl RpcError {
    /// Whether this call failed because no reply arrived in time
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the connection was already gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::ConnectionClosed))
    }

    /// Error code reported by the peer, if this is a remote failure
    #[must_use]
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = TransportError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_rpc_error_classification() {
        let remote = RpcError::from(ErrorObject {
            code: 500,
            message: "boom".into(),
        });
        assert_eq!(remote.remote_code(), Some(500));
        assert!(!remote.is_timeout());

        let timeout = RpcError::Timeout {
            method: "slow".into(),
            id: CallId(3),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.remote_code(), None);
        assert!(timeout.to_string().contains("slow"));

        let closed = RpcError::from(TransportError::ConnectionClosed);
        assert!(closed.is_closed());
    }
}
