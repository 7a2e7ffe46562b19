//! Symmetric RPC Transport over TCP
//!
//! Both ends of a connection are equal: each can call methods on the other
//! and each serves the other's calls with its own [`Handler`]. The only
//! asymmetry is who dialed.
//!
//! # Layers
//!
//! - [`frame`]: JSON envelopes delimited by four NUL bytes
//! - [`pending`]: correlates outbound calls with their replies
//! - [`dispatch`]: runs inbound calls against a handler, one task each
//! - [`connection`]: the per-socket read loop and write path
//! - [`proxy`]: the caller-facing API and client-side dialing
//! - [`server`]: the accept loop
//!
//! # Behavior on bad input
//!
//! A malformed frame or an oversized frame ends the connection. A reply for
//! an id nobody is waiting on is logged and dropped. A handler failure or
//! an unknown method becomes a 500 error reply; the connection stays open.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod pending;
pub mod proxy;
pub mod server;

// Re-exports for convenience
pub use config::{RpcConfig, ServerConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
pub use connection::{Connection, ConnectionId, ConnectionState, CLOSE_METHOD};
pub use dispatch::{
    Dispatcher, Handler, HandlerError, HandlerFactory, MethodRouter, NoMethods, NoParams,
};
pub use error::{RpcError, TransportError};
pub use frame::{decode_stream, encode, FrameDecoder, FrameEncoder, FRAME_TERMINATOR};
pub use pending::{PendingCall, PendingCalls};
pub use proxy::{connect, connect_with_handler, Caller, Proxy};
pub use server::{ConnectionStats, Server};
