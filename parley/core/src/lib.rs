//! Parley Core - Symmetric JSON-RPC over TCP
//!
//! Both peers of a parley connection can call methods on each other. A
//! server is just the side that listens; once connected, the server can
//! push calls to its clients exactly as clients call the server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                    ┌──────────────────────┐
//! │        Peer A        │                    │        Peer B        │
//! │                      │   {"method":..}    │                      │
//! │  Proxy::call ────────┼───────────────────►│── Dispatcher         │
//! │                      │                    │     └─► Handler      │
//! │  PendingCalls ◄──────┼────────────────────┼── {"result":..}      │
//! │                      │                    │                      │
//! │  Handler ◄─┐         │   {"method":..}    │                      │
//! │      Dispatcher ◄────┼────────────────────┼── Caller::call       │
//! └──────────────────────┘                    └──────────────────────┘
//!              JSON envelope + 4 NUL bytes, both directions
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use parley_core::{connect, Caller, MethodRouter, RpcConfig, Server, ServerConfig};
//!
//! #[derive(serde::Deserialize)]
//! struct Echo { text: String }
//!
//! let server = Server::bind(ServerConfig::default(), RpcConfig::default()).await?;
//! let factory = |_: Caller| {
//!     MethodRouter::new().route("echo", |p: Echo| async move { Ok(p.text) })
//! };
//! tokio::spawn(async move { server.run(Arc::new(factory), Arc::new(AtomicBool::new(false))).await });
//!
//! let proxy = connect("127.0.0.1:6543", RpcConfig::default()).await?;
//! let reply: String = proxy.invoke("echo", &serde_json::json!({"text": "hi"})).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`envelope`]: request and response messages on the wire
//! - [`transport`]: framing, connections, dispatch, proxy and server
//! - [`config`]: TOML file, environment and CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod envelope;
pub mod transport;

// Re-exports for convenience
pub use envelope::{CallId, Envelope, ErrorObject, Params, Request, Response, HANDLER_FAILURE};
pub use transport::{
    connect, connect_with_handler, Caller, Connection, ConnectionId, ConnectionState, Handler,
    HandlerError, HandlerFactory, MethodRouter, NoMethods, NoParams, Proxy, RpcConfig, RpcError,
    Server, ServerConfig, TransportError,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ParleyConfig, ParleyToml,
};
