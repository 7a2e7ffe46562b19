//! Call Proxy
//!
//! [`Proxy`] is the caller-facing handle to a connection. Any number of
//! tasks may call through clones of the same proxy at once; replies are
//! matched by correlation id, so they may arrive in any order.
//!
//! [`Caller`] is the weak variant handed to a connection's own handler so it
//! can push requests back to the peer without keeping the connection alive.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;

use super::config::RpcConfig;
use super::connection::{Connection, ConnectionId, ConnectionState, CLOSE_METHOD};
use super::dispatch::{HandlerFactory, NoMethods};
use super::{RpcError, TransportError};
use crate::envelope::{Params, Request};

/// Handle for calling methods on the peer of one connection
///
/// Dropping every clone does not close the connection: the read loop keeps
/// the socket until the peer hangs up. Call [`Proxy::close`] to release it.
#[derive(Clone)]
pub struct Proxy {
    conn: Arc<Connection>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Proxy").field(&self.conn).finish()
    }
}

impl Proxy {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Call `method` on the peer with the configured call timeout
    ///
    /// # Errors
    ///
    /// `Remote` if the peer answered with an error, `Timeout` if no reply
    /// arrived in time, `Transport` if the connection is not open.
    pub async fn call(&self, method: &str, params: Params) -> Result<Value, RpcError> {
        let timeout = self.conn.config().call_timeout();
        self.call_with_timeout(method, params, timeout).await
    }

    /// Call `method` on the peer, waiting at most `timeout` for the reply
    ///
    /// A reply arriving after the timeout is logged and discarded.
    ///
    /// # Errors
    ///
    /// See [`Proxy::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        call_on(&self.conn, method, params, timeout).await
    }

    /// Call `method` with typed arguments and a typed result
    ///
    /// `params` must serialize to a JSON object (or unit / `None` for no
    /// arguments).
    ///
    /// # Errors
    ///
    /// `InvalidParams` / `InvalidResult` on conversion failures, otherwise as
    /// [`Proxy::call`].
    pub async fn invoke<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        invoke_on(&self.conn, method, params).await
    }

    /// Close the connection
    ///
    /// Asks the peer to stop first, then shuts the socket down and waits for
    /// the read loop to finish. Safe to call more than once.
    pub async fn close(&self) {
        if self.conn.is_open() {
            let timeout = self.conn.config().call_timeout();
            if let Err(e) = call_on(&self.conn, CLOSE_METHOD, Params::new(), timeout).await {
                tracing::debug!(conn_id = %self.conn.id(), error = %e, "close request not acknowledged");
            }
        }
        self.conn.close().await;
        self.conn.closed().await;
    }

    /// Wait until the connection is closed, by either side
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Connection identifier
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Whether calls can still be made
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Number of calls waiting for a reply
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.conn.pending_calls()
    }

    /// Weak handle to the same connection
    #[must_use]
    pub fn caller(&self) -> Caller {
        Caller::new(
            self.conn.id(),
            self.conn.peer_addr(),
            Arc::downgrade(&self.conn),
            self.conn.watch_state(),
        )
    }
}

/// Weak handle a handler uses to call back into its own peer
///
/// Calls fail with `ConnectionClosed` once the connection has been dropped.
/// The lifecycle state stays observable even while the connection is still
/// being built, when the weak reference cannot be upgraded yet.
#[derive(Clone)]
pub struct Caller {
    id: ConnectionId,
    peer_addr: SocketAddr,
    conn: Weak<Connection>,
    state: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Caller {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        conn: Weak<Connection>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            conn,
            state,
        }
    }

    /// Call `method` on the peer with the configured timeout
    ///
    /// # Errors
    ///
    /// As [`Proxy::call`].
    pub async fn call(&self, method: &str, params: Params) -> Result<Value, RpcError> {
        let conn = self.upgrade()?;
        let timeout = conn.config().call_timeout();
        call_on(&conn, method, params, timeout).await
    }

    /// Typed variant of [`Caller::call`]
    ///
    /// # Errors
    ///
    /// As [`Proxy::invoke`].
    pub async fn invoke<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let conn = self.upgrade()?;
        invoke_on(&conn, method, params).await
    }

    /// Strong proxy for the connection, if it still exists
    #[must_use]
    pub fn proxy(&self) -> Option<Proxy> {
        self.conn.upgrade().map(Proxy::new)
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Connection identifier
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state of the connection
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        // An error means the connection is gone, which counts as closed
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn upgrade(&self) -> Result<Arc<Connection>, TransportError> {
        self.conn.upgrade().ok_or(TransportError::ConnectionClosed)
    }
}

async fn call_on(
    conn: &Connection,
    method: &str,
    params: Params,
    timeout: Duration,
) -> Result<Value, RpcError> {
    if conn.state() >= ConnectionState::Closing {
        return Err(TransportError::ConnectionClosed.into());
    }

    let id = conn.next_call_id();
    let pending = conn.pending().register(id)?;

    // Dropping `pending` on any early return deregisters the call
    let request = Request::new(id, method, params);
    conn.send(&request.into()).await?;
    tracing::debug!(conn_id = %conn.id(), id = %id, method, "request sent");

    match conn.pending().wait(pending, timeout).await? {
        Some(response) => response.into_outcome().map_err(RpcError::from),
        None => Err(RpcError::Timeout {
            method: method.to_string(),
            id,
            timeout,
        }),
    }
}

async fn invoke_on<P, R>(conn: &Connection, method: &str, params: &P) -> Result<R, RpcError>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let params = to_params(params).map_err(|reason| RpcError::InvalidParams {
        method: method.to_string(),
        reason,
    })?;

    let value = call_on(conn, method, params, conn.config().call_timeout()).await?;

    serde_json::from_value(value).map_err(|e| RpcError::InvalidResult {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn to_params<P: Serialize + ?Sized>(params: &P) -> Result<Params, String> {
    match serde_json::to_value(params).map_err(|e| e.to_string())? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => Err(format!("expected named arguments, got {other}")),
    }
}

/// Connect to `addr` as a pure client
///
/// The peer can still call us; every such call is answered with a
/// not-found error.
///
/// # Errors
///
/// `ConnectionFailed` if the dial fails, `ConnectTimeout` if it takes longer
/// than the configured connect timeout.
pub async fn connect<A>(addr: A, config: RpcConfig) -> Result<Proxy, TransportError>
where
    A: ToSocketAddrs + fmt::Display,
{
    connect_with_handler(addr, |_: Caller| NoMethods, config).await
}

/// Connect to `addr` and serve the peer's calls with the handler `factory`
/// builds
///
/// # Errors
///
/// As [`connect`].
pub async fn connect_with_handler<A, F>(
    addr: A,
    factory: F,
    config: RpcConfig,
) -> Result<Proxy, TransportError>
where
    A: ToSocketAddrs + fmt::Display,
    F: HandlerFactory,
{
    let timeout = config.connect_timeout();
    let target = addr.to_string();

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(addr = %target, error = %e, "Failed to connect");
            return Err(TransportError::ConnectionFailed(format!("{target}: {e}")));
        }
        Err(_) => {
            tracing::warn!(addr = %target, ?timeout, "Connection timed out");
            return Err(TransportError::ConnectTimeout {
                addr: target,
                timeout,
            });
        }
    };

    let conn = Connection::spawn(stream, &factory, config)?;
    tracing::info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Connected");
    Ok(Proxy::new(conn))
}
