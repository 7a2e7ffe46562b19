//! Connection and Read Loop
//!
//! A [`Connection`] owns one TCP socket for its whole life. A dedicated task
//! reads from the socket, splits the byte stream into envelopes and routes
//! each one:
//!
//! ```text
//!              ┌──────────────┐   Response   ┌───────────────┐
//!   socket ──► │  read loop   ├─────────────►│ PendingCalls  │──► waiting Proxy::call
//!              │ FrameDecoder │              └───────────────┘
//!              │              │   Request    ┌───────────────┐
//!              │              ├─────────────►│  Dispatcher   │──► Handler (own task)
//!              └──────────────┘              └───────┬───────┘
//!                                                    │ Response
//!   socket ◄── writer task ◄── outbound queue ◄──────┘
//! ```
//!
//! Every frame goes through a single writer task that owns the write half,
//! so a caller giving up mid-call can never leave half a frame on the wire.
//!
//! # Lifecycle
//!
//! `Created → Open → Closing → Closed`. The loop ends on EOF, on a socket
//! error, on a malformed frame, on [`Connection::close_later`] (after the
//! current read buffer is drained) or on [`Connection::close`] (at once).
//! A `close` request from the peer is the last frame routed; anything the
//! peer sent after it is discarded.
//! Whatever the cause, every call still waiting for a reply fails with
//! `ConnectionClosed` and the socket is released.
//!
//! The socket read is bounded by the configured poll interval so the `open`
//! state is re-checked even when the peer is silent.

use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::config::RpcConfig;
use super::dispatch::{Dispatcher, HandlerFactory};
use super::frame::{FrameDecoder, FrameEncoder};
use super::pending::PendingCalls;
use super::proxy::Caller;
use super::TransportError;
use crate::envelope::{CallId, Envelope, Request, Response};

/// Pseudo-method asking the receiving side to stop reading
pub const CLOSE_METHOD: &str = "close";

/// Frames queued for the writer task before senders wait
const OUTBOUND_QUEUE: usize = 64;

/// Process-unique identifier for a connection
///
/// Assigned when the connection is created and stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection
///
/// States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Socket wrapped, read loop not yet running
    Created,
    /// Read loop running
    Open,
    /// Shutting down; no new outbound calls
    Closing,
    /// Socket released (terminal)
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why the read loop stopped
#[derive(Debug)]
enum CloseReason {
    Local,
    Peer,
    Eof,
    Io(std::io::Error),
    Protocol(TransportError),
}

/// One socket, its read loop and its write path
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    config: RpcConfig,
    state: watch::Sender<ConnectionState>,
    /// Wakes the read loop when a close is requested
    wake: Notify,
    /// Queue into the writer task; `None` once the write side is shut
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    encoder: FrameEncoder,
    pending: PendingCalls,
    next_id: AtomicU64,
    dispatcher: Dispatcher,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap `stream` and start its read loop
    ///
    /// The handler for this connection is created by `factory` with a
    /// [`Caller`] pointing back at the connection.
    pub(crate) fn spawn(
        stream: TcpStream,
        factory: &dyn HandlerFactory,
        config: RpcConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = enable_keepalive(&stream) {
            tracing::warn!(peer = %peer_addr, error = %e, "Failed to enable TCP keep-alive");
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let id = ConnectionId::new();
        let span = tracing::info_span!("connection", conn_id = %id, peer = %peer_addr);

        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(writer, queue).instrument(span.clone()));

        let (state, state_rx) = watch::channel(ConnectionState::Created);
        let conn = Arc::new_cyclic(|weak| {
            let handler = factory.create(Caller::new(id, peer_addr, weak.clone(), state_rx));
            Self {
                id,
                peer_addr,
                state,
                wake: Notify::new(),
                outbound: Mutex::new(Some(outbound)),
                writer: Mutex::new(Some(writer)),
                encoder: FrameEncoder::with_max_frame_size(config.max_frame_size),
                pending: PendingCalls::new(),
                next_id: AtomicU64::new(0),
                dispatcher: Dispatcher::new(handler, config.max_concurrent_requests),
                config,
            }
        });

        conn.transition(ConnectionState::Open);
        tokio::spawn(Arc::clone(&conn).read_loop(reader).instrument(span));

        Ok(conn)
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address captured when the connection was created
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Configuration this connection runs with
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the read loop is still running and accepting calls
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of outbound calls waiting for a reply
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Receiver observing this connection's state changes
    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the connection reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Stop the read loop once the current buffer has been handled
    pub fn close_later(&self) {
        if self.transition(ConnectionState::Closing) {
            tracing::debug!(conn_id = %self.id, "graceful close scheduled");
        }
        self.wake.notify_one();
    }

    /// Shut the socket down now
    ///
    /// Frames already queued are still flushed. Idempotent; closing a closed
    /// connection does nothing.
    pub async fn close(&self) {
        if self.transition(ConnectionState::Closing) {
            tracing::debug!(conn_id = %self.id, "closing connection");
        }
        self.wake.notify_one();
        self.shutdown_writer().await;
    }

    /// Allocate the next correlation id
    pub(crate) fn next_call_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Queue one envelope for the writer task
    ///
    /// A frame is either queued whole or not at all, so cancelling the
    /// returned future never corrupts the stream.
    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = self.encoder.encode(envelope)?;

        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Move the state forward; returns whether it changed
    fn transition(&self, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Stop accepting frames and wait for the writer to flush the queue
    ///
    /// A writer stuck on a peer that stopped reading is aborted after the
    /// call timeout.
    async fn shutdown_writer(&self) {
        drop(self.outbound.lock().take());

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let abort = writer.abort_handle();
            let timeout = self.config.call_timeout();
            if tokio::time::timeout(timeout, writer).await.is_err() {
                tracing::warn!(conn_id = %self.id, ?timeout, "Writer did not drain in time, aborting");
                abort.abort();
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        tracing::debug!("Read loop started");

        let mut decoder = FrameDecoder::with_max_frame_size(self.config.max_frame_size);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let poll = self.config.read_poll_interval();

        let reason = 'read: loop {
            if self.state() >= ConnectionState::Closing {
                break CloseReason::Local;
            }

            let read = tokio::select! {
                () = self.wake.notified() => continue,
                read = tokio::time::timeout(poll, reader.read(&mut buf)) => read,
            };

            let n = match read {
                // Idle poll, re-check the state
                Err(_) => continue,
                Ok(Ok(0)) => break CloseReason::Eof,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break CloseReason::Io(e),
            };

            decoder.push(&buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(envelope)) => {
                        if self.route(envelope).await.is_break() {
                            break 'read CloseReason::Peer;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'read CloseReason::Protocol(e),
                }
            }
        };

        match &reason {
            CloseReason::Local => tracing::debug!("Read loop stopped on request"),
            CloseReason::Peer => {
                let discarded = decoder.available();
                tracing::info!(discarded_bytes = discarded, "Read loop stopped at peer's close request");
            }
            CloseReason::Eof => tracing::info!("Peer closed the connection (EOF)"),
            CloseReason::Io(e) => tracing::warn!(error = %e, "Read error"),
            CloseReason::Protocol(e) => {
                tracing::warn!(error = %e, "Malformed frame, closing connection");
            }
        }

        drop(reader);
        self.finish().await;
    }

    /// Route one decoded envelope
    ///
    /// Breaks after a `close` request, which must be the last frame handled.
    async fn route(self: &Arc<Self>, envelope: Envelope) -> ControlFlow<()> {
        match envelope {
            Envelope::Response(response) => {
                tracing::trace!(id = %response.id, "received response");
                self.pending.resolve(response);
            }
            Envelope::Request(request) if request.method == CLOSE_METHOD => {
                tracing::info!(id = %request.id, "Peer requested close");
                let ack = Response::success(request.id, Value::Bool(true));
                if let Err(e) = self.send(&ack.into()).await {
                    tracing::debug!(error = %e, "Failed to acknowledge close");
                }
                self.close_later();
                return ControlFlow::Break(());
            }
            Envelope::Request(request) => self.dispatch(request),
        }
        ControlFlow::Continue(())
    }

    fn dispatch(self: &Arc<Self>, request: Request) {
        tracing::debug!(id = %request.id, method = %request.method, "Dispatching request");
        let conn = Arc::clone(self);
        self.dispatcher.spawn(request, move |response| async move {
            let id = response.id;
            if let Err(e) = conn.send(&response.into()).await {
                tracing::debug!(id = %id, error = %e, "Failed to send response");
            }
        });
    }

    /// Tear down after the read loop exits
    async fn finish(&self) {
        self.transition(ConnectionState::Closing);
        let failed = self.pending.fail_all();
        self.shutdown_writer().await;
        self.transition(ConnectionState::Closed);
        tracing::info!(failed_calls = failed, "Connection closed");
    }
}

/// Drain `queue` onto the socket, one whole frame at a time
///
/// Shuts the write half down once every sender is gone.
async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!(error = %e, "Write error, dropping outbound queue");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "socket shutdown failed");
    }
}

/// Enable `SO_KEEPALIVE` on a TCP socket
#[cfg(unix)]
fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;

    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Enable `SO_KEEPALIVE` (non-Unix fallback)
#[cfg(not(unix))]
fn enable_keepalive(_stream: &TcpStream) -> std::io::Result<()> {
    tracing::debug!("TCP keep-alive skipped (non-Unix platform)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::dispatch::NoMethods;
    use crate::transport::frame::{encode, FRAME_TERMINATOR};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn fast_config() -> RpcConfig {
        RpcConfig::default().with_read_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        assert!(format!("{id}").starts_with("conn-"));
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_state_ordering() {
        assert!(ConnectionState::Created < ConnectionState::Open);
        assert!(ConnectionState::Open < ConnectionState::Closing);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_spawn_opens_connection() {
        let (client, _server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.next_call_id(), CallId(0));
        assert_eq!(conn.next_call_id(), CallId(1));

        conn.close().await;
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_eof_closes() {
        let (client, server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        drop(server);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();

        let result = conn.send(&Response::success(CallId(0), Value::Null).into()).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        conn.close().await;
        conn.close().await;
        conn.close_later();
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_later_stops_idle_loop() {
        let (client, _server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        conn.close_later();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes() {
        let (client, mut server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        server.write_all(b"{not json").await.unwrap();
        server.write_all(&FRAME_TERMINATOR).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_request_is_acknowledged() {
        let (client, mut server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        let close = Request::new(CallId(0), CLOSE_METHOD, Default::default());
        server.write_all(&encode(&close.into()).unwrap()).await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();

        let (frames, rest) = crate::transport::frame::decode_stream(&received).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            frames,
            vec![Envelope::Response(Response::success(CallId(0), Value::Bool(true)))]
        );

        conn.closed().await;
    }

    #[tokio::test]
    async fn test_frames_after_close_request_are_discarded() {
        let (client, mut server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        // Both frames land in the same read; only the close is answered
        let close = Request::new(CallId(0), CLOSE_METHOD, Default::default());
        let echo = Request::new(CallId(1), "echo", Default::default());
        let mut bytes = encode(&close.into()).unwrap();
        bytes.extend(encode(&echo.into()).unwrap());
        server.write_all(&bytes).await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();

        let (frames, _) = crate::transport::frame::decode_stream(&received).unwrap();
        assert_eq!(
            frames,
            vec![Envelope::Response(Response::success(CallId(0), Value::Bool(true)))]
        );
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_send_after_close_is_refused() {
        let (client, _server) = socket_pair().await;
        let conn = Connection::spawn(client, &|_: Caller| NoMethods, fast_config()).unwrap();

        conn.close().await;
        let result = conn.send(&Response::success(CallId(0), Value::Null).into()).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
