//! TCP Server
//!
//! Accepts connections and gives each one its own read loop and handler:
//!
//! ```text
//!                        Server
//!                          │ accept
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!      conn-1          conn-2          conn-3
//!   (Connection +   (Connection +   (Connection +
//!     Handler)        Handler)        Handler)
//! ```
//!
//! Connections are tracked until they close, whichever side closes them.
//! Shutdown is requested by setting the flag passed to [`Server::run`]; the
//! accept loop notices it within 100 ms and closes every live connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::config::{RpcConfig, ServerConfig};
use super::connection::{Connection, ConnectionId};
use super::dispatch::HandlerFactory;
use super::proxy::Proxy;
use super::TransportError;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

struct Tracked {
    proxy: Proxy,
    connected_at: Instant,
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer_addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Calls this side is still waiting on
    pub pending_calls: usize,
}

/// Listening socket plus the set of live connections
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    rpc: RpcConfig,
    connections: Arc<DashMap<ConnectionId, Tracked>>,
}

impl Server {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// `Io` if the address cannot be bound.
    pub async fn bind(config: ServerConfig, rpc: RpcConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Listening for connections");

        Ok(Self {
            listener,
            config,
            rpc,
            connections: Arc::new(DashMap::new()),
        })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// `Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Proxies for every live connection
    #[must_use]
    pub fn connections(&self) -> Vec<Proxy> {
        self.connections.iter().map(|r| r.value().proxy.clone()).collect()
    }

    /// Per-connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connections
            .iter()
            .map(|r| {
                let tracked = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer_addr: tracked.proxy.peer_addr(),
                        connected_at: tracked.connected_at,
                        pending_calls: tracked.proxy.pending_calls(),
                    },
                )
            })
            .collect()
    }

    /// Accept connections until `shutdown` is set
    ///
    /// Every accepted connection is served by a handler from `factory`. On
    /// shutdown all live connections are closed before this returns.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and skipped; this only fails on setup.
    pub async fn run(
        &self,
        factory: Arc<dyn HandlerFactory>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), TransportError> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let (stream, addr) = match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await
            {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connections.len() >= self.config.max_connections {
                warn!(peer = %addr, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn = match Connection::spawn(stream, &*factory, self.rpc.clone()) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "Failed to set up connection");
                    continue;
                }
            };

            let conn_id = conn.id();
            let proxy = Proxy::new(conn);
            self.connections.insert(
                conn_id,
                Tracked {
                    proxy: proxy.clone(),
                    connected_at: Instant::now(),
                },
            );
            info!(
                conn_id = %conn_id,
                peer = %addr,
                active_connections = self.connections.len(),
                "New connection accepted"
            );

            let connections = Arc::clone(&self.connections);
            tokio::spawn(async move {
                proxy.closed().await;
                connections.remove(&conn_id);
                info!(
                    conn_id = %conn_id,
                    active_connections = connections.len(),
                    "Connection finished"
                );
            });
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let proxies = self.connections();
        debug!(count = proxies.len(), "Closing connections");
        futures::future::join_all(proxies.iter().map(Proxy::close)).await;
        self.connections.clear();

        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::dispatch::NoMethods;
    use crate::transport::proxy::{connect, Caller};

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    fn fast_rpc() -> RpcConfig {
        RpcConfig::default().with_read_poll_interval(Duration::from_millis(20))
    }

    async fn wait_for_count(server: &Server, expected: usize) {
        for _ in 0..100 {
            if server.connection_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} connections, have {}",
            server.connection_count()
        );
    }

    #[tokio::test]
    async fn test_tracks_and_forgets_connections() {
        let server = Arc::new(Server::bind(local_config(), fast_rpc()).await.unwrap());
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = {
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                server
                    .run(Arc::new(|_: Caller| NoMethods), shutdown)
                    .await
            })
        };

        let client = connect(addr, fast_rpc()).await.unwrap();
        wait_for_count(&server, 1).await;
        assert_eq!(server.connection_stats().len(), 1);

        client.close().await;
        wait_for_count(&server, 0).await;

        shutdown.store(true, Ordering::SeqCst);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..local_config()
        };
        let server = Arc::new(Server::bind(config, fast_rpc()).await.unwrap());
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = {
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                server
                    .run(Arc::new(|_: Caller| NoMethods), shutdown)
                    .await
            })
        };

        let first = connect(addr, fast_rpc()).await.unwrap();
        wait_for_count(&server, 1).await;

        let second = connect(addr, fast_rpc()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.closed())
            .await
            .expect("rejected connection should see EOF");
        assert!(first.is_open());

        shutdown.store(true, Ordering::SeqCst);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let server = Arc::new(Server::bind(local_config(), fast_rpc()).await.unwrap());
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = {
            let server = Arc::clone(&server);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                server
                    .run(Arc::new(|_: Caller| NoMethods), shutdown)
                    .await
            })
        };

        let client = connect(addr, fast_rpc()).await.unwrap();
        wait_for_count(&server, 1).await;

        shutdown.store(true, Ordering::SeqCst);
        runner.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("client should observe server shutdown");
        assert_eq!(server.connection_count(), 0);
    }
}
