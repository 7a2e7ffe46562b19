//! Chat Relay Handler
//!
//! Every connection gets the same set of methods. `send_message` fans the
//! text out to every other live connection by calling `receive_message` on
//! it, using the weak [`Caller`] each connection registered when it opened.
//!
//! ```text
//!   conn-1 ── send_message ──► Relay ──┬── receive_message ──► conn-2
//!                                      └── receive_message ──► conn-3
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use parley_core::{Caller, ConnectionId, HandlerError, MethodRouter, NoParams};

/// Method the relay calls on recipients
pub const RECEIVE_METHOD: &str = "receive_message";

#[derive(Debug, Deserialize)]
struct Text {
    text: String,
}

/// Payload of a `receive_message` push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incoming {
    /// Who sent the message (the sender's address)
    pub sender: String,
    /// Message body
    pub text: String,
}

/// Registry of connected peers shared by every connection's handler
#[derive(Clone, Default)]
pub struct Relay {
    peers: Arc<DashMap<ConnectionId, Caller>>,
}

impl Relay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the handler for a new connection and register its caller
    pub fn handler(&self, caller: Caller) -> MethodRouter {
        let id = caller.connection_id();
        self.peers.insert(id, caller.clone());
        info!(conn_id = %id, peer = %caller.peer_addr(), "Peer joined relay");

        let peers = Arc::clone(&self.peers);
        let watcher = caller.clone();
        tokio::spawn(async move {
            watcher.closed().await;
            peers.remove(&id);
            info!(conn_id = %id, "Peer left relay");
        });

        let peer_addr = caller.peer_addr().to_string();
        let relay = self.clone();

        MethodRouter::new()
            .route("echo", |p: Text| async move { Ok(p.text) })
            .route("ping", |_: NoParams| async { Ok("pong") })
            .route("peer_name", move |_: NoParams| {
                let name = peer_addr.clone();
                async move { Ok(name) }
            })
            .route("send_message", move |p: Text| {
                let relay = relay.clone();
                let sender = caller.clone();
                async move { Ok::<_, HandlerError>(relay.broadcast(&sender, p.text).await) }
            })
    }

    /// Deliver `text` to every live peer except `from`
    ///
    /// Returns how many peers acknowledged the message.
    pub async fn broadcast(&self, from: &Caller, text: String) -> usize {
        let message = Incoming {
            sender: from.peer_addr().to_string(),
            text,
        };
        let recipients: Vec<Caller> = self
            .peers
            .iter()
            .filter(|r| *r.key() != from.connection_id() && r.value().is_open())
            .map(|r| r.value().clone())
            .collect();

        let deliveries = recipients.iter().map(|peer| {
            let message = &message;
            async move {
                match peer.invoke::<_, serde_json::Value>(RECEIVE_METHOD, message).await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(conn_id = %peer.connection_id(), error = %e, "Delivery failed");
                        false
                    }
                }
            }
        });
        let delivered = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        debug!(
            from = %from.connection_id(),
            recipients = recipients.len(),
            delivered,
            "Message relayed"
        );
        delivered
    }

    /// Number of registered peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
