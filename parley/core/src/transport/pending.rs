//! Pending-Call Table
//!
//! Correlates outbound requests with the responses the read loop decodes.
//! Each in-flight call owns a one-shot slot keyed by its [`CallId`]; the
//! read loop fills the slot, the caller awaits it.
//!
//! ```text
//!   caller                       table                      read loop
//!     │ register(id) ──────────► insert(id, tx)
//!     │ send request
//!     │ wait(call, timeout) ···· rx.await
//!     │                          remove(id) ◄──────────────── resolve(response)
//!     │ ◄─────────────────────── tx.send(response)
//! ```
//!
//! The lock only guards table mutation; waiting happens on the one-shot
//! receiver outside the lock. Replies for ids nobody is waiting on (late,
//! duplicate, spoofed) are logged and dropped.
//!
//! A [`PendingCall`] dropped before its reply arrives (the caller's future
//! was cancelled) removes its own slot, so the table only ever holds calls
//! somebody is still waiting for.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::TransportError;
use crate::envelope::{CallId, Response};

/// Handle for one registered call
///
/// Dropping the handle deregisters the call.
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<Response>,
    table: Weak<Mutex<PendingInner>>,
}

impl PendingCall {
    /// Correlation id of this call
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        if table.lock().calls.remove(&self.id).is_some() {
            tracing::debug!(id = %self.id, "abandoned call removed from pending table");
        }
    }
}

#[derive(Debug, Default)]
struct PendingInner {
    calls: HashMap<CallId, oneshot::Sender<Response>>,
    closed: bool,
}

/// Table of calls awaiting a response on one connection
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<PendingInner>>,
}

impl PendingCalls {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot for `id`
    ///
    /// Must happen before the request is written so a fast reply always
    /// finds its slot.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the table has been failed, `InvalidState` if
    /// `id` already has an outstanding call.
    pub fn register(&self, id: CallId) -> Result<PendingCall, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if inner.calls.contains_key(&id) {
            return Err(TransportError::InvalidState(format!(
                "call id {id} is already pending"
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.calls.insert(id, tx);
        tracing::trace!(id = %id, pending = inner.calls.len(), "registered pending call");
        Ok(PendingCall {
            id,
            rx,
            table: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver a response to its waiting caller
    ///
    /// Returns `false` if no caller was waiting for this id.
    pub fn resolve(&self, response: Response) -> bool {
        let id = response.id;
        let waiter = self.inner.lock().calls.remove(&id);

        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!(id = %id, "caller gave up before the reply was delivered");
                    return false;
                }
                true
            }
            None => {
                tracing::warn!(id = %id, "dropping response for unknown call id");
                false
            }
        }
    }

    /// Wait for the response to `call`
    ///
    /// Returns `Ok(None)` when `timeout` elapses; the slot is removed so a
    /// late reply is treated as unknown.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the connection went away while waiting.
    pub async fn wait(
        &self,
        mut call: PendingCall,
        timeout: Duration,
    ) -> Result<Option<Response>, TransportError> {
        let id = call.id;
        let rx = &mut call.rx;

        match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                let removed = self.inner.lock().calls.remove(&id).is_some();
                if !removed {
                    // Resolved between the timer firing and the removal
                    if let Ok(response) = rx.try_recv() {
                        return Ok(Some(response));
                    }
                }
                tracing::debug!(id = %id, ?timeout, "pending call timed out");
                Ok(None)
            }
        }
    }

    /// Fail every outstanding call and refuse new registrations
    ///
    /// Returns how many callers were woken.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.calls.drain().collect()
        };
        // Dropping the senders wakes every receiver with an error
        drained.len()
    }

    /// Number of outstanding calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Whether no calls are outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table has been failed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
