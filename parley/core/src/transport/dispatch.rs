//! Request Dispatch
//!
//! Turns an inbound [`Request`] into a call on the connection's application
//! [`Handler`] and the handler's outcome into a [`Response`].
//!
//! Each request runs on its own task so a slow method never stalls the read
//! loop (which must keep delivering replies to concurrent outbound calls).
//! A per-connection semaphore caps how many handler bodies run at once.
//!
//! Every failure, whether an unknown method, bad arguments, an error
//! returned by the handler or a panic inside it, becomes a code-500 error
//! response echoing the request id.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::Instrument;

use super::proxy::Caller;
use crate::envelope::{Params, Request, Response, HANDLER_FAILURE};

/// Failure raised by an application handler
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler has no method with this name
    #[error("{0} not found")]
    MethodNotFound(String),

    /// The named arguments do not match the method's parameters
    #[error("invalid params for {method}: {reason}")]
    InvalidParams {
        /// Method that was called
        method: String,
        /// Why the arguments were rejected
        reason: String,
    },

    /// The method ran and failed
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Wrap any displayable failure
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Application-side object exposing named remote methods
///
/// One instance serves one connection.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Invoke `method` with its named arguments
    async fn call(&self, method: &str, params: Params) -> Result<Value, HandlerError>;
}

/// Builds the handler for each new connection
///
/// The [`Caller`] lets the handler issue its own requests back to the peer
/// (server push). Any `Fn(Caller) -> impl Handler` closure is a factory.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Create the handler for a freshly opened connection
    fn create(&self, caller: Caller) -> Arc<dyn Handler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(Caller) -> H + Send + Sync + 'static,
    H: Handler,
{
    fn create(&self, caller: Caller) -> Arc<dyn Handler> {
        Arc::new(self(caller))
    }
}

/// Handler with no methods, for peers that only make calls
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMethods;

#[async_trait]
impl Handler for NoMethods {
    async fn call(&self, method: &str, _params: Params) -> Result<Value, HandlerError> {
        Err(HandlerError::MethodNotFound(method.to_string()))
    }
}

/// Parameter type for methods taking no arguments
#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

type MethodFuture = BoxFuture<'static, Result<Value, HandlerError>>;
type BoxedMethod = Box<dyn Fn(Params) -> MethodFuture + Send + Sync>;

/// A [`Handler`] built from typed async closures
///
/// Each method's parameters are deserialized from the request's named
/// arguments, so the parameter struct's field names are the wire names.
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct Echo { text: String }
///
/// let router = MethodRouter::new()
///     .route("echo", |args: Echo| async move { Ok(args.text) })
///     .route("ping", |_: NoParams| async { Ok("pong") });
/// ```
#[derive(Default)]
pub struct MethodRouter {
    methods: HashMap<String, BoxedMethod>,
}

impl MethodRouter {
    /// Create a router with no methods
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any earlier method of that name
    #[must_use]
    pub fn route<P, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let method = name.to_string();
        let boxed: BoxedMethod = Box::new(move |params: Params| -> MethodFuture {
            match serde_json::from_value::<P>(Value::Object(params)) {
                Ok(args) => {
                    let fut = f(args);
                    let method = method.clone();
                    async move {
                        let result = fut.await?;
                        serde_json::to_value(result).map_err(|e| {
                            HandlerError::Failed(format!(
                                "{method} returned an unserializable value: {e}"
                            ))
                        })
                    }
                    .boxed()
                }
                Err(e) => {
                    let err = HandlerError::InvalidParams {
                        method: method.clone(),
                        reason: e.to_string(),
                    };
                    async move { Err(err) }.boxed()
                }
            }
        });

        self.methods.insert(name.to_string(), boxed);
        self
    }
}

#[async_trait]
impl Handler for MethodRouter {
    async fn call(&self, method: &str, params: Params) -> Result<Value, HandlerError> {
        match self.methods.get(method) {
            Some(f) => f(params).await,
            None => Err(HandlerError::MethodNotFound(method.to_string())),
        }
    }
}

/// Runs inbound requests against a connection's handler
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a dispatcher allowing `max_concurrent` handler bodies at once
    pub fn new(handler: Arc<dyn Handler>, max_concurrent: usize) -> Self {
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Invoke the handler for `request` and build the response
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            method, params, id, ..
        } = request;

        let outcome = AssertUnwindSafe(self.handler.call(&method, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Response::success(id, value),
            Ok(Err(err)) => {
                tracing::debug!(id = %id, method = %method, error = %err, "handler failed");
                Response::failure(id, HANDLER_FAILURE, err.to_string())
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(id = %id, method = %method, reason = %reason, "handler panicked");
                Response::failure(id, HANDLER_FAILURE, format!("{method} panicked: {reason}"))
            }
        }
    }

    /// Handle `request` on a new task and pass the response to `reply`
    pub fn spawn<F, Fut>(&self, request: Request, reply: F)
    where
        F: FnOnce(Response) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(
            async move {
                let Ok(_permit) = Arc::clone(&dispatcher.permits).acquire_owned().await else {
                    return;
                };
                let response = dispatcher.handle(request).await;
                reply(response).await;
            }
            .in_current_span(),
        );
    }
}
