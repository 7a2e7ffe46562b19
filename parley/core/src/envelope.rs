//! Protocol Envelopes
//!
//! Every message exchanged between two parley peers is an [`Envelope`]: either a
//! [`Request`] naming a remote method, or a [`Response`] answering one.
//!
//! # Wire Shape
//!
//! ```text
//! Request:  {"jsonrpc":"2.0","method":"echo","params":{"text":"hi"},"id":0}
//! Success:  {"jsonrpc":"2.0","id":0,"result":"hi"}
//! Failure:  {"jsonrpc":"2.0","id":1,"error":{"code":500,"message":"nope not found"}}
//! ```
//!
//! There is no explicit tag. An object carrying a `method` key is a request,
//! anything else is a response. Both sides of a connection speak the same
//! format, so a server can push requests to its clients just as clients call
//! the server.

use std::fmt;

use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version marker carried by every envelope
pub const PROTOCOL_VERSION: &str = "2.0";

/// Error code used for every handler-side failure
pub const HANDLER_FAILURE: i64 = 500;

/// Named-argument mapping passed with a request
pub type Params = Map<String, Value>;

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Correlation id pairing a request with its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A call to a named method on the peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version marker
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    /// Name of the remote method
    pub method: String,
    /// Named arguments
    #[serde(default)]
    pub params: Params,
    /// Correlation id, echoed by the response
    pub id: CallId,
}

impl Request {
    /// Build a request for `method` with the given id and arguments
    #[must_use]
    pub fn new(id: CallId, method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: protocol_version(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Error payload of a failed call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code (500 for handler failures)
    pub code: i64,
    /// Human-readable description
    pub message: String,
}

/// The answer to a [`Request`]
///
/// A response carries either a result or an error, never both. Use
/// [`Response::success`] and [`Response::failure`] to build one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version marker
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    /// Id of the request being answered
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

impl Response {
    /// Successful response carrying `result`
    #[must_use]
    pub fn success(id: CallId, result: Value) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response carrying an error code and message
    #[must_use]
    pub fn failure(id: CallId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    /// Whether this response reports a failure
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The error payload, if any
    #[must_use]
    pub fn error(&self) -> Option<&ErrorObject> {
        self.error.as_ref()
    }

    /// The result payload; `null` for failures
    #[must_use]
    pub fn result(&self) -> &Value {
        self.result.as_ref().unwrap_or(&Value::Null)
    }

    /// Consume the response into the call outcome
    ///
    /// An error payload wins if a misbehaving peer sent both. A missing
    /// result (including an explicit `null`) is a successful `null`.
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// One complete protocol message
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Inbound or outbound method call
    Request(Request),
    /// Answer to an earlier call
    Response(Response),
}

impl Envelope {
    /// Correlation id of either variant
    #[must_use]
    pub fn id(&self) -> CallId {
        match self {
            Self::Request(req) => req.id,
            Self::Response(resp) => resp.id,
        }
    }

    /// Classify a decoded JSON value
    ///
    /// # Errors
    ///
    /// Fails if the value is not an object or does not match the request
    /// or response shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let is_request = match &value {
            Value::Object(obj) => obj.contains_key("method"),
            _ => {
                return Err(serde_json::Error::custom(
                    "envelope must be a JSON object",
                ))
            }
        };

        if is_request {
            serde_json::from_value(value).map(Self::Request)
        } else {
            serde_json::from_value(value).map(Self::Response)
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

impl From<Request> for Envelope {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for Envelope {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}
