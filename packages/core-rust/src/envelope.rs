//! Request and response envelopes exchanged over the broker.
//!
//! A `Request` travels on the service's request stream; a `Response`
//! travels back on the caller's private response channel. Both are
//! serialized as a single opaque blob (see `codec`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::args::{CallArgs, Value};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Per-call correlation token. Unique without coordination (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh random request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-lifetime identity of a client or server instance.
///
/// Names the instance's private response channel, so two live instances
/// must never share one. 122 random bits make a collision negligible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh random connection identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

fn reply_expected() -> bool {
    true
}

/// A single method invocation, created by the client per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation token echoed back in the matching `Response`.
    pub request_id: RequestId,

    /// Name of the registered method to invoke.
    pub method: String,

    /// Identity of the caller; the response channel is derived from it.
    pub client_id: ConnectionId,

    /// Positional arguments, in call order.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,

    /// `false` for fire-and-forget publications: no reply is ever sent.
    #[serde(default = "reply_expected")]
    pub expects_reply: bool,
}

impl Request {
    /// Builds a call that expects a reply.
    #[must_use]
    pub fn call(method: impl Into<String>, client_id: ConnectionId, args: CallArgs) -> Self {
        Self {
            request_id: RequestId::generate(),
            method: method.into(),
            client_id,
            args: args.args,
            kwargs: args.kwargs,
            expects_reply: true,
        }
    }

    /// Builds a fire-and-forget publication.
    #[must_use]
    pub fn notification(method: impl Into<String>, client_id: ConnectionId, args: CallArgs) -> Self {
        Self {
            expects_reply: false,
            ..Self::call(method, client_id, args)
        }
    }

    /// Moves the arguments out, leaving the routing fields behind.
    #[must_use]
    pub fn take_args(&mut self) -> CallArgs {
        CallArgs {
            args: std::mem::take(&mut self.args),
            kwargs: std::mem::take(&mut self.kwargs),
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Outcome discriminant of a `Response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Reply to a `Request`, published on the caller's response channel.
///
/// `data` is present iff `status` is `Ok`; `error` is present iff `status`
/// is `Error`. The constructors are the only way this crate builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Logical service that produced the reply.
    pub service: String,

    /// Matches the originating `Request::request_id`.
    pub request_id: RequestId,

    pub status: ResponseStatus,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub fn ok(service: impl Into<String>, request_id: RequestId, data: Value) -> Self {
        Self {
            service: service.into(),
            request_id,
            status: ResponseStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(service: impl Into<String>, request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            request_id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Reply for a method the server has no registration for.
    #[must_use]
    pub fn not_registered(service: impl Into<String>, request_id: RequestId, method: &str) -> Self {
        Self::error(service, request_id, format!("Method {method} not registered"))
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Converts into the caller-visible outcome.
    ///
    /// A nil result may arrive without a `data` field (msgpack nil decodes
    /// as `None`), so a missing value on success is `Value::Nil`.
    ///
    /// # Errors
    ///
    /// Returns the remote error message when `status` is `Error`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.status {
            ResponseStatus::Ok => Ok(self.data.unwrap_or(Value::Nil)),
            ResponseStatus::Error => Err(self.error.unwrap_or_default()),
        }
    }
}
