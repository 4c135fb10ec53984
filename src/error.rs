//! Error taxonomy for remote calls.
//!
//! The wire cannot carry language-level exceptions, so a handler signals
//! failure by *returning* an object with an `error` key. [`RemoteError`]
//! is the client-side view of that object. Everything else in this module
//! describes failures that happen on our side of the wire.

use std::borrow::Cow;

use serde::Serialize;
use serde_json::{json, Value};

/// Message the WebSocket layer reports when the server is unreachable.
pub const WEBSOCKET_ERROR_MESSAGE: &str = "websocket error";

/// Error identity substituted for [`WEBSOCKET_ERROR_MESSAGE`].
pub const OFFLINE_NO_CACHE: &str = "offline_no_cache";

/// Structured error returned by a server handler.
///
/// Wraps the acknowledged object exactly as the handler returned it, extra
/// keys included. Accessors read the well-known fields of both wire shapes:
/// the scoped `{error, message, selector}` form and the shorter
/// `{error, errorDetails}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RemoteError {
    payload: Value,
}

impl RemoteError {
    /// Build a scoped error (`{error, message, selector}`).
    pub fn scoped(
        error: impl Into<String>,
        message: impl Into<String>,
        selector: impl Into<String>,
    ) -> Self {
        Self {
            payload: json!({
                "error": error.into(),
                "message": message.into(),
                "selector": selector.into(),
            }),
        }
    }

    /// Detect the structural error marker in an acknowledgment payload.
    ///
    /// Any JSON object carrying an `error` key is an error.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload.as_object()?.get("error")?;
        Some(Self {
            payload: payload.clone(),
        })
    }

    /// Error discriminant. Non-string discriminants are rendered as JSON.
    pub fn error(&self) -> Cow<'_, str> {
        match self.get("error") {
            Some(Value::String(error)) => Cow::Borrowed(error),
            Some(other) => Cow::Owned(other.to_string()),
            None => Cow::Borrowed(""),
        }
    }

    /// Human-readable message, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.get("message").and_then(Value::as_str)
    }

    /// UI selector the error refers to.
    pub fn selector(&self) -> Option<&str> {
        self.get("selector").and_then(Value::as_str)
    }

    /// Free-form details of the short form.
    pub fn error_details(&self) -> Option<&str> {
        self.get("errorDetails").and_then(Value::as_str)
    }

    /// Any field of the acknowledged object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The acknowledged object, unchanged.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Owned copy of the acknowledged object.
    pub fn to_value(&self) -> Value {
        self.payload.clone()
    }

    /// Unwrap into the acknowledged object.
    pub fn into_value(self) -> Value {
        self.payload
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = self
            .get("message")
            .or_else(|| self.get("errorDetails"))
            .filter(|detail| !detail.is_null());
        match detail {
            Some(Value::String(detail)) => write!(f, "{}: {}", self.error(), detail),
            Some(detail) => write!(f, "{}: {}", self.error(), detail),
            None => write!(f, "{}", self.error()),
        }
    }
}

impl std::error::Error for RemoteError {}

/// What went wrong while connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// No network, and nothing in the cache could answer.
    OfflineNoCache,
    /// Any other connect failure, with the transport's message.
    Other(String),
}

/// A connect failure reported for a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Failure identity.
    pub kind: ConnectionErrorKind,
    /// Namespace whose connection failed.
    pub namespace: String,
    /// Event being called when the failure surfaced, if any.
    pub event: Option<String>,
}

impl ConnectionError {
    /// Derive the semantic error from a transport message.
    ///
    /// A generic `websocket error` becomes [`ConnectionErrorKind::OfflineNoCache`].
    pub fn from_transport(message: &str, namespace: &str, event: Option<&str>) -> Self {
        let kind = if message == WEBSOCKET_ERROR_MESSAGE {
            ConnectionErrorKind::OfflineNoCache
        } else {
            ConnectionErrorKind::Other(message.to_string())
        };
        Self {
            kind,
            namespace: namespace.to_string(),
            event: event.map(str::to_owned),
        }
    }

    /// Error name (`offline_no_cache` or the transport message).
    pub fn name(&self) -> &str {
        match &self.kind {
            ConnectionErrorKind::OfflineNoCache => OFFLINE_NO_CACHE,
            ConnectionErrorKind::Other(msg) => msg,
        }
    }

    /// True for the offline-and-uncached identity.
    pub fn is_offline_no_cache(&self) -> bool {
        self.kind == ConnectionErrorKind::OfflineNoCache
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.event {
            Some(event) => write!(f, "{}/{}: connect_error: {}", self.namespace, event, self.name()),
            None => write!(f, "{}: connect_error: {}", self.namespace, self.name()),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established.
    ConnectFailed(String),
    /// Connection dropped while a call was awaiting its acknowledgment.
    Disconnected,
    /// The connection was closed locally.
    Closed,
    /// A frame could not be encoded or decoded.
    Codec(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Disconnected => write!(f, "Disconnected before acknowledgment"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Codec(msg) => write!(f, "Frame codec error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors raised by a cache backing store.
#[derive(Debug)]
pub enum CacheStoreError {
    /// Reading or writing the backing file failed.
    Io(std::io::Error),
    /// The stored data could not be (de)serialized.
    Serialization(String),
}

impl std::fmt::Display for CacheStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Cache store I/O error: {e}"),
            Self::Serialization(msg) => write!(f, "Cache store serialization error: {msg}"),
        }
    }
}

impl std::error::Error for CacheStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialization(_) => None,
        }
    }
}

impl From<std::io::Error> for CacheStoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for CacheStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The handler answered with a structural error.
    Remote(RemoteError),
    /// The namespace connection failed.
    Connection(ConnectionError),
    /// The transport failed while the call was in flight.
    Transport(TransportError),
    /// The event is not part of the namespace's declared schema.
    UnknownEvent(String),
    /// A successful result did not match the requested type.
    Decode(String),
}

impl CallError {
    /// The remote error, if this failure came from the server.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote error: {e}"),
            Self::Connection(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::UnknownEvent(event) => write!(f, "Unknown event: {event}"),
            Self::Decode(msg) => write!(f, "Failed to decode result: {msg}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Connection(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::UnknownEvent(_) | Self::Decode(_) => None,
        }
    }
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
