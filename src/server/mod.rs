//! Server-side dispatcher.
//!
//! Maps named async handlers onto inbound events of a namespace. For each
//! incoming connection:
//!
//! 1. the ordered middleware chain runs once (first error rejects the
//!    connection with a `connect_error`),
//! 2. `listen_events` builds the handler table for that connection,
//! 3. every inbound event is routed to its handler and the handler's
//!    resolved value is delivered back through the acknowledgment.
//!
//! Handlers push events back to the caller through [`Services::emit`]; this
//! is the only channel by which server-initiated notifications reach the
//! client's subscribers.
//!
//! # Usage
//!
//! ```ignore
//! let user = NamespaceServer::new("/user", |services| {
//!     Handlers::new().on("login", move |args| {
//!         let services = services.clone();
//!         async move {
//!             services.set_data("user", args[0].clone());
//!             json!("welcome")
//!         }
//!     })
//! });
//! let server = Server::new().with_namespace(user);
//! ```

pub mod ws;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::{RemoteError, TransportError};
use crate::transport::Credentials;

/// Error key answered for events without a handler.
pub const UNKNOWN_EVENT: &str = "unknown_event";

/// Future returned by an event handler.
pub type HandlerFuture = BoxFuture<'static, Value>;

/// An async event handler.
pub type EventHandlerFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Future returned by a middleware.
pub type MiddlewareFuture = BoxFuture<'static, Result<(), MiddlewareError>>;

/// Connection middleware, run once per connection before handlers exist.
pub type Middleware = Arc<dyn Fn(Services) -> MiddlewareFuture + Send + Sync>;

/// Builds the per-connection handler table.
pub type ListenEvents = Arc<dyn Fn(Services) -> Handlers + Send + Sync>;

/// Outbound half of a server-side connection.
pub trait ClientSink: Send + Sync {
    /// Push a named event to the connected client (no acknowledgment).
    fn push(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError>;
}

/// Rejection raised by a middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareError {
    /// Reason reported to the client as the `connect_error` message.
    pub message: String,
}

impl MiddlewareError {
    /// Create a rejection with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MiddlewareError {}

/// Handler table for one connection.
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: HashMap<String, EventHandlerFn>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Handlers").field("events", &names).finish()
    }
}

impl Handlers {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. A later registration replaces an earlier one.
    pub fn on<F, Fut>(mut self, event: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.handlers
            .insert(event.to_string(), Arc::new(move |args| handler(args).boxed()));
        self
    }

    /// Whether a handler exists for `event`.
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }
}

struct ServicesInner {
    id: String,
    namespace: String,
    auth: Credentials,
    sink: Arc<dyn ClientSink>,
    data: Mutex<serde_json::Map<String, Value>>,
}

/// Per-connection services handed to middlewares and handlers.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Services {
    inner: Arc<ServicesInner>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.namespace)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Services for a freshly accepted connection.
    pub fn new(namespace: &str, auth: Credentials, sink: Arc<dyn ClientSink>) -> Self {
        Self {
            inner: Arc::new(ServicesInner {
                id: uuid::Uuid::new_v4().to_string(),
                namespace: namespace.to_string(),
                auth,
                sink,
                data: Mutex::new(serde_json::Map::new()),
            }),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Namespace path this connection belongs to.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Credentials supplied during the handshake.
    pub fn auth(&self) -> &Credentials {
        &self.inner.auth
    }

    /// The handshake token, if one was supplied.
    pub fn token(&self) -> Option<&str> {
        self.inner.auth.get("token").and_then(Value::as_str)
    }

    /// Push `event` to the client.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        log::debug!("[Server] {}/{} pushed to {}", self.inner.namespace, event, self.inner.id);
        self.inner.sink.push(event, args)
    }

    /// Push the `<event>End` companion of a long-running event.
    pub fn emit_end(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.emit(&format!("{event}End"), args)
    }

    /// Read a value from the connection's session data.
    pub fn data(&self, key: &str) -> Option<Value> {
        self.inner
            .data
            .lock()
            .expect("session data lock poisoned")
            .get(key)
            .cloned()
    }

    /// Store a value in the connection's session data.
    pub fn set_data(&self, key: &str, value: Value) {
        self.inner
            .data
            .lock()
            .expect("session data lock poisoned")
            .insert(key.to_string(), value);
    }
}

/// Handlers and middleware for one namespace.
pub struct NamespaceServer {
    path: String,
    listen_events: ListenEvents,
    middlewares: Vec<Middleware>,
}

impl std::fmt::Debug for NamespaceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceServer")
            .field("path", &self.path)
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl NamespaceServer {
    /// Create a namespace at `path` (`user` and `/user` are equivalent).
    pub fn new<F>(path: &str, listen_events: F) -> Self
    where
        F: Fn(Services) -> Handlers + Send + Sync + 'static,
    {
        Self {
            path: normalize_path(path),
            listen_events: Arc::new(listen_events),
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware to the chain.
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(Services) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MiddlewareError>> + Send + 'static,
    {
        self.middlewares
            .push(Arc::new(move |services| middleware(services).boxed()));
        self
    }

    /// Namespace path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accept a connection: run the middleware chain, then build handlers.
    pub async fn accept(
        &self,
        auth: Credentials,
        sink: Arc<dyn ClientSink>,
    ) -> Result<Session, MiddlewareError> {
        let services = Services::new(&self.path, auth, sink);

        for middleware in &self.middlewares {
            if let Err(e) = middleware(services.clone()).await {
                log::info!(
                    "[Server] {} rejected connection {}: {}",
                    self.path,
                    services.id(),
                    e
                );
                return Err(e);
            }
        }

        let handlers = (self.listen_events)(services.clone());
        log::info!("[Server] {} accepted connection {}", self.path, services.id());
        Ok(Session { services, handlers })
    }
}

/// An accepted connection with its handler table.
#[derive(Debug)]
pub struct Session {
    services: Services,
    handlers: Handlers,
}

impl Session {
    /// Services of this connection.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run the handler for `event` and return the value to acknowledge with.
    ///
    /// Events without a handler are answered with an `unknown_event` error.
    pub async fn dispatch(&self, event: &str, args: Vec<Value>) -> Value {
        let Some(handler) = self.handlers.handlers.get(event).cloned() else {
            log::warn!("[Server] {}: no handler for {}", self.services.namespace(), event);
            return RemoteError::scoped(
                UNKNOWN_EVENT,
                format!("No handler for event {event}"),
                event,
            )
            .to_value();
        };
        handler(args).await
    }
}

/// Registry of namespaces served together.
#[derive(Debug, Default)]
pub struct Server {
    namespaces: HashMap<String, Arc<NamespaceServer>>,
}

impl Server {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a namespace.
    pub fn with_namespace(mut self, namespace: NamespaceServer) -> Self {
        self.namespaces
            .insert(namespace.path().to_string(), Arc::new(namespace));
        self
    }

    /// Look up a namespace by path.
    pub fn namespace(&self, path: &str) -> Option<Arc<NamespaceServer>> {
        self.namespaces.get(&normalize_path(path)).cloned()
    }

    /// Accept a connection on the namespace at `path`.
    pub async fn accept(
        &self,
        path: &str,
        auth: Credentials,
        sink: Arc<dyn ClientSink>,
    ) -> Result<Session, MiddlewareError> {
        let Some(namespace) = self.namespace(path) else {
            return Err(MiddlewareError::new("Invalid namespace"));
        };
        namespace.accept(auth, sink).await
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}
