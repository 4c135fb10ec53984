//! Transport abstraction consumed by the namespace client.
//!
//! The client never talks to a socket directly. It asks a [`Transport`] for a
//! [`Connection`] and uses four capabilities of it: per-event subscription,
//! a catch-all observer, call-with-acknowledgment, and connect lifecycle
//! notifications.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── WsTransport      WebSocket + JSON frames (tokio-tungstenite)
//!     │
//!     └── MemoryTransport  in-process loopback to a server::Server
//! ```
//!
//! `connect` is synchronous: it returns a handle immediately and establishes
//! the link in the background, reporting the outcome through
//! [`LifecycleEvent`]s. Emissions made before the link is up wait for it.

pub mod frame;
pub mod memory;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Handshake credentials (`{"token": ...}` or empty).
pub type Credentials = serde_json::Map<String, Value>;

/// Async credential provider invoked by the transport during the handshake.
pub type AuthCallback = Arc<dyn Fn() -> BoxFuture<'static, Credentials> + Send + Sync>;

/// Handler for one inbound event name.
pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Handler observing every inbound event.
pub type AnyEventHandler = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Handler for connect lifecycle notifications.
pub type LifecycleHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Connect lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The handshake completed (`connect`).
    Connect,
    /// Connecting failed or the link dropped (`connect_error`), with the
    /// transport's message.
    ConnectError(String),
}

/// Fixed connection configuration, passed through to the transport unchanged.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Extra HTTP headers sent with the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    /// Handshake timeout.
    pub timeout: Duration,
    /// Allowed transports, in preference order.
    pub transports: Vec<String>,
    /// Whether connections may be shared between namespaces.
    pub multiplex: bool,
    /// Whether to reconnect after the link drops.
    pub reconnection: bool,
    /// Delay between reconnection attempts.
    pub reconnection_delay: Duration,
    /// Credential provider for the handshake.
    pub auth: Option<AuthCallback>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            extra_headers: Vec::new(),
            timeout: Duration::from_millis(1000),
            transports: vec!["websocket".to_string()],
            multiplex: false,
            reconnection: true,
            reconnection_delay: Duration::from_millis(1000),
            auth: None,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("extra_headers", &self.extra_headers)
            .field("timeout", &self.timeout)
            .field("transports", &self.transports)
            .field("multiplex", &self.multiplex)
            .field("reconnection", &self.reconnection)
            .field("reconnection_delay", &self.reconnection_delay)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl ConnectOptions {
    /// Run the auth callback, or return empty credentials if none is set.
    pub async fn credentials(&self) -> Credentials {
        match &self.auth {
            Some(auth) => auth().await,
            None => Credentials::new(),
        }
    }
}

/// Factory for connections.
pub trait Transport: Send + Sync {
    /// Start connecting to `url`. Returns immediately.
    fn connect(&self, url: &str, options: ConnectOptions) -> Arc<dyn Connection>;
}

/// One live (or pending) connection to a namespace.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Subscribe to an inbound event name. Handlers accumulate.
    fn on(&self, event: &str, handler: EventHandler);

    /// Observe every inbound event.
    fn on_any(&self, handler: AnyEventHandler);

    /// Observe connect lifecycle notifications.
    ///
    /// The most recent notification, if any, is replayed to the new handler
    /// so that registering right after `connect` never misses the outcome.
    fn on_lifecycle(&self, handler: LifecycleHandler);

    /// Whether the handshake has completed and the link is up.
    fn is_connected(&self) -> bool;

    /// Emit an event and wait for its acknowledgment.
    async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<Value, TransportError>;

    /// Close the connection.
    fn disconnect(&self);
}

/// Handler registry shared by transport implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    events: Mutex<HashMap<String, Vec<EventHandler>>>,
    any: Mutex<Vec<AnyEventHandler>>,
    lifecycle: Mutex<Vec<LifecycleHandler>>,
    last_lifecycle: Mutex<Option<LifecycleEvent>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field(
                "events",
                &self.events.lock().map(|e| e.len()).unwrap_or_default(),
            )
            .finish_non_exhaustive()
    }
}

impl Listeners {
    pub(crate) fn on(&self, event: &str, handler: EventHandler) {
        self.events
            .lock()
            .expect("listeners lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub(crate) fn on_any(&self, handler: AnyEventHandler) {
        self.any.lock().expect("listeners lock poisoned").push(handler);
    }

    pub(crate) fn on_lifecycle(&self, handler: LifecycleHandler) {
        let last = {
            let mut handlers = self.lifecycle.lock().expect("listeners lock poisoned");
            handlers.push(Arc::clone(&handler));
            self.last_lifecycle
                .lock()
                .expect("listeners lock poisoned")
                .clone()
        };
        if let Some(event) = last {
            handler(&event);
        }
    }

    /// Deliver an inbound event. Handlers are cloned out of the lock first so
    /// a handler may subscribe further without deadlocking.
    pub(crate) fn dispatch_event(&self, event: &str, args: Vec<Value>) {
        let any: Vec<_> = self.any.lock().expect("listeners lock poisoned").clone();
        for handler in &any {
            handler(event, &args);
        }

        let handlers = self
            .events
            .lock()
            .expect("listeners lock poisoned")
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(args.clone());
        }
    }

    pub(crate) fn dispatch_lifecycle(&self, event: LifecycleEvent) {
        // Recorded under the handler lock so a concurrent `on_lifecycle`
        // either gets the replay or is in the list below, never neither.
        let handlers: Vec<_> = {
            let handlers = self.lifecycle.lock().expect("listeners lock poisoned");
            *self.last_lifecycle.lock().expect("listeners lock poisoned") = Some(event.clone());
            handlers.clone()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

/// Extract the namespace path (`/user`) from a connection URL.
pub fn namespace_path(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .find('/')
        .map_or("", |idx| &without_scheme[idx..]);
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_namespace_path() {
        assert_eq!(namespace_path("http://localhost:3000/user"), "/user");
        assert_eq!(namespace_path("http://test.com/test-namespace"), "/test-namespace");
        assert_eq!(namespace_path("ws://host/a/b?x=1"), "/a/b");
        assert_eq!(namespace_path("http://host"), "/");
        assert_eq!(namespace_path("/user/"), "/user");
    }

    #[test]
    fn test_default_connect_options() {
        let options = ConnectOptions::default();
        assert_eq!(options.timeout, Duration::from_millis(1000));
        assert_eq!(options.transports, vec!["websocket".to_string()]);
        assert!(!options.multiplex);
    }

    #[test]
    fn test_lifecycle_replayed_to_late_handler() {
        let listeners = Listeners::default();
        listeners.dispatch_lifecycle(LifecycleEvent::Connect);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        listeners.on_lifecycle(Arc::new(move |event| {
            assert_eq!(event, &LifecycleEvent::Connect);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_reaches_named_and_any_handlers() {
        let listeners = Listeners::default();
        let named = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        let named_clone = Arc::clone(&named);
        listeners.on("showReminder", Arc::new(move |_| {
            named_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let any_clone = Arc::clone(&any);
        listeners.on_any(Arc::new(move |_, _| {
            any_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.dispatch_event("showReminder", vec![]);
        listeners.dispatch_event("other", vec![]);

        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }
}
