//! Per-namespace connection lifecycle.
//!
//! The manager creates the underlying connection at most once (on first
//! call or on an explicit connect), keeps the offline flag in sync with the
//! transport's lifecycle notifications, and forwards them to plugins and to
//! the namespace and client callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::watch;

use super::{ConnectErrorCallback, ConnectedCallback};
use crate::error::ConnectionError;
use crate::plugin::Pipeline;
use crate::transport::{ConnectOptions, Connection, EventHandler, LifecycleEvent, Transport};

/// Single-slot handlers for server-pushed events, keyed by event name.
///
/// The connection sees one forwarding handler per event name; it looks the
/// current slot up on every delivery, so reassigning a handler replaces the
/// previous one instead of stacking. A cleared slot keeps its key so the
/// forwarder is never attached twice.
#[derive(Default)]
pub(crate) struct Subscriptions {
    slots: Mutex<HashMap<String, Option<EventHandler>>>,
}

impl Subscriptions {
    /// Fill the slot for `event`. Returns true the first time `event` is seen.
    fn assign(&self, event: &str, handler: EventHandler) -> bool {
        self.slots
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(event.to_string(), Some(handler))
            .is_none()
    }

    fn clear(&self, event: &str) -> bool {
        self.slots
            .lock()
            .expect("subscriptions lock poisoned")
            .get_mut(event)
            .and_then(Option::take)
            .is_some()
    }

    fn names(&self) -> Vec<String> {
        self.slots
            .lock()
            .expect("subscriptions lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn forwarder(self: &Arc<Self>, event: &str) -> EventHandler {
        let slots = Arc::clone(self);
        let event = event.to_string();
        Arc::new(move |args: Vec<Value>| {
            let handler = slots
                .slots
                .lock()
                .expect("subscriptions lock poisoned")
                .get(&event)
                .cloned()
                .flatten();
            if let Some(handler) = handler {
                handler(args);
            }
        })
    }
}

/// Observers notified of lifecycle changes, in order: plugins, then the
/// namespace callback (or the client's when the namespace has none).
#[derive(Clone)]
pub(crate) struct LifecycleObservers {
    pub(crate) pipeline: Pipeline,
    pub(crate) on_connect_error: ConnectErrorCallback,
    pub(crate) on_connected: ConnectedCallback,
}

/// Owns the connection of one namespace.
pub(crate) struct ConnectionManager {
    namespace: String,
    url: String,
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    offline: Arc<watch::Sender<Option<bool>>>,
    observers: LifecycleObservers,
    subscriptions: Arc<Subscriptions>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("namespace", &self.namespace)
            .field("url", &self.url)
            .field("offline", &*self.offline.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub(crate) fn new(
        namespace: &str,
        url: String,
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        observers: LifecycleObservers,
    ) -> Self {
        let (offline, _) = watch::channel(None);
        Self {
            namespace: namespace.to_string(),
            url,
            transport,
            options,
            connection: RwLock::new(None),
            offline: Arc::new(offline),
            observers,
            subscriptions: Arc::default(),
        }
    }

    /// The connection, if it has been created.
    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .read()
            .expect("connection lock poisoned")
            .clone()
    }

    /// Return the connection, creating it first if needed.
    pub(crate) fn ensure_connected(&self) -> Arc<dyn Connection> {
        if let Some(connection) = self.connection() {
            return connection;
        }

        let mut slot = self.connection.write().expect("connection lock poisoned");
        if let Some(connection) = slot.as_ref() {
            return Arc::clone(connection);
        }

        log::info!(
            "[Namespace] Connecting to {} at {}",
            self.namespace,
            chrono::Utc::now().to_rfc3339()
        );
        let connection = self.transport.connect(&self.url, self.options.clone());
        self.attach_listeners(connection.as_ref());
        *slot = Some(Arc::clone(&connection));
        drop(slot);

        // Outside the lock: a replayed lifecycle event runs user callbacks,
        // which may reach back into this manager.
        self.attach_lifecycle(connection.as_ref());
        connection
    }

    /// Drop the connection; the next call creates a fresh one.
    pub(crate) fn reset(&self) {
        let previous = self
            .connection
            .write()
            .expect("connection lock poisoned")
            .take();
        if let Some(connection) = previous {
            log::info!("[Namespace] Disconnecting from {}", self.namespace);
            connection.disconnect();
        }
    }

    pub(crate) fn is_offline(&self) -> Option<bool> {
        *self.offline.borrow()
    }

    pub(crate) fn offline_state(&self) -> watch::Receiver<Option<bool>> {
        self.offline.subscribe()
    }

    /// Fill the handler slot for `event`, attaching a forwarder to the
    /// connection the first time the event is subscribed.
    pub(crate) fn subscribe(&self, event: &str, handler: EventHandler) {
        // Held across assign + attach so a concurrent connect either sees
        // the new slot or has already attached it.
        let connection = self.connection.read().expect("connection lock poisoned");
        if self.subscriptions.assign(event, handler) {
            if let Some(connection) = connection.as_ref() {
                connection.on(event, self.subscriptions.forwarder(event));
            }
        }
    }

    /// Empty the handler slot for `event`. Returns whether it was filled.
    pub(crate) fn unsubscribe(&self, event: &str) -> bool {
        self.subscriptions.clear(event)
    }

    fn attach_listeners(&self, connection: &dyn Connection) {
        let namespace = self.namespace.clone();
        connection.on_any(Arc::new(move |event, args| {
            log::debug!("[Namespace] {}/{} received {:?}", namespace, event, args);
        }));

        for event in self.subscriptions.names() {
            connection.on(&event, self.subscriptions.forwarder(&event));
        }
    }

    fn attach_lifecycle(&self, connection: &dyn Connection) {
        let namespace = self.namespace.clone();
        let offline = Arc::clone(&self.offline);
        let observers = self.observers.clone();
        connection.on_lifecycle(Arc::new(move |event| match event {
            LifecycleEvent::Connect => {
                offline.send_replace(Some(false));
                log::info!(
                    "[Namespace] Connected to {} at {}",
                    namespace,
                    chrono::Utc::now().to_rfc3339()
                );
                observers.pipeline.on_connect(&namespace);
                (observers.on_connected)(&namespace);
            }
            LifecycleEvent::ConnectError(message) => {
                offline.send_replace(Some(true));
                let error = ConnectionError::from_transport(message, &namespace, None);
                log::debug!("[Namespace] {}: connect_error ({})", namespace, message);
                observers.pipeline.on_connect_error(&error);
                (observers.on_connect_error)(&error);
            }
        }));
    }
}
