//! In-process loopback transport.
//!
//! Connects namespace clients straight to a [`Server`] without sockets. Used
//! by the test suite and by embedders that host client and server in one
//! process. Every emission is recorded so callers can assert on what did (or
//! did not) reach the wire.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    namespace_path, AnyEventHandler, ConnectOptions, Connection, EventHandler, LifecycleEvent,
    LifecycleHandler, Listeners, Transport,
};
use crate::error::{TransportError, WEBSOCKET_ERROR_MESSAGE};
use crate::server::{ClientSink, Server, Session};

/// A recorded emission: event name and arguments.
pub type Emission = (String, Vec<Value>);

/// State of a loopback link.
#[derive(Clone)]
enum LinkState {
    Connecting,
    Connected(Arc<Session>),
    Failed(String),
    Closed,
}

/// Loopback transport to an in-process [`Server`].
#[derive(Clone)]
pub struct MemoryTransport {
    server: Option<Arc<Server>>,
    emitted: Arc<Mutex<Vec<Emission>>>,
    connects: Arc<Mutex<Vec<(String, ConnectOptions)>>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("reachable", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Transport whose connections reach `server`.
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server: Some(server),
            emitted: Arc::default(),
            connects: Arc::default(),
        }
    }

    /// Transport with no server behind it: every connect fails with
    /// `websocket error`, as a real socket does without network.
    pub fn unreachable() -> Self {
        Self {
            server: None,
            emitted: Arc::default(),
            connects: Arc::default(),
        }
    }

    /// Everything emitted through this transport so far.
    pub fn emitted(&self) -> Vec<Emission> {
        self.emitted.lock().expect("emitted lock poisoned").clone()
    }

    /// Number of emissions so far.
    pub fn emit_count(&self) -> usize {
        self.emitted.lock().expect("emitted lock poisoned").len()
    }

    /// URLs and options of every `connect` call so far.
    pub fn connects(&self) -> Vec<(String, ConnectOptions)> {
        self.connects.lock().expect("connects lock poisoned").clone()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, url: &str, options: ConnectOptions) -> Arc<dyn Connection> {
        self.connects
            .lock()
            .expect("connects lock poisoned")
            .push((url.to_string(), options.clone()));

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let connection = Arc::new(MemoryConnection {
            path: namespace_path(url),
            listeners: Arc::new(Listeners::default()),
            state_tx: Arc::new(state_tx),
            state_rx,
            emitted: Arc::clone(&self.emitted),
        });

        let server = self.server.clone();
        let listeners = Arc::clone(&connection.listeners);
        let state_tx = Arc::clone(&connection.state_tx);
        let path = connection.path.clone();
        // Lifecycle observers fire before the link state flips, so a caller
        // woken by the state change already sees the offline flag.
        tokio::spawn(async move {
            let Some(server) = server else {
                listeners.dispatch_lifecycle(LifecycleEvent::ConnectError(
                    WEBSOCKET_ERROR_MESSAGE.to_string(),
                ));
                state_tx.send_replace(LinkState::Failed(WEBSOCKET_ERROR_MESSAGE.to_string()));
                return;
            };

            let auth = options.credentials().await;
            let sink = Arc::new(LoopbackSink {
                listeners: Arc::clone(&listeners),
            });
            match server.accept(&path, auth, sink).await {
                Ok(session) => {
                    listeners.dispatch_lifecycle(LifecycleEvent::Connect);
                    state_tx.send_replace(LinkState::Connected(Arc::new(session)));
                }
                Err(e) => {
                    listeners.dispatch_lifecycle(LifecycleEvent::ConnectError(e.message.clone()));
                    state_tx.send_replace(LinkState::Failed(e.message));
                }
            }
        });

        connection
    }
}

/// Delivers server pushes straight into the client's listeners.
struct LoopbackSink {
    listeners: Arc<Listeners>,
}

impl ClientSink for LoopbackSink {
    fn push(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.listeners.dispatch_event(event, args);
        Ok(())
    }
}

/// Client half of a loopback link.
pub struct MemoryConnection {
    path: String,
    listeners: Arc<Listeners>,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    emitted: Arc<Mutex<Vec<Emission>>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn on(&self, event: &str, handler: EventHandler) {
        self.listeners.on(event, handler);
    }

    fn on_any(&self, handler: AnyEventHandler) {
        self.listeners.on_any(handler);
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) {
        self.listeners.on_lifecycle(handler);
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), LinkState::Connected(_))
    }

    /// Waits for the handshake, then runs the handler in the caller's task.
    ///
    /// A failed handshake fails the call instead of buffering it forever.
    async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        self.emitted
            .lock()
            .expect("emitted lock poisoned")
            .push((event.to_string(), args.clone()));

        let mut state_rx = self.state_rx.clone();
        let state = state_rx
            .wait_for(|state| !matches!(state, LinkState::Connecting))
            .await
            .map_err(|_| TransportError::Closed)?
            .clone();

        match state {
            LinkState::Connected(session) => Ok(session.dispatch(event, args).await),
            LinkState::Failed(message) => Err(TransportError::ConnectFailed(message)),
            LinkState::Closed | LinkState::Connecting => Err(TransportError::Closed),
        }
    }

    fn disconnect(&self) {
        self.state_tx.send_replace(LinkState::Closed);
    }
}
