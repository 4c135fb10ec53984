//! WebSocket transport.
//!
//! `connect` spawns a background task that owns the socket and returns a
//! handle immediately. The task:
//!
//! 1. opens the WebSocket (with the configured extra headers),
//! 2. sends a `connect` frame carrying the auth callback's credentials and
//!    waits for `connected` / `connect_error` within the handshake timeout,
//! 3. forwards queued emissions, resolves acknowledgments by id and
//!    dispatches server pushes to listeners,
//! 4. on loss of the link fails every pending acknowledgment, raises
//!    `connect_error`, and reconnects after the fixed delay if enabled.
//!
//! Emissions made while the link is down stay queued until it comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};

use super::frame::Frame;
use super::{
    AnyEventHandler, ConnectOptions, Connection, EventHandler, LifecycleEvent, LifecycleHandler,
    Listeners, Transport,
};
use crate::error::{TransportError, WEBSOCKET_ERROR_MESSAGE};
use crate::ws::{self, ClientStream, WsMessage, WsReader, WsWriter};

/// Message reported when the handshake does not complete in time.
const TIMEOUT_MESSAGE: &str = "timeout";

/// Message reported when an established link drops.
const TRANSPORT_CLOSE_MESSAGE: &str = "transport close";

/// An emission waiting to be written.
struct OutgoingCall {
    event: String,
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// WebSocket transport speaking the JSON frame protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Create the transport.
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn connect(&self, url: &str, options: ConnectOptions) -> Arc<dyn Connection> {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(WsConnection {
            url: url.to_string(),
            listeners: Arc::new(Listeners::default()),
            call_tx,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        });

        tokio::spawn(run_connection_loop(
            ws::http_to_ws_scheme(url),
            options,
            Arc::clone(&connection.listeners),
            Arc::clone(&connection.connected),
            Arc::clone(&connection.shutdown),
            call_rx,
        ));

        connection
    }
}

/// Handle to a WebSocket connection task.
pub struct WsConnection {
    url: String,
    listeners: Arc<Listeners>,
    call_tx: mpsc::UnboundedSender<OutgoingCall>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.url)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for WsConnection {
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
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let (reply, response) = oneshot::channel();
        self.call_tx
            .send(OutgoingCall {
                event: event.to_string(),
                args,
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    fn disconnect(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Result of the inner message loop.
enum ConnectionLoopExit {
    /// Shutdown was requested -- exit entirely.
    Shutdown,
    /// Connection was lost -- should reconnect.
    Disconnected,
}

/// Main connection loop with reconnection logic.
async fn run_connection_loop(
    ws_url: String,
    options: ConnectOptions,
    listeners: Arc<Listeners>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    mut call_rx: mpsc::UnboundedReceiver<OutgoingCall>,
) {
    loop {
        log::debug!("[WsTransport] Connecting to {}", ws_url);

        let opened = tokio::select! {
            opened = tokio::time::timeout(options.timeout, open(&ws_url, &options)) => opened,
            () = shutdown.notified() => break,
        };

        match opened {
            Ok(Ok((mut writer, mut reader, id))) => {
                log::info!("[WsTransport] Connected to {} (id={})", ws_url, id);
                connected.store(true, Ordering::SeqCst);
                listeners.dispatch_lifecycle(LifecycleEvent::Connect);

                let exit = run_message_loop(
                    &mut writer,
                    &mut reader,
                    &listeners,
                    &shutdown,
                    &mut call_rx,
                )
                .await;

                connected.store(false, Ordering::SeqCst);
                writer.close().await;

                if let ConnectionLoopExit::Shutdown = exit {
                    log::info!("[WsTransport] Shutdown requested, closing {}", ws_url);
                    break;
                }
                listeners.dispatch_lifecycle(LifecycleEvent::ConnectError(
                    TRANSPORT_CLOSE_MESSAGE.to_string(),
                ));
            }
            Ok(Err(message)) => {
                log::warn!("[WsTransport] Connection to {} failed: {}", ws_url, message);
                listeners.dispatch_lifecycle(LifecycleEvent::ConnectError(message));
            }
            Err(_) => {
                log::warn!("[WsTransport] Connection to {} timed out", ws_url);
                listeners.dispatch_lifecycle(LifecycleEvent::ConnectError(
                    TIMEOUT_MESSAGE.to_string(),
                ));
            }
        }

        if !options.reconnection {
            break;
        }

        log::info!(
            "[WsTransport] Reconnecting to {} in {}ms",
            ws_url,
            options.reconnection_delay.as_millis()
        );
        tokio::select! {
            () = tokio::time::sleep(options.reconnection_delay) => {}
            () = shutdown.notified() => break,
        }
    }

    // Fail anything still queued; later sends fail on the closed channel.
    call_rx.close();
    while let Some(call) = call_rx.recv().await {
        let _ = call.reply.send(Err(TransportError::Closed));
    }
}

/// Open the socket and complete the `connect` handshake.
///
/// Errors are the message to report in `connect_error`.
async fn open(
    ws_url: &str,
    options: &ConnectOptions,
) -> Result<(WsWriter<ClientStream>, WsReader<ClientStream>, String), String> {
    let (mut writer, mut reader) = ws::connect(ws_url, &options.extra_headers)
        .await
        .map_err(|e| {
            log::debug!("[WsTransport] {}", e);
            WEBSOCKET_ERROR_MESSAGE.to_string()
        })?;

    let auth = options.credentials().await;
    writer
        .send_frame(&Frame::Connect { auth })
        .await
        .map_err(|_| WEBSOCKET_ERROR_MESSAGE.to_string())?;

    loop {
        match reader.recv().await {
            Ok(WsMessage::Frame(Frame::Connected { id })) => return Ok((writer, reader, id)),
            Ok(WsMessage::Frame(Frame::ConnectError { message })) => return Err(message),
            Ok(WsMessage::Ping(data)) => {
                let _ = writer.send_pong(data).await;
            }
            Ok(WsMessage::Close) | Err(_) => return Err(WEBSOCKET_ERROR_MESSAGE.to_string()),
            Ok(other) => {
                log::trace!("[WsTransport] Ignoring {:?} during handshake", other);
            }
        }
    }
}

/// Inner message loop for a single WebSocket connection.
///
/// Returns when the connection is lost or shutdown is requested. Pending
/// acknowledgments are failed with [`TransportError::Disconnected`] either way.
async fn run_message_loop(
    writer: &mut WsWriter<ClientStream>,
    reader: &mut WsReader<ClientStream>,
    listeners: &Listeners,
    shutdown: &Notify,
    call_rx: &mut mpsc::UnboundedReceiver<OutgoingCall>,
) -> ConnectionLoopExit {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, TransportError>>> = HashMap::new();
    let mut next_id: u64 = 0;

    let exit = loop {
        tokio::select! {
            call = call_rx.recv() => {
                let Some(call) = call else {
                    break ConnectionLoopExit::Shutdown;
                };
                let id = next_id;
                next_id += 1;
                let frame = Frame::Event {
                    event: call.event,
                    args: call.args,
                    ack: Some(id),
                };
                match writer.send_frame(&frame).await {
                    Ok(()) => {
                        pending.insert(id, call.reply);
                    }
                    Err(e) => {
                        log::warn!("[WsTransport] Send failed: {}", e);
                        let _ = call.reply.send(Err(TransportError::Disconnected));
                        break ConnectionLoopExit::Disconnected;
                    }
                }
            }

            msg = reader.recv() => {
                match msg {
                    Ok(WsMessage::Frame(Frame::Ack { id, data })) => {
                        match pending.remove(&id) {
                            Some(reply) => {
                                let _ = reply.send(Ok(data));
                            }
                            None => log::debug!("[WsTransport] Ack for unknown id {}", id),
                        }
                    }
                    Ok(WsMessage::Frame(Frame::Event { event, args, .. })) => {
                        listeners.dispatch_event(&event, args);
                    }
                    Ok(WsMessage::Frame(frame)) => {
                        log::trace!("[WsTransport] Unhandled frame: {:?}", frame);
                    }
                    Ok(WsMessage::Invalid(text)) => {
                        log::warn!("[WsTransport] Invalid frame: {}", text);
                    }
                    Ok(WsMessage::Ping(data)) => {
                        if writer.send_pong(data).await.is_err() {
                            break ConnectionLoopExit::Disconnected;
                        }
                    }
                    Ok(WsMessage::Close) => {
                        log::info!("[WsTransport] Connection closed by server");
                        break ConnectionLoopExit::Disconnected;
                    }
                    Err(e) => {
                        log::warn!("[WsTransport] {}", e);
                        break ConnectionLoopExit::Disconnected;
                    }
                }
            }

            () = shutdown.notified() => {
                break ConnectionLoopExit::Shutdown;
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(TransportError::Disconnected));
    }
    exit
}
