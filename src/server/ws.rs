//! WebSocket front end for a [`Server`].
//!
//! Each accepted TCP connection is upgraded, the namespace is taken from the
//! `X-Namespace` header (falling back to the request path), the `connect`
//! frame is read, and the namespace's middleware chain decides whether the
//! connection is accepted. Handlers run on their own tasks so a slow handler
//! never blocks acknowledgments of other calls on the same connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use super::{ClientSink, Server};
use crate::error::TransportError;
use crate::transport::frame::Frame;
use crate::ws::{self, WsMessage};

/// How long a client may take to send its `connect` frame.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Sink that queues pushes for the connection's writer.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ClientSink for ChannelSink {
    fn push(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Event {
                event: event.to_string(),
                args,
                ack: None,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Accept connections forever, serving each on its own task.
pub async fn serve(listener: TcpListener, server: Arc<Server>) {
    if let Ok(addr) = listener.local_addr() {
        log::info!("[Server] Listening on ws://{}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("[Server] Accepted TCP connection from {}", peer);
                tokio::spawn(handle_connection(stream, Arc::clone(&server)));
            }
            Err(e) => {
                log::warn!("[Server] Accept failed: {}", e);
            }
        }
    }
}

/// Serve one connection until it closes.
async fn handle_connection(stream: TcpStream, server: Arc<Server>) {
    let mut namespace = String::from("/");
    let capture_namespace = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        namespace = request
            .headers()
            .get("X-Namespace")
            .and_then(|value| value.to_str().ok())
            .map_or_else(|| request.uri().path().to_string(), str::to_owned);
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture_namespace).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            log::warn!("[Server] WebSocket upgrade failed: {}", e);
            return;
        }
    };
    let (mut writer, mut reader) = ws::split(ws_stream);

    let handshake =
        tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), reader.recv()).await;
    let auth = match handshake {
        Ok(Ok(WsMessage::Frame(Frame::Connect { auth }))) => auth,
        Ok(other) => {
            log::warn!("[Server] {}: expected connect frame, got {:?}", namespace, other);
            writer.close().await;
            return;
        }
        Err(_) => {
            log::warn!("[Server] {}: handshake timed out", namespace);
            writer.close().await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let sink = Arc::new(ChannelSink { tx: out_tx.clone() });

    let session = match server.accept(&namespace, auth, sink).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            let _ = writer
                .send_frame(&Frame::ConnectError { message: e.message })
                .await;
            writer.close().await;
            return;
        }
    };

    let connected = Frame::Connected {
        id: session.services().id().to_string(),
    };
    if let Err(e) = writer.send_frame(&connected).await {
        log::warn!("[Server] {}: failed to confirm connection: {}", namespace, e);
        return;
    }

    loop {
        tokio::select! {
            Some(frame) = out_rx.recv() => {
                if let Err(e) = writer.send_frame(&frame).await {
                    log::warn!("[Server] {}: send failed: {}", namespace, e);
                    break;
                }
            }

            msg = reader.recv() => {
                match msg {
                    Ok(WsMessage::Frame(Frame::Event { event, args, ack })) => {
                        let session = Arc::clone(&session);
                        let tx = out_tx.clone();
                        tokio::spawn(async move {
                            let data = session.dispatch(&event, args).await;
                            if let Some(id) = ack {
                                if tx.send(Frame::Ack { id, data }).is_err() {
                                    log::debug!("[Server] Connection gone before ack of {}", event);
                                }
                            }
                        });
                    }
                    Ok(WsMessage::Frame(frame)) => {
                        log::debug!("[Server] {}: ignoring unexpected frame {:?}", namespace, frame);
                    }
                    Ok(WsMessage::Invalid(text)) => {
                        log::warn!("[Server] {}: invalid frame: {}", namespace, text);
                    }
                    Ok(WsMessage::Ping(data)) => {
                        if writer.send_pong(data).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close) => {
                        log::info!("[Server] {}: connection {} closed", namespace, session.services().id());
                        break;
                    }
                    Err(e) => {
                        log::warn!("[Server] {}: {}", namespace, e);
                        break;
                    }
                }
            }
        }
    }

    writer.close().await;
}
