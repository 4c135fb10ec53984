//! Shared WebSocket plumbing.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves that speak [`Frame`]s. Both the client transport
//! and the server loop go through this module rather than using
//! `tokio-tungstenite` directly.
//!
//! Rust guideline compliant 2026-02

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;
use crate::transport::frame::Frame;

/// Client-side stream type (plain TCP or TLS).
pub type ClientStream = tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// A decoded protocol frame.
    Frame(Frame),
    /// A text frame that is not valid protocol JSON.
    Invalid(String),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Close frame (or end of stream).
    Close,
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a protocol frame as a text message.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.encode()?;
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("WebSocket send failed: {e}")))
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("WebSocket send_pong failed: {e}")))
    }

    /// Flush pending writes and close the sink.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            log::debug!("[ws] Close failed: {}", e);
        }
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next message. End of stream is reported as [`WsMessage::Close`].
    ///
    /// Binary, pong and raw frames are skipped.
    pub async fn recv(&mut self) -> Result<WsMessage, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Ok(match Frame::decode(&text) {
                        Ok(frame) => WsMessage::Frame(frame),
                        Err(_) => WsMessage::Invalid(text.to_string()),
                    });
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Ok(WsMessage::Ping(data.to_vec()));
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return Ok(WsMessage::Close),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::ConnectFailed(format!(
                        "WebSocket read error: {e}"
                    )));
                }
            }
        }
    }
}

/// Split an established stream into frame-speaking halves.
pub fn split<S>(stream: WebSocketStream<S>) -> (WsWriter<S>, WsReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = stream.split();
    (WsWriter { sink }, WsReader { stream })
}

/// Connect to a WebSocket URL with extra headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake.
pub async fn connect(
    url: &str,
    headers: &[(String, String)],
) -> Result<(WsWriter<ClientStream>, WsReader<ClientStream>), TransportError> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::ConnectFailed(format!("invalid WebSocket URL {url}: {e}")))?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::ConnectFailed(format!("invalid header name {name}: {e}")))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value).map_err(|e| {
            TransportError::ConnectFailed(format!("invalid header value for {name}: {e}"))
        })?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("WebSocket connect failed: {e}")))?;

    Ok(split(ws_stream))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}
