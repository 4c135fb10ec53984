//! JSON frame protocol spoken by the WebSocket transport and server.
//!
//! ```text
//! client                          server
//!   │ ── connect {auth} ─────────▶ │   middleware chain runs
//!   │ ◀──────── connected {id} ─── │   (or connect_error {message})
//!   │ ── event {event,args,ack} ─▶ │   handler runs
//!   │ ◀────────── ack {id,data} ── │
//!   │ ◀──── event {event,args} ─── │   server push, no ack
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Credentials;
use crate::error::TransportError;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client handshake carrying credentials.
    Connect {
        /// Credentials from the auth callback (`{token}` or `{}`).
        #[serde(default)]
        auth: Credentials,
    },
    /// Handshake accepted.
    Connected {
        /// Server-assigned connection id.
        id: String,
    },
    /// Handshake rejected.
    ConnectError {
        /// Rejection reason.
        message: String,
    },
    /// A named event, optionally expecting an acknowledgment.
    Event {
        /// Event name.
        event: String,
        /// Event arguments.
        #[serde(default)]
        args: Vec<Value>,
        /// Acknowledgment id; absent for fire-and-forget pushes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Acknowledgment of an earlier event.
    Ack {
        /// Id from the acknowledged event.
        id: u64,
        /// Handler result.
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
