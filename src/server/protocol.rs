//! Protocol message definitions
//!
//! JSON messages this host pushes to its clients. The registry itself only
//! moves opaque text; these types are how the host fills it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel::Channel;
use crate::registry::ConnectionId;

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of a relayed control message (64KB)
pub const MAX_RELAY_LENGTH: usize = 64 * 1024;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Live connection counts per channel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub control: usize,
    pub telemetry: usize,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every accepted connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Id the hub assigned to this connection
        connection: ConnectionId,
        /// Channel the connection was routed to
        channel: Channel,
    },

    /// Periodic telemetry heartbeat
    Tick {
        /// Server protocol version
        version: u32,
        /// Monotonic tick counter, starting at 1
        seq: u64,
        /// Milliseconds since the server started
        uptime_ms: u64,
        /// Live connections at the time of the tick
        connections: ConnectionCounts,
    },

    /// Text a control client sent, fanned out to every control client
    Relay {
        /// Connection the text came from
        from: ConnectionId,
        /// The text as received
        text: String,
    },
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome(connection: ConnectionId, channel: Channel) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            connection,
            channel,
        }
    }

    /// Create a Tick message
    pub fn tick(seq: u64, uptime_ms: u64, connections: ConnectionCounts) -> Self {
        ServerMessage::Tick {
            version: PROTOCOL_VERSION,
            seq,
            uptime_ms,
            connections,
        }
    }

    /// Create a Relay message, rejecting oversized text
    pub fn relay(from: ConnectionId, text: impl Into<String>) -> ProtocolResult<Self> {
        let text = text.into();
        if text.len() > MAX_RELAY_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "relay text exceeds maximum length of {} bytes",
                MAX_RELAY_LENGTH
            )));
        }
        Ok(ServerMessage::Relay { from, text })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
