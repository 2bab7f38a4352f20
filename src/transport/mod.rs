//! Transport seam
//!
//! The registry never touches sockets directly. It talks to a
//! [`TransportFactory`] that completes upgrade handshakes and hands back
//! owned [`ConnectionHandle`]s. Asynchronous closure is reported through a
//! [`CloseNotifier`] bound to the connection at accept time.

mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use websocket::*;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::registry::ConnectionId;

/// Errors reported by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("out of memory: no connection slot available")]
    OutOfMemory,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("no async runtime available: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A message received from the peer, passed through to the host untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Callback invoked for every inbound message on a connection
pub type MessageHandler = Arc<dyn Fn(ConnectionId, Inbound) + Send + Sync>;

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame
    PeerClosed { code: Option<u16>, reason: String },
    /// The stream ended without a close frame
    Disconnected,
    /// Protocol or I/O failure
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "peer closed ({}: {})", code, reason)
            }
            CloseReason::PeerClosed { code: Some(code), .. } => write!(f, "peer closed ({})", code),
            CloseReason::PeerClosed { code: None, .. } => write!(f, "peer closed"),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Close notification queued for the registry that owns the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub id: ConnectionId,
    pub reason: CloseReason,
}

/// Close-notification callback bound to one connection
///
/// Consumed by [`CloseNotifier::notify`], so a transport can fire it at most
/// once. The event is queued rather than handled inline; the registry picks it
/// up on its next dispatch step.
pub struct CloseNotifier {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<CloseEvent>,
}

impl CloseNotifier {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<CloseEvent>) -> Self {
        Self { id, tx }
    }

    /// Connection this notifier is bound to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Report that the connection has closed
    pub fn notify(self, reason: CloseReason) {
        // Receiver gone means the registry was dropped; nothing left to clean up.
        let _ = self.tx.send(CloseEvent { id: self.id, reason });
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseNotifier").field("id", &self.id).finish()
    }
}

/// Owned reference to a live transport-level connection
pub trait ConnectionHandle {
    /// Send one text frame
    fn send_text(&self, payload: &str) -> TransportResult<()>;

    /// Release the connection. Does not fire close-notification.
    fn release(self);
}

/// Process-wide capability to accept new connections
pub trait TransportFactory: Sized {
    type Config;
    /// Everything the transport needs to finish an in-progress upgrade
    type Upgrade;
    type Handle: ConnectionHandle;

    /// Create the factory
    fn create(config: &Self::Config) -> TransportResult<Self>;

    /// Complete the upgrade handshake for one connection
    ///
    /// On error the upgrade context is consumed and `on_close` is dropped
    /// without ever firing.
    fn try_accept(
        &self,
        upgrade: Self::Upgrade,
        on_message: MessageHandler,
        on_close: CloseNotifier,
    ) -> TransportResult<Self::Handle>;

    /// Release the factory once every connection is gone
    fn release(self);
}
