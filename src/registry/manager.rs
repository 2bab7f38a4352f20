//! Connection registry
//!
//! Single owner of every live connection and of the transport factory.
//! All mutation happens through `&mut self`, so a broadcast can never observe
//! a connection being torn down underneath it: close notifications from the
//! transport are queued on a channel and applied between operations.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Category, Connection, ConnectionId};
use crate::transport::{
    CloseEvent, CloseNotifier, ConnectionHandle, MessageHandler, TransportError, TransportFactory,
};

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to initialize transport factory: {0}")]
    Initialization(#[source] TransportError),

    #[error("Registry already initialized")]
    AlreadyInitialized,

    #[error("Registry not initialized")]
    NotInitialized,

    #[error("Registry has been shut down")]
    ShutDown,

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] TransportError),

    #[error("Registry service is not running")]
    ServiceStopped,
}

impl RegistryError {
    /// True when an accept failed because the transport ran out of resources
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, RegistryError::Accept(TransportError::OutOfMemory))
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Running,
    ShutDown,
}

/// Registry of live connections, grouped by category for broadcast
pub struct ConnectionRegistry<F, C>
where
    F: TransportFactory,
    C: Category,
{
    lifecycle: Lifecycle,
    factory: Option<F>,
    connections: HashMap<ConnectionId, Connection<F::Handle, C>>,
    close_tx: mpsc::UnboundedSender<CloseEvent>,
}

impl<F, C> ConnectionRegistry<F, C>
where
    F: TransportFactory,
    C: Category,
{
    /// Create an uninitialized registry
    ///
    /// Returns the receiving end of the close-notification channel. The owner
    /// feeds every event back through [`ConnectionRegistry::handle_close`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CloseEvent>) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let registry = Self {
            lifecycle: Lifecycle::Uninitialized,
            factory: None,
            connections: HashMap::new(),
            close_tx,
        };
        (registry, close_rx)
    }

    /// Create the transport factory. Allowed once per registry.
    pub fn initialize(&mut self, config: &F::Config) -> RegistryResult<()> {
        if self.lifecycle != Lifecycle::Uninitialized {
            return Err(RegistryError::AlreadyInitialized);
        }

        let factory = F::create(config).map_err(RegistryError::Initialization)?;
        self.factory = Some(factory);
        self.lifecycle = Lifecycle::Running;

        info!("Connection registry initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    /// Complete an upgrade and register the resulting connection
    ///
    /// A failed handshake never joins the set and never fires close-notification.
    pub fn accept(
        &mut self,
        upgrade: F::Upgrade,
        category: C,
        on_message: MessageHandler,
    ) -> RegistryResult<ConnectionId> {
        let factory = match self.lifecycle {
            Lifecycle::Uninitialized => return Err(RegistryError::NotInitialized),
            Lifecycle::ShutDown => return Err(RegistryError::ShutDown),
            Lifecycle::Running => self.factory.as_ref().ok_or(RegistryError::NotInitialized)?,
        };

        let id = ConnectionId::new();
        let on_close = CloseNotifier::new(id, self.close_tx.clone());

        let handle = factory.try_accept(upgrade, on_message, on_close).map_err(|e| {
            warn!(category = ?category, "Upgrade rejected: {}", e);
            RegistryError::Accept(e)
        })?;

        self.connections
            .insert(id, Connection::new(id, category, handle));
        info!(
            connection = %id,
            category = ?category,
            live = self.connections.len(),
            "Connection registered"
        );
        Ok(id)
    }

    /// Send `payload` to every live connection of `category`
    ///
    /// Best effort: a failed send is logged and skipped. Returns how many
    /// connections matched.
    pub fn broadcast(&self, category: C, payload: &str) -> usize {
        let mut matched = 0;
        let mut failed = 0;

        for conn in self.connections.values() {
            if conn.category() != category {
                continue;
            }
            matched += 1;
            if let Err(e) = conn.handle().send_text(payload) {
                failed += 1;
                debug!(connection = %conn.id(), "Broadcast send failed: {}", e);
            }
        }

        debug!(
            category = ?category,
            matched,
            failed,
            bytes = payload.len(),
            "Broadcast"
        );
        matched
    }

    /// Send `payload` to one connection, best effort like [`Self::broadcast`]
    pub fn send_to(&self, id: ConnectionId, payload: &str) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        match conn.handle().send_text(payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(connection = %id, "Send failed: {}", e);
                false
            }
        }
    }

    /// Apply a close notification from the transport
    ///
    /// Returns false if the connection was already gone, which makes repeated
    /// notifications a no-op.
    pub fn handle_close(&mut self, event: CloseEvent) -> bool {
        match self.destroy(event.id) {
            Some(category) => {
                info!(
                    connection = %event.id,
                    category = ?category,
                    live = self.connections.len(),
                    "Connection closed: {}",
                    event.reason
                );
                true
            }
            None => {
                debug!(connection = %event.id, "Ignoring close for unknown connection");
                false
            }
        }
    }

    /// Tear down a connection on request of the host
    pub fn close(&mut self, id: ConnectionId) -> bool {
        match self.destroy(id) {
            Some(category) => {
                info!(connection = %id, category = ?category, "Connection closed by host");
                true
            }
            None => false,
        }
    }

    /// Remove from the set and release the handle in the same step
    fn destroy(&mut self, id: ConnectionId) -> Option<C> {
        let conn = self.connections.remove(&id)?;
        let category = conn.category();
        conn.into_handle().release();
        Some(category)
    }

    /// Tear down every connection, then release the factory
    ///
    /// Safe to call repeatedly; only the first call does anything.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::Uninitialized {
            self.lifecycle = Lifecycle::ShutDown;
            return;
        }

        let count = self.connections.len();
        if count > 0 {
            info!("Closing {} live connections", count);
        }
        for (_, conn) in self.connections.drain() {
            conn.into_handle().release();
        }

        if let Some(factory) = self.factory.take() {
            factory.release();
            info!("Connection registry shut down");
        }
        self.lifecycle = Lifecycle::ShutDown;
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of live connections in `category`
    pub fn count(&self, category: C) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.category() == category)
            .count()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<F::Handle, C>> {
        self.connections.get(&id)
    }

    /// Ids of the live connections in `category`
    pub fn connection_ids(&self, category: C) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|conn| conn.category() == category)
            .map(|conn| conn.id())
            .collect()
    }
}

impl<F, C> Drop for ConnectionRegistry<F, C>
where
    F: TransportFactory,
    C: Category,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
