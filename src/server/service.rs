//! Registry service
//!
//! Runs a [`ConnectionRegistry`] on a single task. Commands from any number of
//! [`RegistryHandle`]s and close notifications from the transport are handled
//! one at a time, so the registry itself needs no locking.

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::registry::{Category, ConnectionId, ConnectionRegistry, RegistryError, RegistryResult};
use crate::transport::{CloseEvent, CloseReason, MessageHandler, TransportFactory};

/// Capacity of the connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Builds the first message a newly accepted connection receives
///
/// Returning `None` skips the greeting.
pub type Greeting = Box<dyn FnOnce(ConnectionId) -> Option<String> + Send>;

/// Lifecycle events published by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent<C> {
    Opened {
        id: ConnectionId,
        category: C,
    },
    Closed {
        id: ConnectionId,
        category: C,
        /// `None` when the host closed the connection
        reason: Option<CloseReason>,
    },
}

enum Command<U, C> {
    Accept {
        upgrade: U,
        category: C,
        on_message: MessageHandler,
        greeting: Option<Greeting>,
        reply: oneshot::Sender<RegistryResult<ConnectionId>>,
    },
    Broadcast {
        category: C,
        payload: String,
    },
    Close {
        id: ConnectionId,
    },
    Count {
        category: Option<C>,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Entry point for starting the registry task
pub struct RegistryService;

impl RegistryService {
    /// Initialize a registry and spawn the task that owns it
    ///
    /// Must be called from within a tokio runtime. Fails if the transport
    /// factory cannot be created.
    pub fn start<F, C>(config: &F::Config) -> RegistryResult<RegistryHandle<F::Upgrade, C>>
    where
        F: TransportFactory + Send + 'static,
        F::Upgrade: Send + 'static,
        F::Handle: Send + 'static,
        C: Category,
    {
        let (mut registry, close_rx) = ConnectionRegistry::<F, C>::new();
        registry.initialize(config)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run(registry, command_rx, close_rx, event_tx.clone()));

        Ok(RegistryHandle {
            commands: command_tx,
            events: event_tx,
        })
    }
}

/// Cloneable handle to a running registry service
pub struct RegistryHandle<U, C> {
    commands: mpsc::UnboundedSender<Command<U, C>>,
    events: broadcast::Sender<ConnectionEvent<C>>,
}

impl<U, C> Clone for RegistryHandle<U, C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
        }
    }
}

impl<U, C: Category> RegistryHandle<U, C> {
    /// Complete an upgrade and register the connection under `category`
    pub async fn accept(
        &self,
        upgrade: U,
        category: C,
        on_message: MessageHandler,
    ) -> RegistryResult<ConnectionId> {
        self.accept_inner(upgrade, category, on_message, None).await
    }

    /// Like [`Self::accept`], but sends `greeting` to the new connection
    /// before any command queued after this one is processed
    pub async fn accept_with_greeting(
        &self,
        upgrade: U,
        category: C,
        on_message: MessageHandler,
        greeting: Greeting,
    ) -> RegistryResult<ConnectionId> {
        self.accept_inner(upgrade, category, on_message, Some(greeting))
            .await
    }

    async fn accept_inner(
        &self,
        upgrade: U,
        category: C,
        on_message: MessageHandler,
        greeting: Option<Greeting>,
    ) -> RegistryResult<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Accept {
            upgrade,
            category,
            on_message,
            greeting,
            reply,
        })?;
        rx.await.map_err(|_| RegistryError::ServiceStopped)?
    }

    /// Queue `payload` for every connection in `category`
    ///
    /// Fire-and-forget: returns as soon as the command is queued.
    pub fn broadcast(&self, category: C, payload: impl Into<String>) {
        let _ = self.send(Command::Broadcast {
            category,
            payload: payload.into(),
        });
    }

    /// Tear down one connection
    pub fn close(&self, id: ConnectionId) {
        let _ = self.send(Command::Close { id });
    }

    /// Live connections in `category`
    pub async fn count(&self, category: C) -> usize {
        self.query_count(Some(category)).await
    }

    /// All live connections
    pub async fn len(&self) -> usize {
        self.query_count(None).await
    }

    /// Subscribe to connection open/close events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<C>> {
        self.events.subscribe()
    }

    /// Close every connection and release the transport
    ///
    /// Returns once the registry is drained. Calling it again, or after the
    /// service has stopped, does nothing.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn query_count(&self, category: Option<C>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Count { category, reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: Command<U, C>) -> RegistryResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RegistryError::ServiceStopped)
    }
}

async fn run<F, C>(
    mut registry: ConnectionRegistry<F, C>,
    mut commands: mpsc::UnboundedReceiver<Command<F::Upgrade, C>>,
    mut closes: mpsc::UnboundedReceiver<CloseEvent>,
    events: broadcast::Sender<ConnectionEvent<C>>,
) where
    F: TransportFactory,
    C: Category,
{
    debug!("Registry service started");

    loop {
        tokio::select! {
            // Registry holds a sender, so this branch never yields None.
            Some(event) = closes.recv() => {
                let id = event.id;
                let category = registry.get(id).map(|conn| conn.category());
                let reason = event.reason.clone();
                if registry.handle_close(event) {
                    if let Some(category) = category {
                        let _ = events.send(ConnectionEvent::Closed { id, category, reason: Some(reason) });
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    info!("All registry handles dropped");
                    break;
                };
                match command {
                    Command::Accept { upgrade, category, on_message, greeting, reply } => {
                        let result = registry.accept(upgrade, category, on_message);
                        if let Ok(id) = result {
                            if let Some(payload) = greeting.and_then(|greet| greet(id)) {
                                registry.send_to(id, &payload);
                            }
                            let _ = events.send(ConnectionEvent::Opened { id, category });
                        }
                        let _ = reply.send(result);
                    }
                    Command::Broadcast { category, payload } => {
                        registry.broadcast(category, &payload);
                    }
                    Command::Close { id } => {
                        let category = registry.get(id).map(|conn| conn.category());
                        if registry.close(id) {
                            if let Some(category) = category {
                                let _ = events.send(ConnectionEvent::Closed { id, category, reason: None });
                            }
                        }
                    }
                    Command::Count { category, reply } => {
                        let count = match category {
                            Some(category) => registry.count(category),
                            None => registry.len(),
                        };
                        let _ = reply.send(count);
                    }
                    Command::Shutdown { reply } => {
                        registry.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
    }

    registry.shutdown();
    debug!("Registry service stopped");
}
