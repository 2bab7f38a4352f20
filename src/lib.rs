//! Categorized WebSocket connection registry
//!
//! Accepts upgraded connections into a registry keyed by category, tears them
//! down when they close and broadcasts text to every live connection of a
//! category. The [`server`] module embeds the registry behind a TCP listener.

pub mod config;
pub mod registry;
pub mod server;
pub mod transport;

pub use registry::{Category, ConnectionId, ConnectionRegistry, RegistryError, RegistryResult};
pub use transport::{CloseReason, ConnectionHandle, Inbound, MessageHandler, TransportFactory};
