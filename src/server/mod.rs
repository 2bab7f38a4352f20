//! WebSocket server module
//!
//! Runs the registry service, accepts TCP connections, routes upgrade
//! requests to channels and publishes telemetry.

mod channel;
mod protocol;
mod service;
mod upgrade;
mod websocket;

pub use channel::*;
pub use protocol::*;
pub use service::*;
pub use upgrade::*;
pub use websocket::*;
