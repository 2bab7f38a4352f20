//! WebSocket server implementation
//!
//! Listens on a configurable port, reads each upgrade request, routes it to a
//! channel and hands the stream to the registry service. Also drives the
//! telemetry heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::channel::Channel;
use super::protocol::{ConnectionCounts, ServerMessage};
use super::service::{Greeting, RegistryHandle, RegistryService};
use super::upgrade::{read_request, respond_error};
use crate::registry::ConnectionId;
use crate::transport::{Inbound, MessageHandler, WebSocketFactory, WsTransportConfig, WsUpgrade};

/// Registry handle as used by this server
pub type Hub = RegistryHandle<WsUpgrade, Channel>;

/// Default telemetry interval
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default time allowed for a client to send its upgrade request
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on the upgrade request head (8KB)
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Period of the telemetry heartbeat
    pub telemetry_interval: Duration,
    /// Time allowed for reading the upgrade request
    pub handshake_timeout: Duration,
    /// Largest accepted upgrade request head, in bytes
    pub max_request_size: usize,
    /// Transport limits
    pub transport: WsTransportConfig,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            transport: WsTransportConfig::default(),
        }
    }

    /// Set the telemetry heartbeat period
    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Set the transport limits
    pub fn with_transport(mut self, transport: WsTransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server fronting the connection registry
pub struct WebSocketServer {
    config: Arc<ServerConfig>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    ///
    /// Sticky: a shutdown requested before [`Self::serve`] starts makes it
    /// return right after startup.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// On shutdown, stops accepting, closes every live connection and
    /// releases the transport before returning.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let addr = listener.local_addr()?;
        let hub: Hub =
            RegistryService::start::<WebSocketFactory, Channel>(&self.config.transport)?;
        info!("WebSocket server listening on ws://{}/ws/{{control,telemetry}}", addr);

        let started = Instant::now();
        let period = self.config.telemetry_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seq = 0u64;

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = hub.clone();
                            let config = Arc::clone(&self.config);
                            tokio::spawn(handle_connection(stream, peer_addr, hub, config));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    seq += 1;
                    publish_tick(&hub, seq, started.elapsed()).await;
                }
                // Handle shutdown signal
                _ = stop_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let live = hub.len().await;
        if live > 0 {
            info!("Closing {} active connections...", live);
        }
        hub.shutdown().await;

        Ok(())
    }
}

/// Resolves once shutdown has been requested, including before this call
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Broadcast one telemetry heartbeat, skipped when nobody listens
async fn publish_tick(hub: &Hub, seq: u64, uptime: Duration) {
    let counts = ConnectionCounts {
        control: hub.count(Channel::Control).await,
        telemetry: hub.count(Channel::Telemetry).await,
    };
    if counts.telemetry == 0 {
        return;
    }

    let uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX);
    match ServerMessage::tick(seq, uptime_ms, counts).to_json() {
        Ok(json) => hub.broadcast(Channel::Telemetry, json),
        Err(e) => error!("Failed to encode tick: {}", e),
    }
}

/// Read the upgrade request, route it and register the connection
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Hub,
    config: Arc<ServerConfig>,
) {
    debug!("New connection from {}", peer_addr);

    let request = match timeout(
        config.handshake_timeout,
        read_request(&mut stream, config.max_request_size),
    )
    .await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("Bad upgrade request from {}: {}", peer_addr, e);
            let _ = respond_error(&mut stream, StatusCode::BAD_REQUEST).await;
            return;
        }
        Err(_) => {
            warn!("Timed out waiting for upgrade request from {}", peer_addr);
            return;
        }
    };

    let Some(channel) = Channel::from_path(request.uri().path()) else {
        warn!(
            "No channel at {} (requested by {})",
            request.uri().path(),
            peer_addr
        );
        let _ = respond_error(&mut stream, StatusCode::NOT_FOUND).await;
        return;
    };

    let on_message = message_handler(channel, hub.clone());
    let upgrade = WsUpgrade::new(stream, request).with_peer(peer_addr);
    match hub
        .accept_with_greeting(upgrade, channel, on_message, welcome(channel))
        .await
    {
        Ok(id) => info!(connection = %id, "Client {} joined {}", peer_addr, channel),
        Err(e) => warn!("Rejected {} on {}: {}", peer_addr, channel, e),
    }
}

/// Welcome message sent ahead of any broadcast
fn welcome(channel: Channel) -> Greeting {
    Box::new(move |id: ConnectionId| {
        match ServerMessage::welcome(id, channel).to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to encode welcome: {}", e);
                None
            }
        }
    })
}

/// Inbound handling per channel
fn message_handler(channel: Channel, hub: Hub) -> MessageHandler {
    Arc::new(move |id: ConnectionId, message: Inbound| match (channel, message) {
        (Channel::Control, Inbound::Text(text)) => match ServerMessage::relay(id, text) {
            Ok(relay) => match relay.to_json() {
                Ok(json) => hub.broadcast(Channel::Control, json),
                Err(e) => error!("Failed to encode relay: {}", e),
            },
            Err(e) => warn!(connection = %id, "Dropping control message: {}", e),
        },
        (channel, Inbound::Binary(data)) => {
            debug!(connection = %id, "Ignoring {} byte binary message on {}", data.len(), channel);
        }
        (Channel::Telemetry, Inbound::Text(_)) => {
            debug!(connection = %id, "Ignoring text on telemetry channel");
        }
    })
}
