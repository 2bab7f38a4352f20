//! WebSocket transport
//!
//! Completes RFC 6455 upgrades for requests whose head has already been read
//! by the host, then runs one task per connection that frames outbound text
//! and forwards inbound messages.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_tungstenite::tungstenite::handshake::server::{create_response, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::{
    CloseNotifier, CloseReason, ConnectionHandle, Inbound, MessageHandler, TransportError,
    TransportFactory, TransportResult,
};
use crate::registry::ConnectionId;

/// Default maximum number of concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default maximum message size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default maximum frame size (256KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Limits applied by the WebSocket transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsTransportConfig {
    /// Connection slots; accepting beyond this fails with `OutOfMemory`
    pub max_connections: usize,
    /// Largest inbound message, in bytes
    pub max_message_size: usize,
    /// Largest inbound frame, in bytes
    pub max_frame_size: usize,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl WsTransportConfig {
    /// Set the connection slot count
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    fn validate(&self) -> TransportResult<()> {
        if self.max_connections == 0 || self.max_connections > Semaphore::MAX_PERMITS {
            return Err(TransportError::InvalidConfig(format!(
                "max_connections must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.max_message_size == 0 || self.max_frame_size == 0 {
            return Err(TransportError::InvalidConfig(
                "message and frame size limits must be non-zero".to_string(),
            ));
        }
        if self.max_frame_size > self.max_message_size {
            return Err(TransportError::InvalidConfig(format!(
                "max_frame_size ({}) exceeds max_message_size ({})",
                self.max_frame_size, self.max_message_size
            )));
        }
        Ok(())
    }

    fn protocol_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

/// An upgrade request whose head has been read off `stream`
pub struct WsUpgrade<S = TcpStream> {
    stream: S,
    request: Request,
    peer: Option<SocketAddr>,
}

impl<S> WsUpgrade<S> {
    pub fn new(stream: S, request: Request) -> Self {
        Self {
            stream,
            request,
            peer: None,
        }
    }

    /// Attach the remote address for diagnostics
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}

/// Accepts WebSocket upgrades and spawns connection tasks on the runtime
/// that was current when the factory was created
pub struct WebSocketFactory<S = TcpStream> {
    runtime: Handle,
    slots: Arc<Semaphore>,
    config: WsTransportConfig,
    _stream: PhantomData<fn(S)>,
}

impl<S> WebSocketFactory<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Connections currently holding a slot (including ones still draining after release)
    pub fn active(&self) -> usize {
        self.config.max_connections - self.slots.available_permits()
    }

    /// Answer a request we will not upgrade and drop the stream
    fn reject(&self, mut stream: S, status: StatusCode) {
        self.runtime.spawn(async move {
            let head = format!(
                "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                status
            );
            if let Err(e) = stream.write_all(head.as_bytes()).await {
                debug!("Failed to write {} rejection: {}", status, e);
            }
            let _ = stream.shutdown().await;
        });
    }
}

impl<S> TransportFactory for WebSocketFactory<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Config = WsTransportConfig;
    type Upgrade = WsUpgrade<S>;
    type Handle = WsHandle;

    fn create(config: &WsTransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| TransportError::Runtime(e.to_string()))?;

        info!(
            "WebSocket transport ready (max {} connections)",
            config.max_connections
        );
        Ok(Self {
            runtime,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            config: config.clone(),
            _stream: PhantomData,
        })
    }

    fn try_accept(
        &self,
        upgrade: WsUpgrade<S>,
        on_message: MessageHandler,
        on_close: CloseNotifier,
    ) -> TransportResult<WsHandle> {
        let WsUpgrade {
            stream,
            request,
            peer,
        } = upgrade;

        let response = match create_response(&request) {
            Ok(response) => response,
            Err(e) => {
                self.reject(stream, StatusCode::BAD_REQUEST);
                return Err(TransportError::Handshake(e.to_string()));
            }
        };

        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.reject(stream, StatusCode::SERVICE_UNAVAILABLE);
                return Err(TransportError::OutOfMemory);
            }
            Err(TryAcquireError::Closed) => return Err(TransportError::Closed),
        };

        let id = on_close.id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            id,
            outbound: outbound_rx,
            on_message,
            on_close,
            config: self.config.protocol_config(),
            _permit: permit,
        };
        self.runtime.spawn(task.run(stream, encode_response(&response)));

        debug!(connection = %id, peer = ?peer, "Upgrade accepted");
        Ok(WsHandle {
            id,
            peer,
            outbound: outbound_tx,
        })
    }

    fn release(self) {
        self.slots.close();
        info!(
            "WebSocket transport released ({} connection tasks draining)",
            self.active()
        );
    }
}

/// Owned handle to one upgraded connection
#[derive(Debug)]
pub struct WsHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsHandle {
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl ConnectionHandle for WsHandle {
    fn send_text(&self, payload: &str) -> TransportResult<()> {
        self.outbound
            .send(Message::Text(payload.to_owned()))
            .map_err(|_| TransportError::Closed)
    }

    fn release(self) {
        // Dropping the sender tells the task to flush, send Close and exit quietly.
        debug!(connection = %self.id, "Releasing connection handle");
    }
}

struct ConnectionTask {
    id: ConnectionId,
    outbound: mpsc::UnboundedReceiver<Message>,
    on_message: MessageHandler,
    on_close: CloseNotifier,
    config: WebSocketConfig,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionTask {
    async fn run<S>(mut self, mut stream: S, response: Vec<u8>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.id;

        if let Err(e) = write_head(&mut stream, &response).await {
            warn!(connection = %id, "Failed to complete handshake: {}", e);
            self.on_close.notify(CloseReason::Error(e.to_string()));
            return;
        }

        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, Some(self.config)).await;
        let (mut sink, mut source) = ws.split();

        // None means the handle was released.
        let reason = loop {
            tokio::select! {
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                break Some(CloseReason::Error(e.to_string()));
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break None;
                        }
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => (self.on_message)(id, Inbound::Text(text)),
                        Some(Ok(Message::Binary(data))) => (self.on_message)(id, Inbound::Binary(data)),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                                .unwrap_or((None, String::new()));
                            // Write out the Close reply tungstenite queued while reading.
                            let _ = sink.flush().await;
                            break Some(CloseReason::PeerClosed { code, reason });
                        }
                        // Pongs are queued by tungstenite itself
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(CloseReason::Error(e.to_string())),
                        None => break Some(CloseReason::Disconnected),
                    }
                }
            }
        };

        match reason {
            Some(reason) => {
                debug!(connection = %id, "Connection closed: {}", reason);
                self.on_close.notify(reason);
            }
            None => debug!(connection = %id, "Connection task finished after release"),
        }
    }
}

async fn write_head<S>(stream: &mut S, head: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(head).await?;
    stream.flush().await
}

/// Serialize a handshake response head
fn encode_response(response: &Response) -> Vec<u8> {
    let mut head = format!("{:?} {}\r\n", response.version(), response.status());
    for (name, value) in response.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str().unwrap_or_default());
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::read_request;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_tungstenite::client_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use uuid::Uuid;

    type TestFactory = WebSocketFactory<DuplexStream>;

    fn notifier() -> (CloseNotifier, mpsc::UnboundedReceiver<crate::transport::CloseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CloseNotifier::new(ConnectionId::from(Uuid::new_v4()), tx), rx)
    }

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |_: ConnectionId, message: Inbound| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    /// Start a client handshake and read its request head on the server side
    async fn connect() -> (
        WsUpgrade<DuplexStream>,
        tokio::task::JoinHandle<Result<WebSocketStream<DuplexStream>, WsError>>,
    ) {
        let (client_io, mut server_io) = duplex(64 * 1024);
        let request = "ws://localhost/ws/control".into_client_request().unwrap();
        let client = tokio::spawn(async move {
            client_async(request, client_io)
                .await
                .map(|(stream, _)| stream)
        });
        let request = read_request(&mut server_io, 8192).await.unwrap();
        (WsUpgrade::new(server_io, request), client)
    }

    #[test]
    fn test_config_validation() {
        assert!(WsTransportConfig::default().validate().is_ok());
        assert!(WsTransportConfig::default()
            .with_max_connections(0)
            .validate()
            .is_err());

        let config = WsTransportConfig {
            max_frame_size: 2048,
            max_message_size: 1024,
            ..WsTransportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_create_without_runtime() {
        let result = TestFactory::create(&WsTransportConfig::default());
        assert!(matches!(result, Err(TransportError::Runtime(_))));
    }

    #[test]
    fn test_encode_response() {
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        let head = String::from_utf8(encode_response(&response)).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_send_and_receive_text() {
        let factory = TestFactory::create(&WsTransportConfig::default()).unwrap();
        let (upgrade, client) = connect().await;
        let (handler, mut inbound) = collecting_handler();
        let (on_close, _events) = notifier();

        let handle = factory.try_accept(upgrade, handler, on_close).unwrap();
        let mut client = client.await.unwrap().unwrap();
        assert_eq!(factory.active(), 1);

        handle.send_text("hello").unwrap();
        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "hello"),
            other => panic!("Expected text frame, got {:?}", other),
        }

        client.send(Message::Text("from client".into())).await.unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(Inbound::Text("from client".to_string()))
        );
    }

    #[tokio::test]
    async fn test_peer_close_notifies_once() {
        let factory = TestFactory::create(&WsTransportConfig::default()).unwrap();
        let (upgrade, client) = connect().await;
        let (handler, _inbound) = collecting_handler();
        let (on_close, mut events) = notifier();
        let id = on_close.id();

        let handle = factory.try_accept(upgrade, handler, on_close).unwrap();
        let mut client = client.await.unwrap().unwrap();
        client.close(None).await.unwrap();

        // The server answers the closing handshake instead of dropping the socket.
        match client.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("Expected close reply, got {:?}", other),
        }

        let event = events.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert!(matches!(event.reason, CloseReason::PeerClosed { .. }));
        // The notifier was consumed, so the channel is now closed.
        assert!(events.recv().await.is_none());
        handle.release();
    }

    #[tokio::test]
    async fn test_release_sends_close_without_notifying() {
        let factory = TestFactory::create(&WsTransportConfig::default()).unwrap();
        let (upgrade, client) = connect().await;
        let (handler, _inbound) = collecting_handler();
        let (on_close, mut events) = notifier();

        let handle = factory.try_accept(upgrade, handler, on_close).unwrap();
        let mut client = client.await.unwrap().unwrap();

        handle.send_text("last words").unwrap();
        handle.release();

        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "last words"),
            other => panic!("Expected queued text before close, got {:?}", other),
        }
        match client.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("Expected close frame, got {:?}", other),
        }

        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_upgrade_rejected() {
        let factory = TestFactory::create(&WsTransportConfig::default()).unwrap();
        let (server_io, mut client_io) = duplex(4096);
        let request = Request::builder()
            .method("GET")
            .uri("/ws/control")
            .header("Host", "localhost")
            .body(())
            .unwrap();
        let (handler, _inbound) = collecting_handler();
        let (on_close, mut events) = notifier();

        let result = factory.try_accept(WsUpgrade::new(server_io, request), handler, on_close);
        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert_eq!(factory.active(), 0);

        let mut reply = String::new();
        client_io.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));

        // A rejected handshake never reports closure.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slot_exhaustion_is_out_of_memory() {
        let config = WsTransportConfig::default().with_max_connections(1);
        let factory = TestFactory::create(&config).unwrap();

        let (first, client) = connect().await;
        let (handler, _inbound) = collecting_handler();
        let (on_close, _events) = notifier();
        let _handle = factory.try_accept(first, handler.clone(), on_close).unwrap();
        let _client = client.await.unwrap().unwrap();

        let (second, rejected) = connect().await;
        let (on_close, _events) = notifier();
        let result = factory.try_accept(second, handler, on_close);
        assert!(matches!(result, Err(TransportError::OutOfMemory)));

        match rejected.await.unwrap() {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("Expected 503 rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_release_closes_slots() {
        let factory = TestFactory::create(&WsTransportConfig::default()).unwrap();
        let slots = Arc::clone(&factory.slots);
        factory.release();
        assert!(slots.is_closed());
    }
}
