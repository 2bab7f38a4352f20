//! Upgrade request reading
//!
//! Reads the HTTP request head off a freshly accepted stream so the
//! transport can complete the WebSocket handshake.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::{self, StatusCode, Version};

/// Maximum number of request headers accepted
const MAX_HEADERS: usize = 64;

/// Errors that can occur while reading an upgrade request
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Parse(#[from] httparse::Error),

    #[error("Invalid request: {0}")]
    Http(#[from] http::Error),

    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed before request head was complete")]
    Incomplete,
}

/// Read and parse one request head, at most `limit` bytes
///
/// Stops at the blank line that ends the head. Clients wait for the
/// handshake response before sending frames, so nothing past it is consumed.
pub async fn read_request<S>(stream: &mut S, limit: usize) -> Result<Request, UpgradeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpgradeError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = parse_head(&buf)? {
            return Ok(request);
        }
        if buf.len() >= limit {
            return Err(UpgradeError::TooLarge(limit));
        }
    }
}

/// Parse a complete request head, or `None` if more bytes are needed
fn parse_head(buf: &[u8]) -> Result<Option<Request>, UpgradeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    if parsed.parse(buf)?.is_partial() {
        return Ok(None);
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    Ok(Some(builder.body(())?))
}

/// Write a bodiless error response and close the stream
pub async fn respond_error<S>(stream: &mut S, status: StatusCode) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status
    );
    stream.write_all(head.as_bytes()).await?;
    stream.shutdown().await
}
