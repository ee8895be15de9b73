//! Socket abstraction for the session transport.
//!
//! The session task only sees [`Connector`] and [`Socket`]. Production code uses
//! [`WebSocketConnector`]; tests use [`super::memory::MemoryConnector`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ViewerError, ViewerResult};

/// One open, text-framed connection.
#[async_trait]
pub trait Socket: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, text: String) -> ViewerResult<()>;

    /// Waits for the next text frame. `None` means the peer closed the socket.
    async fn next_text(&mut self) -> Option<ViewerResult<String>>;

    /// Closes the socket.
    async fn close(&mut self) -> ViewerResult<()>;
}

/// Opens sockets to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a socket; a failure counts as one failed attempt.
    async fn open(&self, endpoint: &Url) -> ViewerResult<Box<dyn Socket>>;
}

/// Builds the WebSocket endpoint from a base URL and a path.
///
/// `http` and `https` base URLs are mapped to `ws` and `wss`.
pub fn endpoint(base_url: &str, ws_path: &str) -> ViewerResult<Url> {
    let mut url =
        Url::parse(base_url).map_err(|e| ViewerError::InvalidTarget(format!("{base_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ViewerError::InvalidTarget(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(ViewerError::InvalidTarget(base_url.to_string()));
    }
    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        ws_path.trim_start_matches('/')
    );
    url.set_path(&path);
    Ok(url)
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector that abandons a handshake after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &Url) -> ViewerResult<Box<dyn Socket>> {
        let handshake = tokio_tungstenite::connect_async(endpoint.as_str());
        let (stream, response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ViewerError::TransientNetworkFailure(format!(
                    "handshake with {endpoint} timed out after {} ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| ViewerError::TransientNetworkFailure(e.to_string()))?;
        debug!(status = %response.status(), endpoint = %endpoint, "WebSocket handshake complete");
        Ok(Box::new(WebSocket { stream }))
    }
}

struct WebSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WebSocket {
    async fn send_text(&mut self, text: String) -> ViewerResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ViewerError::TransientNetworkFailure(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<ViewerResult<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!(error = %e, "Dropping non UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Peer closed the socket");
                    return None;
                }
                // Ping replies are queued by tungstenite and flushed on the next write.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(ViewerError::TransientNetworkFailure(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> ViewerResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ViewerError::TransientNetworkFailure(e.to_string()))
    }
}
