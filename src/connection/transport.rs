// =============================================================================
// Transport - the duplex text-frame socket the connection manager drives
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::FeedError;

/// An open duplex connection carrying UTF-8 text frames.
#[async_trait]
pub trait FrameSocket: Send {
    /// Next inbound text frame; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, FeedError>>;

    async fn send(&mut self, text: String) -> Result<(), FeedError>;

    async fn close(&mut self);
}

/// Opens [`FrameSocket`]s to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn FrameSocket>, FeedError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn FrameSocket>, FeedError> {
        info!(url = %endpoint, "connecting to market-data WebSocket");
        let (stream, _response) = connect_async(endpoint).await?;
        info!(url = %endpoint, "market-data WebSocket connected");
        Ok(Box::new(WsSocket { inner: stream }))
    }
}

struct WsSocket {
    inner: WsStream,
}

#[async_trait]
impl FrameSocket for WsSocket {
    async fn recv(&mut self) -> Option<Result<String, FeedError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("non UTF-8 binary frame ignored"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                // tungstenite answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            debug!(error = %e, "error while closing WebSocket");
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------
