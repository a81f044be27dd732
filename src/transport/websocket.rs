//! WebSocket transport
//!
//! Each frame batch travels as one binary WebSocket message. The same type
//! serves the client side (`connect`) and the service side (`accept`).

use super::{Dialer, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// WebSocket transport over any byte stream
pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    ws: WebSocketStream<S>,
    connected: bool,
}

impl WebSocketTransport {
    /// Connect to the service
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!(target: "tether::transport", "websocket connected to {}", url);
        Ok(WebSocketTransport {
            ws,
            connected: true,
        })
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Accept an incoming WebSocket handshake on a raw stream
    pub async fn accept(stream: S) -> TransportResult<Self> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(WebSocketTransport {
            ws,
            connected: true,
        })
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self) -> TransportResult<Vec<u8>> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Close(_))) | None => {
                    self.connected = false;
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(TransportError::InvalidData(
                        "unexpected text message".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                _ => continue,
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Dials a fixed WebSocket URL
#[derive(Clone, Debug)]
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    /// Dialer for the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketDialer { url: url.into() }
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> TransportResult<Box<dyn Transport>> {
        let transport = WebSocketTransport::connect(&self.url).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_websocket_binary_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = WebSocketTransport::accept(stream).await.unwrap();
            let data = transport.receive().await.unwrap();
            transport.send(&data).await.unwrap();
        });

        let dialer = WebSocketDialer::new(format!("ws://{}", addr));
        let mut client = dialer.dial().await.unwrap();
        client.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), vec![1, 2, 3]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let result = WebSocketTransport::connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
