//! Transport layer
//!
//! Bytes move through a pluggable [`Transport`]:
//! - In-memory channels (tests, embedded service)
//! - WebSocket connections (the real network)
//!
//! On top of it sit the length-prefixed frame codec ([`frame`]) and the
//! Noise XX handshake that turns a framed transport into an encrypted
//! [`NoiseSocket`] carrying binary nodes.

use async_trait::async_trait;
use thiserror::Error;

pub mod frame;
pub mod handshake;
pub mod noise;
pub mod websocket;

pub use frame::{encode_frame, FrameReader, FrameSocket, Role, FRAME_HEADER, MAX_FRAME_SIZE};
pub use handshake::{client_handshake, server_handshake, ClientAuth, ClientPayload, ServerHello};
pub use noise::NoiseSocket;
pub use websocket::{WebSocketDialer, WebSocketTransport};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Frame exceeds the 24-bit length prefix or the Noise message limit
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Peer did not open with the protocol header
    #[error("Invalid connection header")]
    InvalidHeader,

    /// Noise handshake or transport failure
    #[error("Noise error: {0}")]
    Noise(String),

    /// Server static key differs from the pinned key
    #[error("Server static key does not match the pinned key")]
    ServerKeyMismatch,

    /// Node could not be decoded
    #[error("Malformed node: {0}")]
    Binary(#[from] crate::binary::BinaryError),
}

impl From<snow::Error> for TransportError {
    fn from(err: snow::Error) -> Self {
        TransportError::Noise(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract transport trait
///
/// A transport only moves opaque messages; framing and encryption happen
/// above it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send data to the peer
    async fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Receive data from the peer
    ///
    /// Blocks until data is available or the connection is closed.
    async fn receive(&mut self) -> TransportResult<Vec<u8>>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens new transports to the service; called again on every reconnect.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a fresh connection
    async fn dial(&self) -> TransportResult<Box<dyn Transport>>;
}

/// In-memory transport for testing
///
/// Uses channels to simulate a connection between two endpoints.
pub mod memory {
    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// Create a pair of connected in-memory transports
    pub fn create_pair() -> (MemoryTransport, MemoryTransport) {
        let (tx1, rx1) = mpsc::channel(100);
        let (tx2, rx2) = mpsc::channel(100);

        let transport1 = MemoryTransport {
            tx: tx1,
            rx: rx2,
            connected: true,
        };

        let transport2 = MemoryTransport {
            tx: tx2,
            rx: rx1,
            connected: true,
        };

        (transport1, transport2)
    }

    /// In-memory transport endpoint
    pub struct MemoryTransport {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.tx
                .send(data.to_vec())
                .await
                .map_err(|_| TransportError::Disconnected)
        }

        async fn receive(&mut self) -> TransportResult<Vec<u8>> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            match self.rx.recv().await {
                Some(data) => Ok(data),
                None => {
                    self.connected = false;
                    Err(TransportError::Disconnected)
                }
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected = false;
            // Dropping our receiver makes the peer's sends fail
            self.rx.close();
            Ok(())
        }
    }

    /// Create a dialer and the listener that receives the accepted ends
    pub fn listener() -> (MemoryDialer, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemoryDialer { accept_tx: tx }, MemoryListener { accept_rx: Mutex::new(rx) })
    }

    /// Dials by handing the far end of a fresh pair to a [`MemoryListener`]
    #[derive(Clone)]
    pub struct MemoryDialer {
        accept_tx: mpsc::UnboundedSender<MemoryTransport>,
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(&self) -> TransportResult<Box<dyn Transport>> {
            let (client, server) = create_pair();
            self.accept_tx
                .send(server)
                .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;
            Ok(Box::new(client))
        }
    }

    /// Receives transports opened by a [`MemoryDialer`]
    pub struct MemoryListener {
        accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryTransport>>,
    }

    impl MemoryListener {
        /// Wait for the next connection; `None` once every dialer is gone
        pub async fn accept(&self) -> Option<MemoryTransport> {
            self.accept_rx.lock().await.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport() {
        let (mut client, mut server) = memory::create_pair();

        client.send(b"hello service").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"hello service");

        server.send(b"hello client").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), b"hello client");
    }

    #[tokio::test]
    async fn test_memory_transport_close() {
        let (mut client, mut server) = memory::create_pair();

        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.send(b"test").await.is_err());

        // The peer notices once our receiving side is gone
        assert!(server.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_drop_ends_receive() {
        let (mut client, server) = memory::create_pair();
        drop(server);
        assert!(matches!(
            client.receive().await,
            Err(TransportError::Disconnected)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_memory_dialer_reaches_listener() {
        let (dialer, listener) = memory::listener();

        let mut client = dialer.dial().await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.send(b"ping").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"ping");

        drop(listener);
        assert!(dialer.dial().await.is_err());
    }
}
