//! Encrypted node socket
//!
//! After the handshake every frame is one Noise transport message holding
//! one marshalled [`Node`].

use snow::{HandshakeState, TransportState};
use tracing::trace;

use super::frame::FrameSocket;
use super::{TransportError, TransportResult};
use crate::binary::{self, Node};

/// Noise protocol spoken on every connection
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest Noise message, tag included
pub const MAX_NOISE_MESSAGE: usize = 65535;

const TAG_SIZE: usize = 16;

/// Largest plaintext that fits into one Noise message
pub const MAX_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_SIZE;

/// Handshake state plus the frames it runs over
pub(crate) struct NoiseHandshake {
    pub(crate) state: HandshakeState,
    pub(crate) frames: FrameSocket,
}

impl NoiseHandshake {
    /// Write the next handshake message carrying `payload`
    pub(crate) async fn send(&mut self, payload: &[u8]) -> TransportResult<()> {
        let mut output = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.write_message(payload, &mut output)?;
        output.truncate(len);
        self.frames.send_frame(&output).await
    }

    /// Read the next handshake message, returning its payload
    pub(crate) async fn receive(&mut self) -> TransportResult<Vec<u8>> {
        let frame = self.frames.receive_frame().await?;
        if frame.len() > MAX_NOISE_MESSAGE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let mut output = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.state.read_message(&frame, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// Remote static key, once the handshake revealed it
    pub(crate) fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().and_then(|key| key.try_into().ok())
    }

    /// Switch to transport mode
    pub(crate) fn finish(self) -> TransportResult<NoiseSocket> {
        let remote_static = self.remote_static();
        let transport = self.state.into_transport_mode()?;
        Ok(NoiseSocket {
            frames: self.frames,
            transport,
            remote_static,
        })
    }
}

/// An established, encrypted connection exchanging nodes
pub struct NoiseSocket {
    frames: FrameSocket,
    transport: TransportState,
    remote_static: Option<[u8; 32]>,
}

impl std::fmt::Debug for NoiseSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSocket")
            .field("transport", &"<TransportState>")
            .field("connected", &self.frames.is_connected())
            .finish()
    }
}

impl NoiseSocket {
    /// Encrypt and send a node
    pub async fn send_node(&mut self, node: &Node) -> TransportResult<()> {
        trace!(target: "tether::transport", "--> {}", node);
        let plaintext = binary::marshal(node);
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(TransportError::FrameTooLarge(plaintext.len()));
        }
        let mut ciphertext = vec![0u8; plaintext.len() + TAG_SIZE];
        let len = self.transport.write_message(&plaintext, &mut ciphertext)?;
        ciphertext.truncate(len);
        self.frames.send_frame(&ciphertext).await
    }

    /// Receive and decrypt the next node
    ///
    /// Cancel-safe as long as the transport's `receive` is: all partial
    /// state lives in the frame reader.
    pub async fn receive_node(&mut self) -> TransportResult<Node> {
        let frame = self.frames.receive_frame().await?;
        if frame.len() > MAX_NOISE_MESSAGE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let mut plaintext = vec![0u8; frame.len()];
        let len = self.transport.read_message(&frame, &mut plaintext)?;
        plaintext.truncate(len);
        let node = binary::unmarshal(&plaintext)?;
        trace!(target: "tether::transport", "<-- {}", node);
        Ok(node)
    }

    /// Static key the peer proved during the handshake
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Whether the underlying transport is up
    pub fn is_connected(&self) -> bool {
        self.frames.is_connected()
    }

    /// Close the connection
    pub async fn close(&mut self) -> TransportResult<()> {
        self.frames.close().await
    }
}
