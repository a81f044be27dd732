//! Connection handshake
//!
//! ```text
//! client                                   service
//!   -> e                         (header + frame 1)
//!   <- e, ee, s, es              ServerHello
//!   -> s, se                     ClientPayload (login | register)
//! ```
//!
//! The client's Noise static key is its device noise key, so the service
//! learns which device is connecting from the handshake itself.

use serde::{Deserialize, Serialize};
use snow::params::NoiseParams;
use snow::Builder;
use tracing::debug;

use super::frame::{FrameSocket, Role};
use super::noise::{NoiseHandshake, NoiseSocket, NOISE_PATTERN};
use super::{Transport, TransportError, TransportResult};
use crate::types::{DeviceBundle, Jid};

/// Sent by the service in the second handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Service identification
    pub server: String,
    /// Service clock, unix seconds
    pub time: u64,
}

/// How the client authenticates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientAuth {
    /// Paired device resuming its session
    Login {
        /// Device JID assigned at pairing
        jid: Jid,
    },
    /// Unpaired device asking for pairing refs
    Register {
        /// Keys contacts need to open sessions
        bundle: DeviceBundle,
    },
}

/// Sent by the client in the third handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPayload {
    /// Client software version
    pub version: String,
    /// Platform label shown on the phone
    pub platform: String,
    /// Display name, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Passive connections do not receive offline messages yet
    #[serde(default)]
    pub passive: bool,
    pub auth: ClientAuth,
}

fn builder<'a>() -> TransportResult<Builder<'a>> {
    let params: NoiseParams = NOISE_PATTERN.parse()?;
    Ok(Builder::new(params))
}

/// Run the initiator side of the handshake
///
/// When `pinned_server_key` is set the service must prove that static key.
pub async fn client_handshake(
    transport: Box<dyn Transport>,
    noise_key: &[u8; 32],
    payload: &ClientPayload,
    pinned_server_key: Option<[u8; 32]>,
) -> TransportResult<(NoiseSocket, ServerHello)> {
    let state = builder()?.local_private_key(noise_key).build_initiator()?;
    let mut handshake = NoiseHandshake {
        state,
        frames: FrameSocket::new(transport, Role::Client),
    };

    handshake.send(&[]).await?;

    let hello_bytes = handshake.receive().await?;
    if let Some(pinned) = pinned_server_key {
        if handshake.remote_static() != Some(pinned) {
            let _ = handshake.frames.close().await;
            return Err(TransportError::ServerKeyMismatch);
        }
    }
    let hello: ServerHello = serde_json::from_slice(&hello_bytes)
        .map_err(|e| TransportError::InvalidData(format!("server hello: {}", e)))?;

    let payload_bytes = serde_json::to_vec(payload)
        .map_err(|e| TransportError::InvalidData(format!("client payload: {}", e)))?;
    handshake.send(&payload_bytes).await?;

    debug!(target: "tether::transport", "handshake complete with {}", hello.server);
    Ok((handshake.finish()?, hello))
}

/// Run the responder side of the handshake
///
/// Returns the socket, the client's payload and the client's static key.
pub async fn server_handshake(
    transport: Box<dyn Transport>,
    static_key: &[u8; 32],
    hello: &ServerHello,
) -> TransportResult<(NoiseSocket, ClientPayload, [u8; 32])> {
    let state = builder()?.local_private_key(static_key).build_responder()?;
    let mut handshake = NoiseHandshake {
        state,
        frames: FrameSocket::new(transport, Role::Server),
    };

    handshake.receive().await?;

    let hello_bytes = serde_json::to_vec(hello)
        .map_err(|e| TransportError::InvalidData(format!("server hello: {}", e)))?;
    handshake.send(&hello_bytes).await?;

    let payload_bytes = handshake.receive().await?;
    let payload: ClientPayload = serde_json::from_slice(&payload_bytes)
        .map_err(|e| TransportError::InvalidData(format!("client payload: {}", e)))?;
    let client_static = handshake
        .remote_static()
        .ok_or_else(|| TransportError::Noise("client static key missing".to_string()))?;

    Ok((handshake.finish()?, payload, client_static))
}
