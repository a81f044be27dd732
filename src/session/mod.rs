//! Per-peer message sessions
//!
//! A sender opens a session with a `pkmsg`: an X3DH agreement between its
//! identity and base key and our identity and signed pre-key, wrapping the
//! first ratchet message. Later messages (`msg`) carry only ratchet output.

mod cipher;
mod ratchet;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, ExchangePublicKey};
use crate::store::StoreError;
use crate::types::Jid;

pub use cipher::{OutboundSession, SessionCipher};
pub use ratchet::{MessageHeader, Ratchet, MAX_SKIP};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A `msg` arrived without an established session
    #[error("No session with {0}")]
    NoSession(Jid),

    /// Sender's identity differs from the one recorded earlier
    #[error("Untrusted identity for {0}")]
    UntrustedIdentity(Jid),

    /// Message names a pre-key we do not have
    #[error("Unknown signed pre-key {0}")]
    UnknownPreKey(u32),

    /// Message belongs to a different sending chain
    #[error("Message from an unknown chain")]
    UnknownChain,

    /// Message key already used
    #[error("Duplicate message {0}")]
    DuplicateMessage(u64),

    /// Message is too far ahead of the chain
    #[error("Too many skipped messages: {0}")]
    TooManySkipped(u64),

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Payload could not be parsed
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Session state could not be loaded or saved
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// The `type` attribute of an `enc` node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    /// Session-establishing message
    PreKey,
    /// Message within an established session
    Message,
}

impl EncType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EncType::PreKey => "pkmsg",
            EncType::Message => "msg",
        }
    }
}

impl fmt::Display for EncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pkmsg" => Ok(EncType::PreKey),
            "msg" => Ok(EncType::Message),
            other => Err(SessionError::Malformed(format!("unknown enc type {:?}", other))),
        }
    }
}

/// Session-establishing envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// Registration id of the receiving device
    pub registration_id: u32,
    /// Which signed pre-key the sender used
    pub signed_pre_key_id: u32,
    /// Sender's X25519 identity key
    pub identity: ExchangePublicKey,
    /// Sender's one-shot base key
    pub base_key: ExchangePublicKey,
    /// First ratchet message
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
}

impl PreKeyMessage {
    /// Serialize for the wire
    pub fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SessionError::Malformed(e.to_string()))
    }

    /// Parse from the wire
    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Malformed(e.to_string()))
    }
}

/// Serde helper storing 32-byte keys as hex strings
pub(crate) mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
