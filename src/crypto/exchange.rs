//! X25519 Key Exchange
//!
//! Elliptic Curve Diffie-Hellman for the X3DH agreement that opens an
//! inbound message session.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{fixed_bytes, fixed_hex, CryptoError, CryptoResult};
use super::hash::Hash;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Domain separation label for the combined X3DH output
const X3DH_CONTEXT: &[u8] = b"tether-x3dh-v1";

/// X25519 public key; hex in JSON
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExchangePublicKey(pub [u8; 32]);

impl ExchangePublicKey {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        fixed_bytes("exchange key", bytes).map(ExchangePublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<String> for ExchangePublicKey {
    type Error = CryptoError;

    fn try_from(text: String) -> CryptoResult<Self> {
        fixed_hex("exchange key", &text).map(ExchangePublicKey)
    }
}

impl From<ExchangePublicKey> for String {
    fn from(key: ExchangePublicKey) -> String {
        hex::encode(key.0)
    }
}

impl fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangePublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

/// 32-byte agreement output, zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

/// X25519 key pair
///
/// Serves as a one-shot base key, the device's signed pre-key and the
/// Noise static key; the latter two are rebuilt from stored secrets.
#[derive(ZeroizeOnDrop)]
pub struct ExchangeKeypair {
    #[zeroize(skip)]
    public_key: ExchangePublicKey,
    secret_key: [u8; 32],
}

impl ExchangeKeypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn from_secret(secret_key: [u8; 32]) -> Self {
        ExchangeKeypair {
            public_key: public_for(&secret_key),
            secret_key,
        }
    }

    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public_key
    }

    /// Secret half, for persistence
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn diffie_hellman(&self, peer: &ExchangePublicKey) -> SharedSecret {
        SharedSecret(dh(&self.secret_key, peer))
    }
}

impl Clone for ExchangeKeypair {
    fn clone(&self) -> Self {
        Self::from_secret(self.secret_key)
    }
}

fn public_for(secret: &[u8; 32]) -> ExchangePublicKey {
    ExchangePublicKey(X25519Public::from(&StaticSecret::from(*secret)).to_bytes())
}

fn dh(secret: &[u8; 32], peer: &ExchangePublicKey) -> [u8; 32] {
    StaticSecret::from(*secret)
        .diffie_hellman(&X25519Public::from(peer.0))
        .to_bytes()
}

/// Which end of an X3DH agreement we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X3dhRole {
    /// Holds a fresh base key and the peer's bundle
    Sender,
    /// Holds the signed pre-key the sender used
    Receiver,
}

/// Key agreement entry points
pub struct KeyExchange;

impl KeyExchange {
    /// Fresh one-shot key pair
    pub fn generate_ephemeral() -> ExchangeKeypair {
        ExchangeKeypair::generate()
    }

    /// X25519 public key for an Ed25519 identity secret
    ///
    /// The Ed25519 seed doubles as the X25519 scalar, so one stored secret
    /// serves signing and agreement.
    pub fn identity_to_exchange(identity_secret: &[u8; 32]) -> ExchangePublicKey {
        public_for(identity_secret)
    }

    /// Three-way agreement between identities and one-shot keys
    ///
    /// `our_key` is the base key for the sender and the signed pre-key for
    /// the receiver; `their_key` is the other one. Both sides hash
    /// `DH(sender identity, pre-key) || DH(base key, receiver identity) ||
    /// DH(base key, pre-key)`.
    pub fn x3dh(
        role: X3dhRole,
        our_identity: &[u8; 32],
        our_key: &ExchangeKeypair,
        their_identity: &ExchangePublicKey,
        their_key: &ExchangePublicKey,
    ) -> SharedSecret {
        let identity_to_key = dh(our_identity, their_key);
        let key_to_identity = dh(&our_key.secret_key, their_identity);
        let (first, second) = match role {
            X3dhRole::Sender => (identity_to_key, key_to_identity),
            X3dhRole::Receiver => (key_to_identity, identity_to_key),
        };

        let mut combined = [0u8; 96];
        combined[..32].copy_from_slice(&first);
        combined[32..64].copy_from_slice(&second);
        combined[64..].copy_from_slice(&dh(&our_key.secret_key, their_key));
        let secret = SharedSecret(Hash::derive_key_from_slice(&combined, X3DH_CONTEXT));
        combined.zeroize();
        secret
    }
}
