//! Ed25519 identities
//!
//! Every device owns a long-term Ed25519 identity. It counter-signs the
//! pairing result and anchors the X3DH agreement of inbound sessions. The
//! account key held by the primary phone is the same type.
//!
//! Keys and signatures travel as hex strings in JSON.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{fixed_bytes, fixed_hex, CryptoError, CryptoResult};
use super::exchange::{ExchangePublicKey, KeyExchange};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Stored form of an identity: secret half, then public half
pub const IDENTITY_BYTES: usize = SECRET_KEY_SIZE + PUBLIC_KEY_SIZE;

/// Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        fixed_bytes("public key", bytes).map(PublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Check `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        key.verify(message, &Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(text: String) -> CryptoResult<Self> {
        fixed_hex("public key", &text).map(PublicKey)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> String {
        hex::encode(key.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl SignatureBytes {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        fixed_bytes("signature", bytes).map(SignatureBytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl TryFrom<String> for SignatureBytes {
    type Error = CryptoError;

    fn try_from(text: String) -> CryptoResult<Self> {
        fixed_hex("signature", &text).map(SignatureBytes)
    }
}

impl From<SignatureBytes> for String {
    fn from(signature: SignatureBytes) -> String {
        hex::encode(signature.0)
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// An Ed25519 key pair; the secret is zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; SECRET_KEY_SIZE],
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        Identity {
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_key: signing_key.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Raw secret, for X3DH
    ///
    /// Never log this. The store keeps it in the device row.
    pub fn secret_key_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret_key
    }

    /// X25519 public key for the identity half of X3DH
    pub fn exchange_public(&self) -> ExchangePublicKey {
        KeyExchange::identity_to_exchange(&self.secret_key)
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        SignatureBytes(signing_key.sign(message).to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        self.public_key.verify(message, signature)
    }

    /// Stored form: secret || public
    pub fn to_bytes(&self) -> [u8; IDENTITY_BYTES] {
        let mut bytes = [0u8; IDENTITY_BYTES];
        bytes[..SECRET_KEY_SIZE].copy_from_slice(&self.secret_key);
        bytes[SECRET_KEY_SIZE..].copy_from_slice(&self.public_key.0);
        bytes
    }

    /// Load the stored form, checking that both halves belong together
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let mut stored: [u8; IDENTITY_BYTES] = fixed_bytes("identity", bytes)?;
        let mut secret = [0u8; SECRET_KEY_SIZE];
        secret.copy_from_slice(&stored[..SECRET_KEY_SIZE]);
        let identity = Self::from_signing_key(&SigningKey::from_bytes(&secret));
        let matches = identity.public_key.0[..] == stored[SECRET_KEY_SIZE..];
        secret.zeroize();
        stored.zeroize();

        if matches {
            Ok(identity)
        } else {
            Err(CryptoError::KeyPairMismatch)
        }
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity {
            public_key: self.public_key,
            secret_key: self.secret_key,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_distinct() {
        assert_ne!(Identity::generate().public_key(), Identity::generate().public_key());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let details = b"device details";

        let signature = id.sign(details);
        assert!(id.verify(details, &signature).is_ok());
        assert_eq!(
            id.verify(b"other details", &signature),
            Err(CryptoError::BadSignature)
        );
        assert_eq!(
            Identity::generate().verify(details, &signature),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn test_stored_form_round_trip() {
        let id = Identity::generate();
        let signature = id.sign(b"persisted");

        let restored = Identity::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id.public_key(), restored.public_key());
        assert_eq!(id.exchange_public(), restored.exchange_public());
        assert!(restored.verify(b"persisted", &signature).is_ok());
    }

    #[test]
    fn test_stored_form_rejects_bad_input() {
        let mut bytes = Identity::generate().to_bytes();
        bytes[SECRET_KEY_SIZE] ^= 0x01;
        assert_eq!(
            Identity::from_bytes(&bytes).unwrap_err(),
            CryptoError::KeyPairMismatch
        );
        assert!(matches!(
            Identity::from_bytes(&bytes[..40]),
            Err(CryptoError::InvalidLength { expected: IDENTITY_BYTES, actual: 40, .. })
        ));
    }

    #[test]
    fn test_keys_serialize_as_hex() {
        let id = Identity::generate();
        let json = serde_json::to_string(id.public_key()).unwrap();
        assert_eq!(json, format!("\"{}\"", id.public_key()));
        let restored: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&restored, id.public_key());

        let signature = id.sign(b"x");
        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(serde_json::from_str::<SignatureBytes>(&json).unwrap(), signature);

        assert!(serde_json::from_str::<PublicKey>("\"zz\"").is_err());
        assert!(serde_json::from_str::<PublicKey>("\"abcd\"").is_err());
    }
}
