//! Errors from the crypto primitives

use thiserror::Error;

/// Errors from key parsing, signing and encryption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or signature had the wrong size
    #[error("{kind} must be {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Text form was not valid hex
    #[error("{0} is not valid hex")]
    InvalidHex(&'static str),

    /// Signature does not match the message and key
    #[error("Signature verification failed")]
    BadSignature,

    /// Bytes are not a point on the curve
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// A stored identity's public half does not belong to its secret
    #[error("Identity key pair mismatch")]
    KeyPairMismatch,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Wrong key, tampered ciphertext or wrong associated data
    #[error("Decryption failed")]
    Decrypt,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Copy `bytes` into an array of exactly `N` bytes
pub(crate) fn fixed_bytes<const N: usize>(kind: &'static str, bytes: &[u8]) -> CryptoResult<[u8; N]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidLength {
        kind,
        expected: N,
        actual: bytes.len(),
    })
}

/// Decode hex text into an array of exactly `N` bytes
pub(crate) fn fixed_hex<const N: usize>(kind: &'static str, text: &str) -> CryptoResult<[u8; N]> {
    let bytes = hex::decode(text).map_err(|_| CryptoError::InvalidHex(kind))?;
    fixed_bytes(kind, &bytes)
}
