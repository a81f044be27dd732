//! ChaCha20-Poly1305 for session messages
//!
//! Output layout is `nonce || ciphertext || tag`. The ratchet header is
//! passed as associated data, so it is authenticated but sent in clear.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::error::{CryptoError, CryptoResult};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// AEAD with a random nonce per message
pub struct Cipher;

impl Cipher {
    /// Encrypt `plaintext`, binding `aad`
    pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = super::random_bytes::<NONCE_SIZE>();
        let sealed = ChaCha20Poly1305::new(key.into())
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt the output of [`Cipher::seal`]; `aad` must match
    pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, msg) = sealed.split_at(NONCE_SIZE);
        ChaCha20Poly1305::new(key.into())
            .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
            .map_err(|_| CryptoError::Decrypt)
    }
}
