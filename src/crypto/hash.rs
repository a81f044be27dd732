//! BLAKE3 MACs and key derivation
//!
//! The pairing container is authenticated with a keyed hash under the
//! device's adv secret. Session chains derive every key with
//! `derive_key` and a context label.

/// Keyed hashing and key derivation
pub struct Hash;

impl Hash {
    /// Keyed MAC of `data`
    pub fn mac(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
        blake3::keyed_hash(key, data).into()
    }

    /// Check a MAC; comparison is constant time
    pub fn verify_mac(key: &[u8; 32], data: &[u8], expected: &[u8]) -> bool {
        match <[u8; 32]>::try_from(expected) {
            // blake3::Hash equality does not short-circuit
            Ok(expected) => blake3::keyed_hash(key, data) == blake3::Hash::from(expected),
            Err(_) => false,
        }
    }

    /// Key for one purpose, named by `context`, from a 32-byte master
    pub fn derive_key(master: &[u8; 32], context: &[u8]) -> [u8; 32] {
        blake3::derive_key(&String::from_utf8_lossy(context), master)
    }

    /// Like [`Hash::derive_key`] for input of any length
    pub fn derive_key_from_slice(input: &[u8], context: &[u8]) -> [u8; 32] {
        Self::derive_key(blake3::hash(input).as_bytes(), context)
    }
}
