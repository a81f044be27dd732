//! Cryptographic primitives
//!
//! - `identity`: Ed25519 keys that sign pairing details and bundles
//! - `exchange`: X25519 key pairs and the X3DH agreement for `pkmsg`
//! - `cipher`: ChaCha20-Poly1305 with the ratchet header as AAD
//! - `hash`: BLAKE3 MACs for the pairing container and key derivation

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod identity;

pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{ExchangeKeypair, ExchangePublicKey, KeyExchange, SharedSecret, X3dhRole};
pub use hash::Hash;
pub use identity::{Identity, PublicKey, SignatureBytes};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_x3dh_and_encryption() {
        let sender = Identity::generate();
        let base_key = KeyExchange::generate_ephemeral();

        let device = Identity::generate();
        let signed_pre_key = KeyExchange::generate_ephemeral();

        let sender_shared = KeyExchange::x3dh(
            X3dhRole::Sender,
            sender.secret_key_bytes(),
            &base_key,
            &device.exchange_public(),
            signed_pre_key.public_key(),
        );

        let device_shared = KeyExchange::x3dh(
            X3dhRole::Receiver,
            device.secret_key_bytes(),
            &signed_pre_key,
            &sender.exchange_public(),
            base_key.public_key(),
        );

        let sender_key = Hash::derive_key(sender_shared.as_bytes(), b"message-encryption");
        let device_key = Hash::derive_key(device_shared.as_bytes(), b"message-encryption");
        assert_eq!(sender_key, device_key);

        let ciphertext = Cipher::seal(&sender_key, b"first message", b"hdr").unwrap();
        let decrypted = Cipher::open(&device_key, &ciphertext, b"hdr").unwrap();
        assert_eq!(b"first message", decrypted.as_slice());
    }

    #[test]
    fn test_random_bytes_unique() {
        assert_ne!(random_bytes::<32>(), random_bytes::<32>());
    }
}
