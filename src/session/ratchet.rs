//! Symmetric chain ratchet
//!
//! Each direction has its own chain derived from the session root. Every
//! message uses a unique key derived from the chain key, and the chain
//! advances after each message, so a leaked chain key does not expose
//! earlier messages.
//!
//! The receiving side adopts the sender's chain id from the first header
//! it accepts; headers naming any other chain are rejected.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{hex_key, SessionError, SessionResult};
use crate::crypto::{Cipher, ExchangePublicKey, Hash, KeyExchange};

/// Size of chain keys
const KEY_SIZE: usize = 32;

/// Encoded header length
const HEADER_SIZE: usize = 40;

/// Most message keys kept for (or skipped over towards) late messages
pub const MAX_SKIP: u64 = 1000;

const ROOT_CONTEXT: &[u8] = b"tether-root-v1";
const INITIATOR_CHAIN: &[u8] = b"initiator-sending-chain";
const RESPONDER_CHAIN: &[u8] = b"responder-sending-chain";
const CHAIN_ADVANCE: &[u8] = b"chain-advance";

/// Message header included with each encrypted message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Identifies the sender's chain
    pub chain: ExchangePublicKey,
    /// Message number in that chain
    pub counter: u64,
}

impl MessageHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..32].copy_from_slice(&self.chain.0);
        bytes[32..].copy_from_slice(&self.counter.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(SessionError::Malformed(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let mut chain = [0u8; 32];
        chain.copy_from_slice(&bytes[..32]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&bytes[32..]);

        Ok(MessageHeader {
            chain: ExchangePublicKey(chain),
            counter: u64::from_le_bytes(counter),
        })
    }
}

/// A message key kept for a message that has not arrived yet
#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct SkippedKey {
    counter: u64,
    #[serde(with = "hex_key")]
    key: [u8; KEY_SIZE],
}

/// Ratchet state for one peer
///
/// Serializable so the store can keep it between runs.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Ratchet {
    #[serde(with = "hex_key")]
    sending_chain_key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    sending_chain: ExchangePublicKey,
    #[zeroize(skip)]
    send_counter: u64,

    #[serde(with = "hex_key")]
    receiving_chain_key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    receiving_chain: Option<ExchangePublicKey>,
    #[zeroize(skip)]
    recv_counter: u64,

    /// Keys for messages skipped in the receiving chain, oldest first
    skipped_keys: Vec<SkippedKey>,
}

impl Ratchet {
    /// Initialize ratchet as sender (initiator)
    pub fn initialize_sender(shared_secret: &[u8; 32]) -> Self {
        let root_key = Hash::derive_key(shared_secret, ROOT_CONTEXT);
        Self::new(
            Hash::derive_key(&root_key, INITIATOR_CHAIN),
            Hash::derive_key(&root_key, RESPONDER_CHAIN),
        )
    }

    /// Initialize ratchet as receiver (responder)
    pub fn initialize_receiver(shared_secret: &[u8; 32]) -> Self {
        let root_key = Hash::derive_key(shared_secret, ROOT_CONTEXT);
        // Receiver's chains are swapped relative to the sender
        Self::new(
            Hash::derive_key(&root_key, RESPONDER_CHAIN),
            Hash::derive_key(&root_key, INITIATOR_CHAIN),
        )
    }

    fn new(sending_chain_key: [u8; KEY_SIZE], receiving_chain_key: [u8; KEY_SIZE]) -> Self {
        Ratchet {
            sending_chain_key,
            sending_chain: *KeyExchange::generate_ephemeral().public_key(),
            send_counter: 0,
            receiving_chain_key,
            receiving_chain: None,
            recv_counter: 0,
            skipped_keys: Vec::new(),
        }
    }

    /// Encrypt a message
    ///
    /// Output: header(40) || nonce || ciphertext || tag
    pub fn encrypt(&mut self, plaintext: &[u8]) -> SessionResult<Vec<u8>> {
        let message_key = derive_message_key(&self.sending_chain_key, self.send_counter);
        let header = MessageHeader {
            chain: self.sending_chain,
            counter: self.send_counter,
        };
        let header_bytes = header.to_bytes();

        let ciphertext = Cipher::seal(&message_key, plaintext, &header_bytes)?;

        // Advance the sending chain (forward secrecy)
        self.sending_chain_key = Hash::derive_key(&self.sending_chain_key, CHAIN_ADVANCE);
        self.send_counter += 1;

        let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        result.extend_from_slice(&header_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt a message
    ///
    /// The state only changes when decryption succeeds.
    pub fn decrypt(&mut self, data: &[u8]) -> SessionResult<Vec<u8>> {
        let (header, header_bytes, ciphertext) = split_message(data)?;

        if let Some(chain) = &self.receiving_chain {
            if *chain != header.chain {
                return Err(SessionError::UnknownChain);
            }
        }

        if header.counter < self.recv_counter {
            return self.decrypt_skipped(&header, header_bytes, ciphertext);
        }

        let gap = header.counter - self.recv_counter;
        if gap > MAX_SKIP {
            return Err(SessionError::TooManySkipped(gap));
        }

        // Walk a copy of the chain up to the message
        let mut chain_key = self.receiving_chain_key;
        let mut skipped = Vec::with_capacity(gap as usize);
        for counter in self.recv_counter..header.counter {
            skipped.push(SkippedKey {
                counter,
                key: derive_message_key(&chain_key, counter),
            });
            chain_key = Hash::derive_key(&chain_key, CHAIN_ADVANCE);
        }
        let message_key = derive_message_key(&chain_key, header.counter);
        let plaintext = Cipher::open(&message_key, ciphertext, header_bytes)?;

        self.receiving_chain = Some(header.chain);
        self.receiving_chain_key = Hash::derive_key(&chain_key, CHAIN_ADVANCE);
        self.recv_counter = header.counter + 1;
        self.skipped_keys.extend(skipped);
        let excess = self.skipped_keys.len().saturating_sub(MAX_SKIP as usize);
        self.skipped_keys.drain(..excess);

        Ok(plaintext)
    }

    fn decrypt_skipped(
        &mut self,
        header: &MessageHeader,
        header_bytes: &[u8],
        ciphertext: &[u8],
    ) -> SessionResult<Vec<u8>> {
        let index = self
            .skipped_keys
            .iter()
            .position(|skipped| skipped.counter == header.counter)
            .ok_or(SessionError::DuplicateMessage(header.counter))?;

        let plaintext =
            Cipher::open(&self.skipped_keys[index].key, ciphertext, header_bytes)?;
        self.skipped_keys.remove(index);
        Ok(plaintext)
    }

    /// Our sending chain id
    pub fn sending_chain(&self) -> &ExchangePublicKey {
        &self.sending_chain
    }

    /// Number of keys held for late messages
    pub fn skipped_len(&self) -> usize {
        self.skipped_keys.len()
    }
}

/// Derive a message key from chain key and counter
fn derive_message_key(chain_key: &[u8; KEY_SIZE], counter: u64) -> [u8; KEY_SIZE] {
    let context = format!("message-key-{}", counter);
    Hash::derive_key(chain_key, context.as_bytes())
}

fn split_message(data: &[u8]) -> SessionResult<(MessageHeader, &[u8], &[u8])> {
    if data.len() < HEADER_SIZE {
        return Err(SessionError::Malformed("truncated message".to_string()));
    }
    let (header_bytes, ciphertext) = data.split_at(HEADER_SIZE);
    let header = MessageHeader::from_bytes(header_bytes)?;
    Ok((header, header_bytes, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn pair() -> (Ratchet, Ratchet) {
        let shared_secret = random_bytes::<32>();
        (
            Ratchet::initialize_sender(&shared_secret),
            Ratchet::initialize_receiver(&shared_secret),
        )
    }

    #[test]
    fn test_basic_ratchet() {
        let (mut alice, mut bob) = pair();

        let ciphertext = alice.encrypt(b"Hello, Bob!").unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"Hello, Bob!");
    }

    #[test]
    fn test_multiple_messages() {
        let (mut alice, mut bob) = pair();

        for i in 0..10 {
            let msg = format!("Message {}", i);
            let ct = alice.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&ct).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn test_bidirectional() {
        let (mut alice, mut bob) = pair();

        let ct1 = alice.encrypt(b"Hi Bob").unwrap();
        assert_eq!(bob.decrypt(&ct1).unwrap(), b"Hi Bob");

        let ct2 = bob.encrypt(b"Hi Alice").unwrap();
        assert_eq!(alice.decrypt(&ct2).unwrap(), b"Hi Alice");
    }

    #[test]
    fn test_out_of_order() {
        let (mut alice, mut bob) = pair();

        let ct0 = alice.encrypt(b"zero").unwrap();
        let ct1 = alice.encrypt(b"one").unwrap();
        let ct2 = alice.encrypt(b"two").unwrap();

        assert_eq!(bob.decrypt(&ct2).unwrap(), b"two");
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(bob.decrypt(&ct0).unwrap(), b"zero");
        assert_eq!(bob.decrypt(&ct1).unwrap(), b"one");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = pair();

        let ct = alice.encrypt(b"once").unwrap();
        bob.decrypt(&ct).unwrap();
        assert!(matches!(bob.decrypt(&ct), Err(SessionError::DuplicateMessage(0))));
    }

    #[test]
    fn test_skip_limit() {
        let (mut alice, mut bob) = pair();

        let mut last = Vec::new();
        for _ in 0..=(MAX_SKIP + 1) {
            last = alice.encrypt(b"x").unwrap();
        }
        assert!(matches!(bob.decrypt(&last), Err(SessionError::TooManySkipped(_))));
    }

    #[test]
    fn test_foreign_chain_rejected() {
        let shared_secret = random_bytes::<32>();
        let mut alice = Ratchet::initialize_sender(&shared_secret);
        let mut mallory = Ratchet::initialize_sender(&shared_secret);
        let mut bob = Ratchet::initialize_receiver(&shared_secret);

        bob.decrypt(&alice.encrypt(b"first").unwrap()).unwrap();
        let ct = mallory.encrypt(b"other").unwrap();
        assert!(matches!(bob.decrypt(&ct), Err(SessionError::UnknownChain)));
    }

    #[test]
    fn test_wrong_key_fails_without_state_change() {
        let mut alice = Ratchet::initialize_sender(&random_bytes::<32>());
        let mut bob = Ratchet::initialize_receiver(&random_bytes::<32>());

        let ct = alice.encrypt(b"Secret").unwrap();
        assert!(bob.decrypt(&ct).is_err());
        assert_eq!(bob.skipped_len(), 0);
        assert!(bob.receiving_chain.is_none());
    }

    #[test]
    fn test_tampered_message_fails() {
        let (mut alice, mut bob) = pair();

        let mut ct = alice.encrypt(b"Secret").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(bob.decrypt(&ct).is_err());

        // A tampered header is caught by the AAD
        let mut ct = alice.encrypt(b"Secret").unwrap();
        ct[0] ^= 0x01;
        assert!(bob.decrypt(&ct).is_err());
    }

    #[test]
    fn test_truncated_message() {
        let (_, mut bob) = pair();
        assert!(matches!(bob.decrypt(&[1, 2]), Err(SessionError::Malformed(_))));
        assert!(matches!(
            bob.decrypt(&[0u8; HEADER_SIZE - 1]),
            Err(SessionError::Malformed(_))
        ));
    }

    #[test]
    fn test_message_layout() {
        let (mut alice, _) = pair();
        let ct = alice.encrypt(b"hello").unwrap();
        // header, nonce, plaintext, tag
        assert_eq!(ct.len(), HEADER_SIZE + 12 + 5 + 16);

        let header = MessageHeader::from_bytes(&ct[..HEADER_SIZE]).unwrap();
        assert_eq!(header.chain, *alice.sending_chain());
        assert_eq!(header.counter, 0);
    }

    #[test]
    fn test_state_survives_serialization() {
        let (mut alice, mut bob) = pair();

        let early = alice.encrypt(b"late arrival").unwrap();
        bob.decrypt(&alice.encrypt(b"first").unwrap()).unwrap();

        let json = serde_json::to_string(&bob).unwrap();
        let mut restored: Ratchet = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.decrypt(&early).unwrap(), b"late arrival");
        let ct = alice.encrypt(b"after restore").unwrap();
        assert_eq!(restored.decrypt(&ct).unwrap(), b"after restore");
    }

    #[test]
    fn test_header_serialization() {
        let header = MessageHeader {
            chain: ExchangePublicKey([42u8; 32]),
            counter: 12345,
        };

        let restored = MessageHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(header, restored);
        assert!(MessageHeader::from_bytes(&[0u8; 39]).is_err());
    }
}
