//! Session establishment and message decryption against the store.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EncType, PreKeyMessage, Ratchet, SessionError, SessionResult};
use crate::crypto::{ExchangePublicKey, Identity, KeyExchange, X3dhRole};
use crate::store::{Container, Device, StoreError};
use crate::types::{DeviceBundle, Jid};

/// What the store keeps per peer
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    /// Base key of the `pkmsg` that opened the session
    base_key: ExchangePublicKey,
    ratchet: Ratchet,
}

/// Decrypts inbound messages for one paired device
pub struct SessionCipher<'a> {
    store: &'a Container,
    device: &'a Device,
    our: &'a Jid,
}

impl<'a> SessionCipher<'a> {
    /// Cipher for a paired device
    pub fn new(store: &'a Container, device: &'a Device) -> SessionResult<Self> {
        let our = device.id.as_ref().ok_or(StoreError::DeviceNotPaired)?;
        Ok(SessionCipher { store, device, our })
    }

    /// Decrypt a payload from `sender`
    ///
    /// Session state is written back only when decryption succeeded.
    pub fn decrypt(&self, sender: &Jid, enc_type: EncType, payload: &[u8]) -> SessionResult<Vec<u8>> {
        match enc_type {
            EncType::PreKey => self.decrypt_prekey(sender, payload),
            EncType::Message => self.decrypt_message(sender, payload),
        }
    }

    fn decrypt_prekey(&self, sender: &Jid, payload: &[u8]) -> SessionResult<Vec<u8>> {
        let message = PreKeyMessage::from_bytes(payload)?;

        if message.signed_pre_key_id != self.device.signed_pre_key.id {
            return Err(SessionError::UnknownPreKey(message.signed_pre_key_id));
        }
        if message.registration_id != self.device.registration_id {
            return Err(SessionError::Malformed(format!(
                "addressed to registration id {}",
                message.registration_id
            )));
        }
        if !self
            .store
            .is_trusted_identity(self.our, sender, &message.identity.0)?
        {
            return Err(SessionError::UntrustedIdentity(sender.clone()));
        }

        // A sender may wrap several messages in the same pkmsg envelope
        let existing: Option<SessionRecord> = self.store.get_session(self.our, sender)?;
        let mut record = match existing {
            Some(record) if record.base_key == message.base_key => record,
            _ => {
                let secret = KeyExchange::x3dh(
                    X3dhRole::Receiver,
                    self.device.identity.secret_key_bytes(),
                    &self.device.signed_pre_key.key_pair,
                    &message.identity,
                    &message.base_key,
                );
                debug!(target: "tether::session", "new session with {}", sender);
                SessionRecord {
                    base_key: message.base_key,
                    ratchet: Ratchet::initialize_receiver(secret.as_bytes()),
                }
            }
        };

        let plaintext = record.ratchet.decrypt(&message.message)?;
        self.store.put_identity(self.our, sender, &message.identity.0)?;
        self.store.put_session(self.our, sender, &record)?;
        Ok(plaintext)
    }

    fn decrypt_message(&self, sender: &Jid, payload: &[u8]) -> SessionResult<Vec<u8>> {
        let mut record: SessionRecord = self
            .store
            .get_session(self.our, sender)?
            .ok_or_else(|| SessionError::NoSession(sender.clone()))?;

        let plaintext = record.ratchet.decrypt(payload)?;
        self.store.put_session(self.our, sender, &record)?;
        Ok(plaintext)
    }
}

/// Header fields of the envelope that opens a session
#[derive(Clone, Debug)]
struct PendingPreKey {
    registration_id: u32,
    signed_pre_key_id: u32,
    identity: ExchangePublicKey,
    base_key: ExchangePublicKey,
}

/// Sending half of a session, used by whoever writes to a device
pub struct OutboundSession {
    ratchet: Ratchet,
    pending: Option<PendingPreKey>,
}

impl OutboundSession {
    /// Run X3DH against a device bundle
    pub fn start(identity: &Identity, bundle: &DeviceBundle) -> SessionResult<Self> {
        bundle.verify()?;

        let base_key = KeyExchange::generate_ephemeral();
        let secret = KeyExchange::x3dh(
            X3dhRole::Sender,
            identity.secret_key_bytes(),
            &base_key,
            &bundle.identity_exchange,
            &bundle.signed_pre_key,
        );

        Ok(OutboundSession {
            ratchet: Ratchet::initialize_sender(secret.as_bytes()),
            pending: Some(PendingPreKey {
                registration_id: bundle.registration_id,
                signed_pre_key_id: bundle.signed_pre_key_id,
                identity: identity.exchange_public(),
                base_key: *base_key.public_key(),
            }),
        })
    }

    /// Encrypt the next message; the first one is wrapped in a `pkmsg`
    pub fn encrypt(&mut self, plaintext: &[u8]) -> SessionResult<(EncType, Vec<u8>)> {
        let message = self.ratchet.encrypt(plaintext)?;
        match self.pending.take() {
            Some(pending) => {
                let envelope = PreKeyMessage {
                    registration_id: pending.registration_id,
                    signed_pre_key_id: pending.signed_pre_key_id,
                    identity: pending.identity,
                    base_key: pending.base_key,
                    message,
                };
                Ok((EncType::PreKey, envelope.to_bytes()?))
            }
            None => Ok((EncType::Message, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_USER_SERVER;

    fn setup(container: &Container) -> Device {
        let mut device = Device::generate();
        device.id = Some(Jid::new_ad("15550001", 1, DEFAULT_USER_SERVER));
        container.save_device(&device).unwrap();
        device
    }

    fn sender() -> Jid {
        Jid::new("15550002", DEFAULT_USER_SERVER)
    }

    #[test]
    fn test_prekey_then_message() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();

        let contact = Identity::generate();
        let mut outbound = OutboundSession::start(&contact, &device.bundle()).unwrap();

        let (kind, first) = outbound.encrypt(b"hello").unwrap();
        assert_eq!(kind, EncType::PreKey);
        assert_eq!(cipher.decrypt(&sender(), kind, &first).unwrap(), b"hello");

        let (kind, second) = outbound.encrypt(b"again").unwrap();
        assert_eq!(kind, EncType::Message);
        assert_eq!(cipher.decrypt(&sender(), kind, &second).unwrap(), b"again");

        // Replaying either message fails
        assert!(cipher.decrypt(&sender(), EncType::Message, &second).is_err());
        assert!(matches!(
            cipher.decrypt(&sender(), EncType::PreKey, &first),
            Err(SessionError::DuplicateMessage(0))
        ));
    }

    #[test]
    fn test_out_of_order_messages() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();
        let mut outbound = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();

        let (_, first) = outbound.encrypt(b"one").unwrap();
        let (_, second) = outbound.encrypt(b"two").unwrap();
        let (_, third) = outbound.encrypt(b"three").unwrap();

        cipher.decrypt(&sender(), EncType::PreKey, &first).unwrap();
        assert_eq!(cipher.decrypt(&sender(), EncType::Message, &third).unwrap(), b"three");
        assert_eq!(cipher.decrypt(&sender(), EncType::Message, &second).unwrap(), b"two");
    }

    #[test]
    fn test_message_without_session() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();
        let mut outbound = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();

        let _ = outbound.encrypt(b"lost").unwrap();
        let (_, second) = outbound.encrypt(b"orphan").unwrap();
        assert!(matches!(
            cipher.decrypt(&sender(), EncType::Message, &second),
            Err(SessionError::NoSession(_))
        ));
    }

    #[test]
    fn test_changed_identity_rejected() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();

        let mut first = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();
        let (kind, data) = first.encrypt(b"hi").unwrap();
        cipher.decrypt(&sender(), kind, &data).unwrap();

        let mut impostor = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();
        let (kind, data) = impostor.encrypt(b"trust me").unwrap();
        assert!(matches!(
            cipher.decrypt(&sender(), kind, &data),
            Err(SessionError::UntrustedIdentity(_))
        ));
    }

    #[test]
    fn test_unknown_pre_key() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();

        let mut bundle = device.bundle();
        bundle.signed_pre_key_id = 99;
        let mut outbound = OutboundSession::start(&Identity::generate(), &bundle).unwrap();
        let (kind, data) = outbound.encrypt(b"hi").unwrap();
        assert!(matches!(
            cipher.decrypt(&sender(), kind, &data),
            Err(SessionError::UnknownPreKey(99))
        ));
    }

    #[test]
    fn test_forged_bundle_refused() {
        let device = Device::generate();
        let mut bundle = device.bundle();
        bundle.signed_pre_key = ExchangePublicKey([7; 32]);
        assert!(matches!(
            OutboundSession::start(&Identity::generate(), &bundle),
            Err(SessionError::Crypto(_))
        ));
    }

    #[test]
    fn test_failed_decrypt_leaves_session_untouched() {
        let container = Container::open_in_memory().unwrap();
        let device = setup(&container);
        let cipher = SessionCipher::new(&container, &device).unwrap();
        let mut outbound = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();

        let (kind, data) = outbound.encrypt(b"hi").unwrap();
        cipher.decrypt(&sender(), kind, &data).unwrap();

        let (_, mut next) = outbound.encrypt(b"next").unwrap();
        let last = next.len() - 1;
        next[last] ^= 0xFF;
        assert!(cipher.decrypt(&sender(), EncType::Message, &next).is_err());

        next[last] ^= 0xFF;
        assert_eq!(cipher.decrypt(&sender(), EncType::Message, &next).unwrap(), b"next");
    }

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.db");
        let mut outbound;
        let device;
        {
            let container = Container::open(&path).unwrap();
            device = setup(&container);
            outbound = OutboundSession::start(&Identity::generate(), &device.bundle()).unwrap();
            let (kind, data) = outbound.encrypt(b"before").unwrap();
            SessionCipher::new(&container, &device)
                .unwrap()
                .decrypt(&sender(), kind, &data)
                .unwrap();
        }

        let container = Container::open(&path).unwrap();
        let device = container.get_device(device.id.as_ref().unwrap()).unwrap().unwrap();
        let cipher = SessionCipher::new(&container, &device).unwrap();
        let (kind, data) = outbound.encrypt(b"after").unwrap();
        assert_eq!(cipher.decrypt(&sender(), kind, &data).unwrap(), b"after");
    }

    #[test]
    fn test_unpaired_device_has_no_cipher() {
        let container = Container::open_in_memory().unwrap();
        let device = Device::generate();
        assert!(matches!(
            SessionCipher::new(&container, &device),
            Err(SessionError::Store(StoreError::DeviceNotPaired))
        ));
    }
}
