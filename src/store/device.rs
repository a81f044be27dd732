//! The local device record.

use rand::Rng;
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, ExchangeKeypair, Identity, PublicKey, SignatureBytes};
use crate::types::{DeviceBundle, Jid};

/// Id given to the signed pre-key of a fresh device
pub const SIGNED_PRE_KEY_ID: u32 = 1;

/// A pre-key signed by the device identity
#[derive(Clone)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: ExchangeKeypair,
    pub signature: SignatureBytes,
}

impl PreKey {
    /// Generate a pre-key and sign its public half with `identity`
    pub fn generate(id: u32, identity: &Identity) -> Self {
        let key_pair = ExchangeKeypair::generate();
        let signature = identity.sign(key_pair.public_key().as_bytes());
        PreKey {
            id,
            key_pair,
            signature,
        }
    }
}

/// Account material received when the phone approved this device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountIdentity {
    /// Opaque device details signed by the account
    pub details: Vec<u8>,
    /// Account (phone) identity key
    pub account_signature_key: PublicKey,
    /// Account signature over the details
    pub account_signature: SignatureBytes,
    /// Our counter-signature
    pub device_signature: SignatureBytes,
}

/// Everything the client needs to know about itself.
///
/// A device without an `id` has never been paired and is not stored yet.
#[derive(Clone)]
pub struct Device {
    pub id: Option<Jid>,
    pub registration_id: u32,
    /// Static key for the Noise handshake
    pub noise_key: ExchangeKeypair,
    pub identity: Identity,
    pub signed_pre_key: PreKey,
    /// Secret shared through the pairing code
    pub adv_secret_key: Zeroizing<[u8; 32]>,
    pub account: Option<AccountIdentity>,
    pub push_name: String,
    pub platform: String,
    pub business_name: String,
}

impl Device {
    /// Generate fresh keys for a new, unpaired device
    pub fn generate() -> Self {
        let identity = Identity::generate();
        let signed_pre_key = PreKey::generate(SIGNED_PRE_KEY_ID, &identity);
        Device {
            id: None,
            registration_id: rand::thread_rng().gen_range(1..=16380),
            noise_key: ExchangeKeypair::generate(),
            identity,
            signed_pre_key,
            adv_secret_key: Zeroizing::new(random_bytes::<32>()),
            account: None,
            push_name: String::new(),
            platform: String::new(),
            business_name: String::new(),
        }
    }

    /// Whether pairing has completed
    pub fn is_paired(&self) -> bool {
        self.id.is_some()
    }

    /// Keys a sender needs to open a session with this device
    pub fn bundle(&self) -> DeviceBundle {
        DeviceBundle {
            registration_id: self.registration_id,
            identity: *self.identity.public_key(),
            identity_exchange: self.identity.exchange_public(),
            signed_pre_key_id: self.signed_pre_key.id,
            signed_pre_key: *self.signed_pre_key.key_pair.public_key(),
            signed_pre_key_signature: self.signed_pre_key.signature,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("registration_id", &self.registration_id)
            .field("identity", self.identity.public_key())
            .field("push_name", &self.push_name)
            .field("platform", &self.platform)
            .finish()
    }
}
