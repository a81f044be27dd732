//! Device pairing
//!
//! An unpaired client registers its keys and receives a batch of refs from
//! the service. Each ref becomes a pairing code ([`make_qr_code`]) that the
//! user scans with the phone. The phone signs the new device into the
//! account and the service forwards the result as `pair-success`:
//!
//! ```text
//! device-identity = { details: SignedDeviceIdentity, hmac: MAC(adv_secret, details) }
//! SignedDeviceIdentity.account_signature = Sign(account, [6,0] || details || identity_pub)
//! device_signature                       = Sign(identity, [6,1] || details || identity_pub || account_pub)
//! ```
//!
//! The HMAC proves the result belongs to the code we displayed; the
//! account signature proves the phone approved it.

mod qr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::binary::Node;
use crate::crypto::{Hash, Identity, PublicKey, SignatureBytes};
use crate::store::{AccountIdentity, Container, Device, StoreError};
use crate::types::Jid;

pub use qr::{
    make_qr_code, parse_qr_code, QrCodeData, QrEvent, QrRotation, QrTimeouts, FIRST_QR_TIMEOUT,
    NEXT_QR_TIMEOUT,
};
pub(crate) use qr::spawn_qr_channel;

/// Prefix of the message the account signs
pub const ADV_ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [6, 0];

/// Prefix of the message the device signs
pub const ADV_DEVICE_SIGNATURE_PREFIX: [u8; 2] = [6, 1];

/// Pairing errors
#[derive(Error, Debug)]
pub enum PairError {
    /// A required part of `pair-success` is absent
    #[error("Missing {0} in pair-success")]
    MissingField(&'static str),

    /// The device identity container could not be parsed
    #[error("Invalid device identity container: {0}")]
    InvalidContainer(String),

    /// The HMAC does not match our adv secret
    #[error("Device identity HMAC mismatch")]
    HmacMismatch,

    /// The account signature is invalid
    #[error("Invalid account signature")]
    InvalidAccountSignature,

    /// The signed details could not be parsed
    #[error("Invalid device details: {0}")]
    InvalidDetails(String),

    /// The device already has a JID
    #[error("Device is already paired")]
    AlreadyPaired,

    /// Pairing code text is malformed
    #[error("Invalid pairing code: {0}")]
    InvalidQrCode(String),

    /// Saving the paired device failed
    #[error("Failed to save device: {0}")]
    Store(#[from] StoreError),
}

impl PairError {
    /// Error code sent back to the service
    pub fn code(&self) -> u16 {
        match self {
            PairError::HmacMismatch | PairError::InvalidAccountSignature => 401,
            _ => 500,
        }
    }

    /// Error text sent back to the service
    pub fn text(&self) -> &'static str {
        match self.code() {
            401 => "not-authorized",
            _ => "internal-error",
        }
    }
}

/// Result type for pairing operations
pub type PairResult<T> = Result<T, PairError>;

/// Details the account signs about the new device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentityDetails {
    /// Device number within the account
    pub raw_id: u32,
    /// Unix seconds of the approval
    pub timestamp: u64,
    /// Index of this device in the account's key list
    pub key_index: u32,
}

/// Device identity signed by the account, and later by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeviceIdentity {
    /// Serialized [`DeviceIdentityDetails`]
    #[serde(with = "hex::serde")]
    pub details: Vec<u8>,
    pub account_signature_key: PublicKey,
    pub account_signature: SignatureBytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_signature: Option<SignatureBytes>,
}

/// Signed identity plus the HMAC keyed with the adv secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeviceIdentityHmac {
    /// Serialized [`SignedDeviceIdentity`]
    #[serde(with = "hex::serde")]
    pub details: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub hmac: Vec<u8>,
}

fn account_message(details: &[u8], identity: &PublicKey) -> Vec<u8> {
    let mut message = Vec::with_capacity(2 + details.len() + 32);
    message.extend_from_slice(&ADV_ACCOUNT_SIGNATURE_PREFIX);
    message.extend_from_slice(details);
    message.extend_from_slice(identity.as_bytes());
    message
}

fn device_message(details: &[u8], identity: &PublicKey, account: &PublicKey) -> Vec<u8> {
    let mut message = Vec::with_capacity(2 + details.len() + 64);
    message.extend_from_slice(&ADV_DEVICE_SIGNATURE_PREFIX);
    message.extend_from_slice(details);
    message.extend_from_slice(identity.as_bytes());
    message.extend_from_slice(account.as_bytes());
    message
}

/// Phone side: sign a new device into the account
///
/// Returns the `device-identity` bytes carried by `pair-success`.
pub fn sign_device_identity(
    account: &Identity,
    details: &DeviceIdentityDetails,
    device_identity: &PublicKey,
    adv_secret: &[u8; 32],
) -> PairResult<Vec<u8>> {
    let details =
        serde_json::to_vec(details).map_err(|e| PairError::InvalidDetails(e.to_string()))?;
    let signed = SignedDeviceIdentity {
        account_signature: account.sign(&account_message(&details, device_identity)),
        account_signature_key: *account.public_key(),
        details,
        device_signature: None,
    };
    let signed =
        serde_json::to_vec(&signed).map_err(|e| PairError::InvalidContainer(e.to_string()))?;
    let container = SignedDeviceIdentityHmac {
        hmac: Hash::mac(adv_secret, &signed).to_vec(),
        details: signed,
    };
    serde_json::to_vec(&container).map_err(|e| PairError::InvalidContainer(e.to_string()))
}

/// Service side: check the device's counter-signature in `pair-device-sign`
pub fn verify_device_signature(identity: &SignedDeviceIdentity, device_identity: &PublicKey) -> bool {
    match &identity.device_signature {
        Some(signature) => device_identity
            .verify(
                &device_message(&identity.details, device_identity, &identity.account_signature_key),
                signature,
            )
            .is_ok(),
        None => false,
    }
}

/// Fields of a `pair-success` node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSuccess {
    /// JID assigned to this device
    pub id: Jid,
    pub business_name: String,
    pub platform: String,
    /// Raw `device-identity` content
    pub device_identity: Vec<u8>,
}

impl PairSuccess {
    /// Extract the fields from the `pair-success` child of an iq
    pub fn parse(iq: &Node) -> PairResult<Self> {
        let success = iq
            .child_by_tag("pair-success")
            .ok_or(PairError::MissingField("pair-success"))?;
        let device_identity = success
            .child_by_tag("device-identity")
            .and_then(Node::bytes)
            .ok_or(PairError::MissingField("device-identity"))?
            .to_vec();
        let id = success
            .child_by_tag("device")
            .and_then(|device| device.attr_jid("jid"))
            .ok_or(PairError::MissingField("device jid"))?;
        let business_name = success
            .child_by_tag("biz")
            .and_then(|biz| biz.get_attr("name"))
            .unwrap_or_default()
            .to_string();
        let platform = success
            .child_by_tag("platform")
            .and_then(|platform| platform.get_attr("name"))
            .unwrap_or_default()
            .to_string();

        Ok(PairSuccess {
            id,
            business_name,
            platform,
            device_identity,
        })
    }
}

/// Outcome of a verified pairing
#[derive(Debug, Clone)]
pub struct PairedDevice {
    /// Our counter-signed identity to return to the service
    pub signed_identity: Vec<u8>,
    pub key_index: u32,
}

/// Verify a `pair-success`, counter-sign it and persist the device
///
/// `device` is only updated when everything, including the save, worked.
/// A device that already has a JID is never re-paired.
pub fn handle_pair_success(
    device: &mut Device,
    store: &Container,
    success: &PairSuccess,
) -> PairResult<PairedDevice> {
    if device.id.is_some() {
        warn!(target: "tether::pairing", "pair-success for an already paired device");
        return Err(PairError::AlreadyPaired);
    }

    let container: SignedDeviceIdentityHmac = serde_json::from_slice(&success.device_identity)
        .map_err(|e| PairError::InvalidContainer(e.to_string()))?;

    if !Hash::verify_mac(&device.adv_secret_key, &container.details, &container.hmac) {
        warn!(target: "tether::pairing", "pair-success HMAC mismatch");
        return Err(PairError::HmacMismatch);
    }

    let mut identity: SignedDeviceIdentity = serde_json::from_slice(&container.details)
        .map_err(|e| PairError::InvalidContainer(e.to_string()))?;

    let our_key = *device.identity.public_key();
    identity
        .account_signature_key
        .verify(
            &account_message(&identity.details, &our_key),
            &identity.account_signature,
        )
        .map_err(|_| PairError::InvalidAccountSignature)?;

    let details: DeviceIdentityDetails = serde_json::from_slice(&identity.details)
        .map_err(|e| PairError::InvalidDetails(e.to_string()))?;

    let device_signature = device.identity.sign(&device_message(
        &identity.details,
        &our_key,
        &identity.account_signature_key,
    ));
    identity.device_signature = Some(device_signature);

    let mut paired = device.clone();
    paired.id = Some(success.id.clone());
    paired.platform = success.platform.clone();
    paired.business_name = success.business_name.clone();
    paired.account = Some(AccountIdentity {
        details: identity.details.clone(),
        account_signature_key: identity.account_signature_key,
        account_signature: identity.account_signature,
        device_signature,
    });
    store.save_device(&paired)?;
    *device = paired;

    info!(target: "tether::pairing", "paired as {}", success.id);
    let signed_identity =
        serde_json::to_vec(&identity).map_err(|e| PairError::InvalidContainer(e.to_string()))?;
    Ok(PairedDevice {
        signed_identity,
        key_index: details.key_index,
    })
}

/// `pair-device-sign` reply to a successful pairing
pub fn pair_sign_reply(request_id: &str, paired: &PairedDevice) -> Node {
    Node::new("iq")
        .attr("to", Jid::server())
        .attr("type", "result")
        .attr("id", request_id)
        .children_nodes(vec![Node::new("pair-device-sign").children_nodes(vec![
            Node::new("device-identity")
                .attr("key-index", paired.key_index)
                .bytes_content(paired.signed_identity.clone()),
        ])])
}

/// Error reply to a failed pairing
pub fn pair_error_reply(request_id: &str, error: &PairError) -> Node {
    Node::new("iq")
        .attr("to", Jid::server())
        .attr("type", "error")
        .attr("id", request_id)
        .children_nodes(vec![Node::new("error")
            .attr("code", error.code())
            .attr("text", error.text())])
}
