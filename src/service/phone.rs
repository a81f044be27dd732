//! The primary phone of an account.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::crypto::{Identity, PublicKey};
use crate::pairing::{sign_device_identity, DeviceIdentityDetails, PairResult, QrCodeData};
use crate::types::{Jid, DEFAULT_USER_SERVER};

/// An account's primary device; it approves new devices by scanning codes
pub struct Phone {
    jid: Jid,
    account: Identity,
    push_name: String,
    platform: String,
}

impl Phone {
    /// Phone for `user` with a fresh account key
    pub fn new(user: impl Into<String>, push_name: impl Into<String>) -> Self {
        Phone {
            jid: Jid::new(user, DEFAULT_USER_SERVER),
            account: Identity::generate(),
            push_name: push_name.into(),
            platform: "android".to_string(),
        }
    }

    /// Account address (device 0)
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Key that signs linked devices
    pub fn account_key(&self) -> &PublicKey {
        self.account.public_key()
    }

    pub fn push_name(&self) -> &str {
        &self.push_name
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Sign the device from a scanned code into the account
    ///
    /// Returns the `device-identity` bytes for `pair-success`.
    pub fn approve(&self, code: &QrCodeData, key_index: u32) -> PairResult<Vec<u8>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let details = DeviceIdentityDetails {
            raw_id: rand::thread_rng().gen(),
            timestamp,
            key_index,
        };
        sign_device_identity(&self.account, &details, &code.identity_key, &code.adv_secret)
    }
}

impl std::fmt::Debug for Phone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phone")
            .field("jid", &self.jid)
            .field("account", self.account.public_key())
            .finish()
    }
}
