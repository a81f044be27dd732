//! Addressing types shared by every layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoResult, ExchangePublicKey, PublicKey, SignatureBytes};

/// Server part of regular user addresses
pub const DEFAULT_USER_SERVER: &str = "s.tether.net";

/// Server part of the service itself
pub const SERVER_JID: &str = "tether.net";

/// Error parsing a textual JID
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid JID: {0:?}")]
pub struct JidParseError(pub String);

/// An address on the network.
///
/// `user@server` addresses a user; `user:device@server` addresses one of
/// the user's linked devices (device `0` is the primary phone).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Jid {
    /// User part (phone number or service name)
    pub user: String,
    /// Device index, 0 for the primary device
    pub device: u16,
    /// Server part
    pub server: String,
}

impl Jid {
    /// Build a user-level JID
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Jid {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Build a device-level JID
    pub fn new_ad(user: impl Into<String>, device: u16, server: impl Into<String>) -> Self {
        Jid {
            user: user.into(),
            device,
            server: server.into(),
        }
    }

    /// The service's own JID
    pub fn server() -> Self {
        Jid::new("", SERVER_JID)
    }

    /// Same address without the device part
    pub fn to_non_ad(&self) -> Self {
        Jid::new(self.user.clone(), self.server.clone())
    }

    /// Whether this addresses a specific device
    pub fn is_ad(&self) -> bool {
        self.device > 0
    }

    /// Whether the JID has no server part
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.user.is_empty(), self.device) {
            (true, _) => write!(f, "{}", self.server),
            (false, 0) => write!(f, "{}@{}", self.user, self.server),
            (false, device) => write!(f, "{}:{}@{}", self.user, device, self.server),
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            if s.is_empty() || s.contains(':') {
                return Err(JidParseError(s.to_string()));
            }
            return Ok(Jid::new("", s));
        };
        if server.is_empty() || user_part.is_empty() {
            return Err(JidParseError(s.to_string()));
        }
        match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| JidParseError(s.to_string()))?;
                Ok(Jid::new_ad(user, device, server))
            }
            None => Ok(Jid::new(user_part, server)),
        }
    }
}

impl Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Public key material a sender needs to open a session with a device.
///
/// Sent by the device when it registers; the service hands it to contacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBundle {
    pub registration_id: u32,
    /// Ed25519 identity key
    pub identity: PublicKey,
    /// X25519 form of the identity key
    pub identity_exchange: ExchangePublicKey,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: ExchangePublicKey,
    /// Identity signature over the signed pre-key
    pub signed_pre_key_signature: SignatureBytes,
}

impl DeviceBundle {
    /// Check the pre-key signature
    pub fn verify(&self) -> CryptoResult<()> {
        self.identity
            .verify(self.signed_pre_key.as_bytes(), &self.signed_pre_key_signature)
    }
}
