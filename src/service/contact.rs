//! A remote user writing to linked devices.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::crypto::{Identity, PublicKey};
use crate::session::{EncType, OutboundSession, SessionResult};
use crate::types::{DeviceBundle, Jid, DEFAULT_USER_SERVER};

struct DeviceSession {
    /// Identity the session was opened against
    identity: PublicKey,
    session: OutboundSession,
}

/// Someone who sends messages to our devices
pub struct Contact {
    jid: Jid,
    push_name: String,
    identity: Identity,
    sessions: HashMap<Jid, DeviceSession>,
}

impl Contact {
    pub fn new(user: impl Into<String>, push_name: impl Into<String>) -> Self {
        Contact {
            jid: Jid::new(user, DEFAULT_USER_SERVER),
            push_name: push_name.into(),
            identity: Identity::generate(),
            sessions: HashMap::new(),
        }
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn push_name(&self) -> &str {
        &self.push_name
    }

    /// Encrypt for one device, opening a session on first use
    ///
    /// A device that re-paired with new keys gets a new session.
    pub fn encrypt(
        &mut self,
        device: &Jid,
        bundle: &DeviceBundle,
        plaintext: &[u8],
    ) -> SessionResult<(EncType, Vec<u8>)> {
        let current = match self.sessions.entry(device.clone()) {
            Entry::Occupied(entry) if entry.get().identity == bundle.identity => entry.into_mut(),
            entry => {
                let fresh = DeviceSession {
                    identity: bundle.identity,
                    session: OutboundSession::start(&self.identity, bundle)?,
                };
                match entry {
                    Entry::Occupied(mut entry) => {
                        entry.insert(fresh);
                        entry.into_mut()
                    }
                    Entry::Vacant(entry) => entry.insert(fresh),
                }
            }
        };
        current.session.encrypt(plaintext)
    }
}
