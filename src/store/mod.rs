//! Session store
//!
//! A SQLite database holding the device record, per-peer session state and
//! the identity keys seen from peers. One [`Container`] can hold several
//! devices; the demo only ever uses the first.

mod device;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{ExchangeKeypair, Identity, PublicKey, SignatureBytes};
use crate::types::Jid;

pub use device::{AccountIdentity, Device, PreKey, SIGNED_PRE_KEY_ID};

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation needs a paired device
    #[error("Device has no JID yet")]
    DeviceNotPaired,

    /// A stored value has the wrong shape
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Schema migrations, applied in order; `user_version` counts how many ran
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE devices (
        jid                 TEXT PRIMARY KEY,
        registration_id     INTEGER NOT NULL,
        noise_key           BLOB NOT NULL CHECK (length(noise_key) = 32),
        identity_key        BLOB NOT NULL CHECK (length(identity_key) = 64),
        signed_pre_key      BLOB NOT NULL CHECK (length(signed_pre_key) = 32),
        signed_pre_key_id   INTEGER NOT NULL,
        signed_pre_key_sig  BLOB NOT NULL CHECK (length(signed_pre_key_sig) = 64),
        adv_secret_key      BLOB NOT NULL CHECK (length(adv_secret_key) = 32),
        adv_details         BLOB,
        adv_account_sig_key BLOB,
        adv_account_sig     BLOB,
        adv_device_sig      BLOB,
        push_name           TEXT NOT NULL DEFAULT '',
        platform            TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE sessions (
        our_jid  TEXT NOT NULL REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE,
        their_id TEXT NOT NULL,
        session  TEXT NOT NULL,
        PRIMARY KEY (our_jid, their_id)
    );
    CREATE TABLE identities (
        our_jid  TEXT NOT NULL REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE,
        their_id TEXT NOT NULL,
        identity BLOB NOT NULL CHECK (length(identity) = 32),
        PRIMARY KEY (our_jid, their_id)
    );",
    "ALTER TABLE devices ADD COLUMN business_name TEXT NOT NULL DEFAULT '';",
];

const DEVICE_COLUMNS: &str = "jid, registration_id, noise_key, identity_key, signed_pre_key, \
    signed_pre_key_id, signed_pre_key_sig, adv_secret_key, adv_details, adv_account_sig_key, \
    adv_account_sig, adv_device_sig, push_name, platform, business_name";

/// Handle to the SQLite store
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Container {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").finish_non_exhaustive()
    }
}

impl Container {
    /// Open (or create) the store at `path` and upgrade its schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(target: "tether::store", "opening {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        upgrade(&conn)?;
        Ok(Container {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The first stored device, or a newly generated unsaved one
    pub fn get_first_device(&self) -> StoreResult<Device> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM devices ORDER BY rowid LIMIT 1", DEVICE_COLUMNS);
        match conn.query_row(&sql, [], device_from_row).optional()? {
            Some(device) => device,
            None => {
                info!(target: "tether::store", "no stored device, generating a new one");
                Ok(Device::generate())
            }
        }
    }

    /// Look up a device by its JID
    pub fn get_device(&self, jid: &Jid) -> StoreResult<Option<Device>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM devices WHERE jid = ?1", DEVICE_COLUMNS);
        conn.query_row(&sql, [jid.to_string()], device_from_row)
            .optional()?
            .transpose()
    }

    /// All stored devices
    pub fn get_all_devices(&self) -> StoreResult<Vec<Device>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM devices ORDER BY rowid", DEVICE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row??);
        }
        Ok(devices)
    }

    /// Insert or update a paired device
    pub fn save_device(&self, device: &Device) -> StoreResult<()> {
        let jid = device.id.as_ref().ok_or(StoreError::DeviceNotPaired)?;
        let account = device.account.as_ref();

        self.conn().execute(
            "INSERT INTO devices (jid, registration_id, noise_key, identity_key, signed_pre_key,
                signed_pre_key_id, signed_pre_key_sig, adv_secret_key, adv_details,
                adv_account_sig_key, adv_account_sig, adv_device_sig, push_name, platform,
                business_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (jid) DO UPDATE SET
                adv_details = excluded.adv_details,
                adv_account_sig_key = excluded.adv_account_sig_key,
                adv_account_sig = excluded.adv_account_sig,
                adv_device_sig = excluded.adv_device_sig,
                push_name = excluded.push_name,
                platform = excluded.platform,
                business_name = excluded.business_name",
            params![
                jid.to_string(),
                device.registration_id,
                &device.noise_key.secret_bytes()[..],
                &device.identity.to_bytes()[..],
                &device.signed_pre_key.key_pair.secret_bytes()[..],
                device.signed_pre_key.id,
                &device.signed_pre_key.signature.as_bytes()[..],
                &device.adv_secret_key[..],
                account.map(|a| a.details.clone()),
                account.map(|a| a.account_signature_key.as_bytes().to_vec()),
                account.map(|a| a.account_signature.as_bytes().to_vec()),
                account.map(|a| a.device_signature.as_bytes().to_vec()),
                device.push_name,
                device.platform,
                device.business_name,
            ],
        )?;

        debug!(target: "tether::store", "saved device {}", jid);
        Ok(())
    }

    /// Remove a device together with its sessions and identities
    pub fn delete_device(&self, device: &Device) -> StoreResult<()> {
        let jid = device.id.as_ref().ok_or(StoreError::DeviceNotPaired)?;
        self.conn()
            .execute("DELETE FROM devices WHERE jid = ?1", [jid.to_string()])?;
        info!(target: "tether::store", "deleted device {}", jid);
        Ok(())
    }

    /// Store the session state with `their` address
    pub fn put_session<T: Serialize>(&self, our: &Jid, their: &Jid, session: &T) -> StoreResult<()> {
        let json = serde_json::to_string(session)?;
        self.conn().execute(
            "INSERT INTO sessions (our_jid, their_id, session) VALUES (?1, ?2, ?3)
             ON CONFLICT (our_jid, their_id) DO UPDATE SET session = excluded.session",
            params![our.to_string(), their.to_string(), json],
        )?;
        Ok(())
    }

    /// Load the session state with `their` address
    pub fn get_session<T: DeserializeOwned>(&self, our: &Jid, their: &Jid) -> StoreResult<Option<T>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT session FROM sessions WHERE our_jid = ?1 AND their_id = ?2",
                params![our.to_string(), their.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    /// Whether a session with `their` address exists
    pub fn has_session(&self, our: &Jid, their: &Jid) -> StoreResult<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sessions WHERE our_jid = ?1 AND their_id = ?2",
            params![our.to_string(), their.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Forget the session with `their` address
    pub fn delete_session(&self, our: &Jid, their: &Jid) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM sessions WHERE our_jid = ?1 AND their_id = ?2",
            params![our.to_string(), their.to_string()],
        )?;
        Ok(())
    }

    /// Record the identity key seen from `their` address
    pub fn put_identity(&self, our: &Jid, their: &Jid, key: &[u8; 32]) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO identities (our_jid, their_id, identity) VALUES (?1, ?2, ?3)
             ON CONFLICT (our_jid, their_id) DO UPDATE SET identity = excluded.identity",
            params![our.to_string(), their.to_string(), &key[..]],
        )?;
        Ok(())
    }

    /// Trust on first use: unknown peers are trusted, known peers must match
    pub fn is_trusted_identity(&self, our: &Jid, their: &Jid, key: &[u8; 32]) -> StoreResult<bool> {
        let stored: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT identity FROM identities WHERE our_jid = ?1 AND their_id = ?2",
                params![our.to_string(), their.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match stored {
            None => true,
            Some(stored) => stored.as_slice() == key.as_slice(),
        })
    }

    /// Forget the identity key of `their` address
    pub fn delete_identity(&self, our: &Jid, their: &Jid) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM identities WHERE our_jid = ?1 AND their_id = ?2",
            params![our.to_string(), their.to_string()],
        )?;
        Ok(())
    }
}

fn upgrade(conn: &Connection) -> StoreResult<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let current = usize::try_from(version)
        .map_err(|_| StoreError::Corrupt(format!("negative schema version {}", version)))?;
    if current > MIGRATIONS.len() {
        return Err(StoreError::Corrupt(format!(
            "schema version {} is newer than this build",
            current
        )));
    }

    for (index, migration) in MIGRATIONS.iter().enumerate().skip(current) {
        let target = index + 1;
        info!(target: "tether::store", "upgrading schema to version {}", target);
        conn.execute_batch(&format!(
            "BEGIN; {} PRAGMA user_version = {}; COMMIT;",
            migration, target
        ))?;
    }
    Ok(())
}

/// Raw columns of a device row
struct DeviceRow {
    jid: String,
    registration_id: u32,
    noise_key: Vec<u8>,
    identity_key: Vec<u8>,
    signed_pre_key: Vec<u8>,
    signed_pre_key_id: u32,
    signed_pre_key_sig: Vec<u8>,
    adv_secret_key: Vec<u8>,
    adv_details: Option<Vec<u8>>,
    adv_account_sig_key: Option<Vec<u8>>,
    adv_account_sig: Option<Vec<u8>>,
    adv_device_sig: Option<Vec<u8>>,
    push_name: String,
    platform: String,
    business_name: String,
}

impl DeviceRow {
    fn into_device(self) -> StoreResult<Device> {
        let id = self
            .jid
            .parse::<Jid>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let identity = Identity::from_bytes(&self.identity_key).map_err(corrupt("identity_key"))?;

        let account = match (
            self.adv_details,
            self.adv_account_sig_key,
            self.adv_account_sig,
            self.adv_device_sig,
        ) {
            (Some(details), Some(key), Some(account_sig), Some(device_sig)) => Some(AccountIdentity {
                details,
                account_signature_key: PublicKey::from_bytes(&key)
                    .map_err(corrupt("adv_account_sig_key"))?,
                account_signature: SignatureBytes::from_bytes(&account_sig)
                    .map_err(corrupt("adv_account_sig"))?,
                device_signature: SignatureBytes::from_bytes(&device_sig)
                    .map_err(corrupt("adv_device_sig"))?,
            }),
            (None, None, None, None) => None,
            _ => return Err(StoreError::Corrupt("partial account identity".to_string())),
        };

        Ok(Device {
            id: Some(id),
            registration_id: self.registration_id,
            noise_key: ExchangeKeypair::from_secret(to_array(&self.noise_key, "noise_key")?),
            identity,
            signed_pre_key: PreKey {
                id: self.signed_pre_key_id,
                key_pair: ExchangeKeypair::from_secret(to_array(
                    &self.signed_pre_key,
                    "signed_pre_key",
                )?),
                signature: SignatureBytes::from_bytes(&self.signed_pre_key_sig)
                    .map_err(corrupt("signed_pre_key_sig"))?,
            },
            adv_secret_key: Zeroizing::new(to_array(&self.adv_secret_key, "adv_secret_key")?),
            account,
            push_name: self.push_name,
            platform: self.platform,
            business_name: self.business_name,
        })
    }
}

/// Map a device row; the outer error is SQLite's, the inner one ours
fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<Device>> {
    let raw = DeviceRow {
        jid: row.get(0)?,
        registration_id: row.get(1)?,
        noise_key: row.get(2)?,
        identity_key: row.get(3)?,
        signed_pre_key: row.get(4)?,
        signed_pre_key_id: row.get(5)?,
        signed_pre_key_sig: row.get(6)?,
        adv_secret_key: row.get(7)?,
        adv_details: row.get(8)?,
        adv_account_sig_key: row.get(9)?,
        adv_account_sig: row.get(10)?,
        adv_device_sig: row.get(11)?,
        push_name: row.get(12)?,
        platform: row.get(13)?,
        business_name: row.get(14)?,
    };
    Ok(raw.into_device())
}

fn to_array(bytes: &[u8], column: &str) -> StoreResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{} has length {}", column, bytes.len())))
}

fn corrupt<E: std::fmt::Display>(column: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::Corrupt(format!("{}: {}", column, e))
}
