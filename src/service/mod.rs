//! Development service
//!
//! Plays the messaging network for the demo and the tests: it answers the
//! handshake, hands out pairing refs to unpaired devices, relays a phone's
//! approval, keeps the device registry, logs devices in and delivers
//! messages from [`Contact`]s, queueing them while a device is offline.
//!
//! Everything lives in memory; a restarted service forgets its devices.

mod contact;
mod phone;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binary::Node;
use crate::crypto::{random_bytes, ExchangeKeypair, PublicKey};
use crate::events::MessageContent;
use crate::pairing::{parse_qr_code, verify_device_signature, PairError, SignedDeviceIdentity};
use crate::session::SessionError;
use crate::transport::memory::MemoryListener;
use crate::transport::{
    server_handshake, ClientAuth, NoiseSocket, ServerHello, Transport, TransportError,
    WebSocketTransport,
};
use crate::types::{DeviceBundle, Jid, DEFAULT_USER_SERVER, SERVER_JID};

pub use contact::Contact;
pub use phone::Phone;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pairing error: {0}")]
    Pair(#[from] PairError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No unpaired device holds this ref
    #[error("Unknown pairing ref {0:?}")]
    UnknownRef(String),

    /// The code's keys differ from the registering device's keys
    #[error("Pairing code does not match the registered device")]
    KeyMismatch,

    /// The device bundle's signature is invalid
    #[error("Invalid device bundle")]
    InvalidBundle,

    #[error("Device {0} is not registered")]
    NotRegistered(Jid),

    /// The user's devices are linked to a different account key
    #[error("Account key of {0} does not match its linked devices")]
    AccountMismatch(Jid),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service settings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name sent in the server hello
    pub name: String,
    /// Noise static key; generated when absent
    pub noise_key: Option<[u8; 32]>,
    /// Pairing refs issued per registration
    pub refs_per_registration: usize,
    /// Clients below this version are refused with 405
    pub min_version: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            name: SERVER_JID.to_string(),
            noise_key: None,
            refs_per_registration: 6,
            min_version: None,
        }
    }
}

/// Queued for a connection task
enum Outbound {
    Node(Node),
    /// Send, then close the connection
    Close(Node),
}

type ConnId = u64;

struct Registration {
    noise_key: [u8; 32],
    bundle: DeviceBundle,
    account: PublicKey,
    push_name: String,
}

struct Approval {
    jid: Jid,
    account: PublicKey,
    push_name: String,
    request_id: String,
}

struct Unpaired {
    noise_key: [u8; 32],
    bundle: DeviceBundle,
    refs: Vec<String>,
    tx: mpsc::UnboundedSender<Outbound>,
    approval: Option<Approval>,
}

struct Online {
    conn: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct State {
    next_conn: ConnId,
    refs: HashMap<String, ConnId>,
    unpaired: HashMap<ConnId, Unpaired>,
    devices: BTreeMap<Jid, Registration>,
    online: HashMap<Jid, Online>,
    offline: HashMap<Jid, VecDeque<Node>>,
}

struct ServiceInner {
    config: ServiceConfig,
    noise_key: ExchangeKeypair,
    state: Mutex<State>,
}

/// The development service; clones share state
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `1.2.3` as `[1, 2, 3]`; non-numeric parts count as 0
fn version_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.trim().parse().unwrap_or(0))
        .collect()
}

fn stream_error(code: u16) -> Node {
    Node::new("stream:error").attr("code", code)
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        let noise_key = match config.noise_key {
            Some(secret) => ExchangeKeypair::from_secret(secret),
            None => ExchangeKeypair::generate(),
        };
        Service {
            inner: Arc::new(ServiceInner {
                config,
                noise_key,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Static key clients can pin
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.noise_key.public_key().0
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refs currently waiting to be scanned
    pub fn pending_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.state().refs.keys().cloned().collect();
        refs.sort();
        refs
    }

    /// Devices that completed pairing
    pub fn registered_devices(&self) -> Vec<Jid> {
        self.state().devices.keys().cloned().collect()
    }

    /// Whether a device has a logged-in connection
    pub fn is_online(&self, jid: &Jid) -> bool {
        self.state().online.contains_key(jid)
    }

    /// Messages waiting for a device to come online
    pub fn queued_messages(&self, jid: &Jid) -> usize {
        self.state().offline.get(jid).map_or(0, VecDeque::len)
    }

    /// Accept connections from an in-memory listener
    pub fn spawn_memory(&self, listener: MemoryListener) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(transport) = listener.accept().await {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.serve(Box::new(transport)).await {
                        debug!(target: "tether::service", "connection ended: {}", e);
                    }
                });
            }
        })
    }

    /// Accept WebSocket connections until the listener fails
    pub async fn listen(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let service = self.clone();
            tokio::spawn(async move {
                let transport = match WebSocketTransport::accept(stream).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(target: "tether::service", "websocket handshake with {} failed: {}", addr, e);
                        return;
                    }
                };
                debug!(target: "tether::service", "connection from {}", addr);
                if let Err(e) = service.serve(Box::new(transport)).await {
                    debug!(target: "tether::service", "connection from {} ended: {}", addr, e);
                }
            });
        }
    }

    /// Serve one connection until it closes
    pub async fn serve(&self, transport: Box<dyn Transport>) -> ServiceResult<()> {
        let hello = ServerHello {
            server: self.inner.config.name.clone(),
            time: unix_now(),
        };
        let (mut socket, payload, client_static) =
            server_handshake(transport, self.inner.noise_key.secret_bytes(), &hello).await?;

        if self.is_outdated(&payload.version) {
            info!(target: "tether::service", "refusing client version {}", payload.version);
            socket
                .send_node(&Node::new("failure").attr("reason", 405))
                .await?;
            let _ = socket.close().await;
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (conn, jid) = match payload.auth {
            ClientAuth::Register { bundle } => (self.register(client_static, bundle, tx)?, None),
            ClientAuth::Login { jid } => match self.login(&jid, client_static, tx) {
                Some(conn) => (conn, Some(jid)),
                None => {
                    info!(target: "tether::service", "refusing login for {}", jid);
                    socket
                        .send_node(&Node::new("failure").attr("reason", 401))
                        .await?;
                    let _ = socket.close().await;
                    return Ok(());
                }
            },
        };

        let result = self.run_connection(&mut socket, rx).await;
        self.drop_connection(conn, jid.as_ref());
        let _ = socket.close().await;
        result
    }

    fn is_outdated(&self, version: &str) -> bool {
        match &self.inner.config.min_version {
            Some(min) => version_parts(version) < version_parts(min),
            None => false,
        }
    }

    fn register(
        &self,
        noise_key: [u8; 32],
        bundle: DeviceBundle,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> ServiceResult<ConnId> {
        bundle.verify().map_err(|_| ServiceError::InvalidBundle)?;

        let refs: Vec<String> = (0..self.inner.config.refs_per_registration)
            .map(|_| hex::encode(random_bytes::<16>()))
            .collect();
        let iq = Node::new("iq")
            .attr("from", Jid::server())
            .attr("type", "set")
            .attr("id", hex::encode(random_bytes::<4>()))
            .children_nodes(vec![Node::new("pair-device").children_nodes(
                refs.iter()
                    .map(|r| Node::new("ref").bytes_content(r.as_bytes().to_vec()))
                    .collect(),
            )]);
        let _ = tx.send(Outbound::Node(iq));

        let mut state = self.state();
        let conn = state.next_conn;
        state.next_conn += 1;
        for r in &refs {
            state.refs.insert(r.clone(), conn);
        }
        state.unpaired.insert(
            conn,
            Unpaired {
                noise_key,
                bundle,
                refs,
                tx,
                approval: None,
            },
        );
        info!(target: "tether::service", "device registering, issued pairing refs");
        Ok(conn)
    }

    /// `None` when the device is unknown or proved the wrong key
    fn login(
        &self,
        jid: &Jid,
        noise_key: [u8; 32],
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Option<ConnId> {
        let mut state = self.state();
        let push_name = match state.devices.get(jid) {
            Some(device) if device.noise_key == noise_key => device.push_name.clone(),
            _ => return None,
        };

        let conn = state.next_conn;
        state.next_conn += 1;
        if let Some(previous) = state.online.remove(jid) {
            info!(target: "tether::service", "{} connected again, replacing old connection", jid);
            let conflict = Node::new("stream:error").children_nodes(vec![Node::new("conflict")]);
            let _ = previous.tx.send(Outbound::Close(conflict));
        }

        let success = Node::new("success")
            .attr("t", unix_now())
            .attr("push_name", push_name);
        let _ = tx.send(Outbound::Node(success));
        let queued = state.offline.remove(jid).unwrap_or_default();
        if !queued.is_empty() {
            debug!(target: "tether::service", "flushing {} queued messages to {}", queued.len(), jid);
        }
        for message in queued {
            let _ = tx.send(Outbound::Node(message));
        }

        state.online.insert(jid.clone(), Online { conn, tx });
        info!(target: "tether::service", "{} logged in", jid);
        Some(conn)
    }

    fn drop_connection(&self, conn: ConnId, jid: Option<&Jid>) {
        let mut state = self.state();
        if let Some(unpaired) = state.unpaired.remove(&conn) {
            for r in unpaired.refs {
                state.refs.remove(&r);
            }
        }
        if let Some(jid) = jid {
            if state.online.get(jid).is_some_and(|online| online.conn == conn) {
                state.online.remove(jid);
                debug!(target: "tether::service", "{} went offline", jid);
            }
        }
    }

    async fn run_connection(
        &self,
        socket: &mut NoiseSocket,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> ServiceResult<()> {
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Node(node)) => socket.send_node(&node).await?,
                    Some(Outbound::Close(node)) => {
                        socket.send_node(&node).await?;
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                received = socket.receive_node() => match received {
                    Ok(node) => self.handle_node(socket, &node).await?,
                    Err(TransportError::Disconnected) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    async fn handle_node(&self, socket: &mut NoiseSocket, node: &Node) -> ServiceResult<()> {
        match (node.tag.as_str(), node.get_attr("type")) {
            ("iq", Some("get")) if node.child_by_tag("ping").is_some() => {
                let mut pong = Node::new("iq").attr("from", Jid::server()).attr("type", "result");
                if let Some(id) = node.get_attr("id") {
                    pong = pong.attr("id", id);
                }
                socket.send_node(&pong).await?;
            }
            ("iq", Some("result")) if node.child_by_tag("pair-device-sign").is_some() => {
                self.complete_pairing(node);
            }
            ("iq", Some("error")) => {
                warn!(target: "tether::service", "client reported an error: {}", node);
                self.abandon_approval(node.get_attr("id").unwrap_or_default());
            }
            ("receipt", Some("retry")) => {
                warn!(target: "tether::service", "client could not decrypt {:?}", node.get_attr("id"));
            }
            ("receipt", _) => {
                debug!(target: "tether::service", "delivered {:?}", node.get_attr("id"));
            }
            _ => debug!(target: "tether::service", "ignoring {}", node),
        }
        Ok(())
    }

    fn find_approval(state: &State, request_id: &str) -> Option<ConnId> {
        state.unpaired.iter().find_map(|(conn, unpaired)| {
            unpaired
                .approval
                .as_ref()
                .filter(|approval| approval.request_id == request_id)
                .map(|_| *conn)
        })
    }

    fn abandon_approval(&self, request_id: &str) {
        let mut state = self.state();
        if let Some(conn) = Self::find_approval(&state, request_id) {
            if let Some(unpaired) = state.unpaired.get_mut(&conn) {
                unpaired.approval = None;
            }
        }
    }

    /// Register the device once it returns a valid counter-signature
    fn complete_pairing(&self, node: &Node) {
        let request_id = node.get_attr("id").unwrap_or_default();
        let mut state = self.state();
        let Some(conn) = Self::find_approval(&state, request_id) else {
            warn!(target: "tether::service", "pair-device-sign for unknown request {:?}", request_id);
            return;
        };
        let Some(mut unpaired) = state.unpaired.remove(&conn) else {
            return;
        };
        let Some(approval) = unpaired.approval.take() else {
            return;
        };
        for r in &unpaired.refs {
            state.refs.remove(r);
        }

        let identity = node
            .child_by_path(&["pair-device-sign", "device-identity"])
            .and_then(Node::bytes)
            .and_then(|bytes| serde_json::from_slice::<SignedDeviceIdentity>(bytes).ok());
        let valid = identity.is_some_and(|identity| {
            identity.account_signature_key == approval.account
                && verify_device_signature(&identity, &unpaired.bundle.identity)
        });
        if !valid {
            warn!(target: "tether::service", "invalid device signature from {}", approval.jid);
            let _ = unpaired.tx.send(Outbound::Close(stream_error(401)));
            return;
        }

        info!(target: "tether::service", "paired {}", approval.jid);
        state.devices.insert(
            approval.jid,
            Registration {
                noise_key: unpaired.noise_key,
                bundle: unpaired.bundle,
                account: approval.account,
                push_name: approval.push_name,
            },
        );
        // The device logs in on a fresh connection
        let _ = unpaired.tx.send(Outbound::Close(stream_error(515)));
    }

    /// Scan a pairing code with `phone`
    ///
    /// Sends `pair-success` to the waiting device and returns the JID it
    /// will have once it confirms.
    pub fn approve(&self, code: &str, phone: &Phone) -> ServiceResult<Jid> {
        let data = parse_qr_code(code)?;
        let mut state = self.state();
        let conn = *state
            .refs
            .get(&data.reference)
            .ok_or_else(|| ServiceError::UnknownRef(data.reference.clone()))?;

        let linked: Vec<(&Jid, &Registration)> = state
            .devices
            .iter()
            .filter(|(jid, _)| jid.user == phone.jid().user)
            .collect();
        if linked
            .iter()
            .any(|(_, registration)| registration.account != *phone.account_key())
        {
            warn!(target: "tether::service", "{} approved with a different account key", phone.jid());
            return Err(ServiceError::AccountMismatch(phone.jid().clone()));
        }
        let device_number = linked.iter().map(|(jid, _)| jid.device).max().unwrap_or(0) + 1;
        let jid = Jid::new_ad(phone.jid().user.clone(), device_number, DEFAULT_USER_SERVER);

        let unpaired = state
            .unpaired
            .get_mut(&conn)
            .ok_or_else(|| ServiceError::UnknownRef(data.reference.clone()))?;
        if unpaired.noise_key != data.noise_key.0 || unpaired.bundle.identity != data.identity_key {
            return Err(ServiceError::KeyMismatch);
        }

        let device_identity = phone.approve(&data, u32::from(device_number))?;
        let request_id = hex::encode(random_bytes::<4>());
        let iq = Node::new("iq")
            .attr("from", Jid::server())
            .attr("type", "set")
            .attr("id", &request_id)
            .children_nodes(vec![Node::new("pair-success").children_nodes(vec![
                Node::new("device-identity").bytes_content(device_identity),
                Node::new("platform").attr("name", phone.platform()),
                Node::new("device").attr("jid", &jid),
            ])]);
        unpaired
            .tx
            .send(Outbound::Node(iq))
            .map_err(|_| TransportError::Disconnected)?;
        unpaired.approval = Some(Approval {
            jid: jid.clone(),
            account: *phone.account_key(),
            push_name: phone.push_name().to_string(),
            request_id,
        });
        info!(target: "tether::service", "{} approved {}", phone.jid(), jid);
        Ok(jid)
    }

    /// Unlink a device; it is logged out if connected
    pub fn unlink(&self, jid: &Jid) -> bool {
        let mut state = self.state();
        state.offline.remove(jid);
        if let Some(online) = state.online.remove(jid) {
            let _ = online.tx.send(Outbound::Close(stream_error(401)));
        }
        let removed = state.devices.remove(jid).is_some();
        if removed {
            info!(target: "tether::service", "unlinked {}", jid);
        }
        removed
    }

    /// Encrypt a message from `contact` to a device and deliver or queue it
    ///
    /// Returns the message id.
    pub fn deliver(
        &self,
        to: &Jid,
        contact: &mut Contact,
        content: &MessageContent,
    ) -> ServiceResult<String> {
        let bundle = self
            .state()
            .devices
            .get(to)
            .map(|device| device.bundle.clone())
            .ok_or_else(|| ServiceError::NotRegistered(to.clone()))?;

        let plaintext = serde_json::to_vec(content)?;
        let (enc_type, payload) = contact.encrypt(to, &bundle, &plaintext)?;
        let id = hex::encode_upper(random_bytes::<8>());
        let message = Node::new("message")
            .attr("id", &id)
            .attr("from", contact.jid())
            .attr("to", to)
            .attr("t", unix_now())
            .attr("notify", contact.push_name())
            .children_nodes(vec![Node::new("enc")
                .attr("type", enc_type)
                .attr("v", 2)
                .bytes_content(payload)]);

        let mut state = self.state();
        let message = match state.online.get(to) {
            Some(online) => match online.tx.send(Outbound::Node(message)) {
                Ok(()) => {
                    debug!(target: "tether::service", "delivered {} to {}", id, to);
                    return Ok(id);
                }
                Err(mpsc::error::SendError(Outbound::Node(message))) => message,
                Err(_) => return Ok(id),
            },
            None => message,
        };
        debug!(target: "tether::service", "{} offline, queueing {}", to, id);
        state.offline.entry(to.clone()).or_default().push_back(message);
        Ok(id)
    }
}
