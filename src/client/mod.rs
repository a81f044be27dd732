//! The client
//!
//! [`Client`] owns a device and its store, dials the service, runs the
//! handshake (login when paired, registration otherwise) and then hands the
//! socket to a connection task. That task routes incoming nodes, sends
//! queued outgoing ones, answers pings and reconnects with backoff when the
//! connection drops.

mod connection;
mod handlers;
mod keepalive;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::binary::Node;
use crate::events::{Dispatcher, Event, HandlerId};
use crate::pairing::{spawn_qr_channel, QrEvent, QrTimeouts};
use crate::store::{Container, Device, StoreError};
use crate::transport::{
    client_handshake, ClientAuth, ClientPayload, Dialer, NoiseSocket, TransportError,
    WebSocketDialer,
};
use crate::types::Jid;

use connection::Command;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// `connect` called while a connection is running
    #[error("Client is already connected")]
    AlreadyConnected,

    /// Operation needs a connection
    #[error("Client is not connected")]
    NotConnected,

    /// A paired device cannot pair again
    #[error("Device is already paired, no QR channel")]
    QrStoreContainsId,

    /// The QR channel must be requested before connecting
    #[error("QR channel requested after connecting")]
    QrAfterConnect,

    /// Only one QR channel per client
    #[error("QR channel already taken")]
    QrChannelAlreadyTaken,

    /// No response to an info query in time
    #[error("Info query timed out")]
    IqTimedOut,

    /// The service answered an info query with an error
    #[error("Info query failed: {code} {text}")]
    IqError { code: u16, text: String },

    /// Connection or handshake failure
    #[error("Socket error: {0}")]
    Socket(#[from] TransportError),

    /// Device store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Exponential reconnect delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if secs.is_finite() && secs < self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        }
    }
}

/// Keepalive ping schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Time between pings
    pub interval: Duration,
    /// How long to wait for each pong
    pub timeout: Duration,
    /// Reconnect once pings have failed for this long
    pub max_failure: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive {
            interval: Duration::from_secs(25),
            timeout: Duration::from_secs(20),
            max_failure: Duration::from_secs(180),
        }
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent in the handshake; the service refuses outdated versions
    pub version: String,
    /// Shown on the phone's linked devices list
    pub platform: String,
    /// Expected service static key
    pub server_key: Option<[u8; 32]>,
    pub auto_reconnect: bool,
    pub backoff: Backoff,
    pub keepalive: KeepAlive,
    /// Default wait for info query responses
    pub iq_timeout: Duration,
    pub qr_timeouts: QrTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: "tether".to_string(),
            server_key: None,
            auto_reconnect: true,
            backoff: Backoff::default(),
            keepalive: KeepAlive::default(),
            iq_timeout: Duration::from_secs(75),
            qr_timeouts: QrTimeouts::default(),
        }
    }
}

/// A running connection task
struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub(crate) struct ClientInner {
    pub(crate) store: Container,
    device: Mutex<Device>,
    dialer: Box<dyn Dialer>,
    pub(crate) config: ClientConfig,
    pub(crate) dispatcher: Arc<Dispatcher>,
    running: tokio::sync::Mutex<Option<Running>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    connected: AtomicBool,
    logged_in: AtomicBool,
    qr_taken: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    id_prefix: String,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ClientInner {
    pub(crate) fn device(&self) -> MutexGuard<'_, Device> {
        lock(&self.device)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.logged_in.store(false, Ordering::SeqCst);
            // Waiters see the dropped sender as NotConnected
            lock(&self.pending).clear();
        }
    }

    pub(crate) fn set_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    pub(crate) fn generate_id(&self) -> String {
        format!(
            "{}.{}",
            self.id_prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn command(&self, command: Command) -> ClientResult<()> {
        match lock(&self.commands).as_ref() {
            Some(tx) if self.connected.load(Ordering::SeqCst) => {
                tx.send(command).map_err(|_| ClientError::NotConnected)
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Queue a node on the current connection
    pub(crate) fn send_node(&self, node: Node) -> ClientResult<()> {
        self.command(Command::Send(node))
    }

    /// Dispatch from the connection task
    pub(crate) fn queue_event(&self, event: Event) -> ClientResult<()> {
        self.command(Command::Dispatch(event))
    }

    pub(crate) fn force_reconnect(&self) -> ClientResult<()> {
        self.command(Command::Reconnect)
    }

    /// Send an info query and wait for the matching response
    pub(crate) async fn send_iq(&self, mut node: Node, timeout: Duration) -> ClientResult<Node> {
        let id = match node.get_attr("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.generate_id();
                node.attrs.insert("id".to_string(), id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        if let Err(e) = self.send_node(node) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(ClientError::IqTimedOut);
            }
        };

        if response.get_attr("type") == Some("error") {
            let error = response.child_by_tag("error");
            return Err(ClientError::IqError {
                code: error
                    .and_then(|e| e.attr_u64("code"))
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or(0),
                text: error
                    .and_then(|e| e.get_attr("text"))
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(response)
    }

    /// Hand a response to whoever is waiting for it; `false` if nobody is
    pub(crate) fn resolve_iq(&self, node: &Node) -> bool {
        let Some(id) = node.get_attr("id") else {
            return false;
        };
        match lock(&self.pending).remove(id) {
            Some(waiter) => {
                let _ = waiter.send(node.clone());
                true
            }
            None => false,
        }
    }

    /// Stop the connection task and wait for it
    pub(crate) async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.task.await;
            info!(target: "tether::client", "disconnected");
        }
        *lock(&self.commands) = None;
        self.set_connected(false);
    }

    /// Dial and run the handshake for the current device
    pub(crate) async fn open_socket(&self) -> ClientResult<NoiseSocket> {
        let (noise_key, payload) = {
            let device = self.device();
            let auth = match &device.id {
                Some(jid) => ClientAuth::Login { jid: jid.clone() },
                None => ClientAuth::Register {
                    bundle: device.bundle(),
                },
            };
            let payload = ClientPayload {
                version: self.config.version.clone(),
                platform: self.config.platform.clone(),
                push_name: Some(device.push_name.clone()).filter(|name| !name.is_empty()),
                passive: false,
                auth,
            };
            (*device.noise_key.secret_bytes(), payload)
        };

        let transport = self.dialer.dial().await?;
        let (socket, hello) =
            client_handshake(transport, &noise_key, &payload, self.config.server_key).await?;
        debug!(target: "tether::client", "connected to {} (server time {})", hello.server, hello.time);
        Ok(socket)
    }
}

/// Handle to a client; clones share the connection
///
/// Dropping the last handle stops the connection task.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _handles: Arc<HandleGuard>,
}

/// Shared by every [`Client`] clone; the connection task never holds one
struct HandleGuard {
    inner: Arc<ClientInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        // A held lock means connect or shutdown is already in progress
        if let Ok(mut running) = self.inner.running.try_lock() {
            if let Some(running) = running.take() {
                let _ = running.shutdown.send(true);
                debug!(target: "tether::client", "last client handle dropped, stopping");
            }
        }
    }
}

impl Client {
    /// Client for a device, dialing the service over WebSocket
    pub fn new(device: Device, store: Container, server_url: &str, config: ClientConfig) -> Self {
        Self::with_dialer(device, store, Box::new(WebSocketDialer::new(server_url)), config)
    }

    /// Client for a device using any dialer
    pub fn with_dialer(
        device: Device,
        store: Container,
        dialer: Box<dyn Dialer>,
        config: ClientConfig,
    ) -> Self {
        let id_prefix = hex::encode(crate::crypto::random_bytes::<2>());
        let inner = Arc::new(ClientInner {
            store,
            device: Mutex::new(device),
            dialer,
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            running: tokio::sync::Mutex::new(None),
            commands: Mutex::new(None),
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            qr_taken: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            id_prefix,
            next_id: AtomicU64::new(1),
        });
        Client {
            _handles: Arc::new(HandleGuard {
                inner: inner.clone(),
            }),
            inner,
        }
    }

    /// Register an event handler
    pub fn add_event_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.add_handler(handler)
    }

    /// Remove an event handler; `false` if it was not registered
    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.remove_handler(id)
    }

    /// Channel of pairing codes and the pairing outcome
    ///
    /// Must be called before [`Client::connect`] on an unpaired device.
    /// When every code expires the client disconnects.
    pub async fn get_qr_channel(&self) -> ClientResult<mpsc::Receiver<QrEvent>> {
        if self.inner.device().id.is_some() {
            return Err(ClientError::QrStoreContainsId);
        }
        if self.is_connected() {
            return Err(ClientError::QrAfterConnect);
        }
        if self.inner.qr_taken.swap(true, Ordering::SeqCst) {
            return Err(ClientError::QrChannelAlreadyTaken);
        }

        let weak = Arc::downgrade(&self.inner);
        Ok(spawn_qr_channel(
            &self.inner.dispatcher,
            self.inner.config.qr_timeouts,
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.shutdown().await;
                }
            },
        ))
    }

    /// Connect to the service
    ///
    /// Dial and handshake errors are returned; once connected, the
    /// connection task reconnects on its own.
    pub async fn connect(&self) -> ClientResult<()> {
        let mut running = self.inner.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Err(ClientError::AlreadyConnected);
            }
        }

        let socket = self.inner.open_socket().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock(&self.inner.commands) = Some(command_tx);
        self.inner.set_connected(true);

        let task = tokio::spawn(connection::run(
            self.inner.clone(),
            socket,
            command_rx,
            shutdown_rx,
        ));
        *running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
    }

    /// Whether the socket is open
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether the service accepted our login on the current connection
    pub fn is_logged_in(&self) -> bool {
        self.inner.logged_in.load(Ordering::SeqCst)
    }

    /// JID of the device, `None` until paired
    pub fn store_id(&self) -> Option<Jid> {
        self.inner.device().id.clone()
    }

    /// Send a ping and wait for the answer
    pub async fn ping(&self) -> ClientResult<()> {
        self.inner
            .send_iq(keepalive::ping_node(), self.inner.config.iq_timeout)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    fn offline_client(device: Device) -> Client {
        let (dialer, _listener) = memory::listener();
        let store = Container::open_in_memory().unwrap();
        Client::with_dialer(device, store, Box::new(dialer), ClientConfig::default())
    }

    #[tokio::test]
    async fn test_qr_channel_rules() {
        let client = offline_client(Device::generate());
        assert!(client.get_qr_channel().await.is_ok());
        assert!(matches!(
            client.get_qr_channel().await,
            Err(ClientError::QrChannelAlreadyTaken)
        ));

        let mut paired = Device::generate();
        paired.id = Some("15550001:1@s.tether.net".parse().unwrap());
        let client = offline_client(paired);
        assert!(matches!(
            client.get_qr_channel().await,
            Err(ClientError::QrStoreContainsId)
        ));
    }

    #[tokio::test]
    async fn test_requests_need_a_connection() {
        let client = offline_client(Device::generate());
        assert!(!client.is_connected());
        assert!(!client.is_logged_in());
        assert!(client.store_id().is_none());
        assert!(matches!(client.ping().await, Err(ClientError::NotConnected)));
        // Nothing to do, but must not hang
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_fails_without_service() {
        let (dialer, listener) = memory::listener();
        drop(listener);
        let client = Client::with_dialer(
            Device::generate(),
            Container::open_in_memory().unwrap(),
            Box::new(dialer),
            ClientConfig::default(),
        );
        assert!(matches!(client.connect().await, Err(ClientError::Socket(_))));
        assert!(!client.is_connected());
    }
}
