//! The connection task.
//!
//! One task per client owns the socket. It selects between incoming nodes,
//! queued commands and the shutdown signal, so node handling and event
//! dispatch happen in arrival order. When a session ends the task decides
//! whether to reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{handlers, ClientInner};
use crate::binary::Node;
use crate::events::Event;
use crate::transport::NoiseSocket;

/// Work queued for the connection task
#[derive(Debug)]
pub(crate) enum Command {
    /// Send a node
    Send(Node),
    /// Dispatch an event from the connection task
    Dispatch(Event),
    /// Drop the connection and reconnect
    Reconnect,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// `disconnect` was called
    Shutdown,
    /// The service asked for a fresh connection (after pairing)
    Restart,
    /// Connection lost or broken
    Lost,
    /// The device was unlinked
    LoggedOut { on_connect: bool, reason: String },
    /// Another client took over the device
    Replaced,
    /// The service refused this client version
    Outdated,
}

/// What a node handler wants the session to do next
pub(crate) enum Flow {
    Continue,
    End(SessionEnd),
}

/// Per-session state owned by the connection task
pub(crate) struct Session {
    pub(crate) keepalive: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

pub(crate) async fn run(
    inner: Arc<ClientInner>,
    mut socket: NoiseSocket,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let end = run_session(&inner, &mut socket, &mut commands, &mut shutdown).await;
        let _ = socket.close().await;
        inner.set_connected(false);
        debug!(target: "tether::client", "session ended: {:?}", end);

        let mut delay = Duration::ZERO;
        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Restart => info!(target: "tether::client", "restart requested, reconnecting"),
            SessionEnd::Lost => {
                inner.dispatcher.dispatch(&Event::Disconnected);
                if !inner.config.auto_reconnect {
                    return;
                }
                delay = inner.config.backoff.delay(0);
            }
            SessionEnd::LoggedOut { on_connect, reason } => {
                let device = inner.device().clone();
                if let Err(e) = inner.store.delete_device(&device) {
                    warn!(target: "tether::client", "failed to delete logged out device: {}", e);
                }
                inner.device().id = None;
                inner.dispatcher.dispatch(&Event::LoggedOut { on_connect, reason });
                return;
            }
            SessionEnd::Replaced => {
                inner.dispatcher.dispatch(&Event::StreamReplaced);
                return;
            }
            SessionEnd::Outdated => {
                inner.dispatcher.dispatch(&Event::ClientOutdated);
                return;
            }
        }

        match reconnect(&inner, delay, &mut shutdown).await {
            Some(new_socket) => {
                socket = new_socket;
                inner.set_connected(true);
            }
            None => return,
        }
    }
}

/// Dial until it works; `None` on shutdown
async fn reconnect(
    inner: &ClientInner,
    mut delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<NoiseSocket> {
    let mut attempt = 0u32;
    loop {
        if !delay.is_zero() {
            debug!(target: "tether::client", "reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }
        }
        if *shutdown.borrow() {
            return None;
        }

        let attempt_result = tokio::select! {
            result = inner.open_socket() => result,
            _ = shutdown.changed() => return None,
        };
        match attempt_result {
            Ok(socket) => {
                info!(target: "tether::client", "reconnected");
                return Some(socket);
            }
            Err(e) => {
                attempt += 1;
                delay = inner.config.backoff.delay(attempt);
                warn!(target: "tether::client", "reconnect attempt {} failed: {}", attempt, e);
            }
        }
    }
}

async fn run_session(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut session = Session { keepalive: None };

    loop {
        tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            received = socket.receive_node() => match received {
                Ok(node) => {
                    if let Flow::End(end) = handlers::handle_node(inner, socket, &mut session, node).await {
                        return end;
                    }
                }
                Err(e) => {
                    debug!(target: "tether::client", "receive failed: {}", e);
                    return SessionEnd::Lost;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(node)) => {
                    if let Err(e) = socket.send_node(&node).await {
                        debug!(target: "tether::client", "send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                Some(Command::Dispatch(event)) => inner.dispatcher.dispatch(&event),
                Some(Command::Reconnect) => {
                    warn!(target: "tether::client", "forcing reconnect");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Shutdown,
            },
        }
    }
}
