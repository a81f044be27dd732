//! Pairing codes and the QR channel.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{PairError, PairResult};
use crate::crypto::{ExchangePublicKey, PublicKey};
use crate::events::{Dispatcher, Event};
use crate::store::Device;

/// How long the first pairing code stays valid
pub const FIRST_QR_TIMEOUT: Duration = Duration::from_secs(60);

/// How long every later pairing code stays valid
pub const NEXT_QR_TIMEOUT: Duration = Duration::from_secs(20);

/// Build the text encoded in a pairing code
///
/// `ref,base64(noise public key),base64(identity key),base64(adv secret)`
pub fn make_qr_code(reference: &str, device: &Device) -> String {
    [
        reference.to_string(),
        STANDARD.encode(device.noise_key.public_key().as_bytes()),
        STANDARD.encode(device.identity.public_key().as_bytes()),
        STANDARD.encode(&device.adv_secret_key[..]),
    ]
    .join(",")
}

/// Fields recovered from a scanned pairing code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodeData {
    pub reference: String,
    pub noise_key: ExchangePublicKey,
    pub identity_key: PublicKey,
    pub adv_secret: [u8; 32],
}

/// Parse the text of a pairing code
pub fn parse_qr_code(code: &str) -> PairResult<QrCodeData> {
    let parts: Vec<&str> = code.split(',').collect();
    let [reference, noise, identity, adv] = parts.as_slice() else {
        return Err(PairError::InvalidQrCode(format!(
            "expected 4 fields, got {}",
            parts.len()
        )));
    };
    if reference.is_empty() {
        return Err(PairError::InvalidQrCode("empty ref".to_string()));
    }

    let decode = |field: &str, name: &str| -> PairResult<[u8; 32]> {
        let bytes = STANDARD
            .decode(field)
            .map_err(|e| PairError::InvalidQrCode(format!("{}: {}", name, e)))?;
        bytes
            .try_into()
            .map_err(|_| PairError::InvalidQrCode(format!("{} is not 32 bytes", name)))
    };

    Ok(QrCodeData {
        reference: reference.to_string(),
        noise_key: ExchangePublicKey(decode(noise, "noise key")?),
        identity_key: PublicKey(decode(identity, "identity key")?),
        adv_secret: decode(adv, "adv secret")?,
    })
}

/// What the QR channel reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    /// Show this code until the timeout passes or the next one arrives
    Code { code: String, timeout: Duration },
    /// Pairing completed
    Success,
    /// Every code expired; the client disconnects
    Timeout,
    /// Pairing failed
    Error(String),
    /// The client logged in without pairing (it was already paired)
    UnexpectedState,
    /// The service refused this client version
    ClientOutdated,
}

impl QrEvent {
    /// Short name, as printed by the demo
    pub fn name(&self) -> &'static str {
        match self {
            QrEvent::Code { .. } => "code",
            QrEvent::Success => "success",
            QrEvent::Timeout => "timeout",
            QrEvent::Error(_) => "error",
            QrEvent::UnexpectedState => "unexpected-state",
            QrEvent::ClientOutdated => "client-outdated",
        }
    }
}

/// Lifetimes of the rotated codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrTimeouts {
    pub first: Duration,
    pub next: Duration,
}

impl Default for QrTimeouts {
    fn default() -> Self {
        QrTimeouts {
            first: FIRST_QR_TIMEOUT,
            next: NEXT_QR_TIMEOUT,
        }
    }
}

/// Codes in display order with their lifetimes
#[derive(Debug, Clone)]
pub struct QrRotation {
    codes: VecDeque<String>,
    timeouts: QrTimeouts,
    shown: usize,
}

impl QrRotation {
    pub fn new(codes: Vec<String>, timeouts: QrTimeouts) -> Self {
        QrRotation {
            codes: codes.into(),
            timeouts,
            shown: 0,
        }
    }
}

impl Iterator for QrRotation {
    type Item = (String, Duration);

    fn next(&mut self) -> Option<Self::Item> {
        let code = self.codes.pop_front()?;
        let timeout = if self.shown == 0 {
            self.timeouts.first
        } else {
            self.timeouts.next
        };
        self.shown += 1;
        Some((code, timeout))
    }
}

/// Turn dispatcher events into a QR channel
///
/// A handler forwards pairing-related events to a task that rotates the
/// codes. The channel closes after its final event; when the codes run out
/// `on_timeout` runs (the client disconnects).
pub(crate) fn spawn_qr_channel<F, Fut>(
    dispatcher: &Arc<Dispatcher>,
    timeouts: QrTimeouts,
    on_timeout: F,
) -> mpsc::Receiver<QrEvent>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handler_id = dispatcher.add_handler(move |event| {
        if matches!(
            event,
            Event::Qr { .. }
                | Event::PairSuccess { .. }
                | Event::PairError { .. }
                | Event::Connected
                | Event::ClientOutdated
        ) {
            let _ = event_tx.send(event.clone());
        }
    });

    let (qr_tx, qr_rx) = mpsc::channel(8);
    let dispatcher = Arc::downgrade(dispatcher);
    tokio::spawn(async move {
        let outcome = run_qr_channel(event_rx, &qr_tx, timeouts).await;
        if let Some(dispatcher) = dispatcher.upgrade() {
            dispatcher.remove_handler(handler_id);
        }
        if outcome == Outcome::Expired {
            info!(target: "tether::pairing", "pairing codes expired, disconnecting");
            on_timeout().await;
        }
        // The channel closes only once the client has reacted
        drop(qr_tx);
    });

    qr_rx
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Finished,
    Expired,
}

enum Wake {
    Event(Event),
    Expired,
    Closed,
}

async fn run_qr_channel(
    mut events: mpsc::UnboundedReceiver<Event>,
    qr_tx: &mpsc::Sender<QrEvent>,
    timeouts: QrTimeouts,
) -> Outcome {
    let mut rotation: Option<QrRotation> = None;
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let wake = tokio::select! {
            event = events.recv() => match event {
                Some(event) => Wake::Event(event),
                None => Wake::Closed,
            },
            _ = expired => Wake::Expired,
        };

        match wake {
            // Handler dropped together with the client
            Wake::Closed => return Outcome::Finished,
            Wake::Expired => {}
            Wake::Event(Event::Qr { codes }) => {
                debug!(target: "tether::pairing", "received {} pairing codes", codes.len());
                rotation = Some(QrRotation::new(codes, timeouts));
            }
            Wake::Event(Event::PairSuccess { .. }) => {
                let _ = qr_tx.send(QrEvent::Success).await;
                return Outcome::Finished;
            }
            Wake::Event(Event::PairError { error, .. }) => {
                let _ = qr_tx.send(QrEvent::Error(error)).await;
                return Outcome::Finished;
            }
            Wake::Event(Event::ClientOutdated) => {
                let _ = qr_tx.send(QrEvent::ClientOutdated).await;
                return Outcome::Finished;
            }
            Wake::Event(Event::Connected) if rotation.is_none() => {
                // Logged in without ever being asked to pair
                let _ = qr_tx.send(QrEvent::UnexpectedState).await;
                return Outcome::Finished;
            }
            Wake::Event(_) => continue,
        }

        // Either new codes arrived or the current one expired
        match rotation.as_mut().and_then(Iterator::next) {
            Some((code, timeout)) => {
                deadline = Some(tokio::time::Instant::now() + timeout);
                if qr_tx.send(QrEvent::Code { code, timeout }).await.is_err() {
                    return Outcome::Finished;
                }
            }
            None => {
                let _ = qr_tx.send(QrEvent::Timeout).await;
                return Outcome::Expired;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn short() -> QrTimeouts {
        QrTimeouts {
            first: Duration::from_millis(60),
            next: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_qr_code_format() {
        let device = Device::generate();
        let code = make_qr_code("ref-1", &device);
        let parts: Vec<&str> = code.split(',').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ref-1");

        let parsed = parse_qr_code(&code).unwrap();
        assert_eq!(parsed.reference, "ref-1");
        assert_eq!(&parsed.noise_key, device.noise_key.public_key());
        assert_eq!(&parsed.identity_key, device.identity.public_key());
        assert_eq!(parsed.adv_secret, *device.adv_secret_key);
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert!(parse_qr_code("only,three,fields").is_err());
        assert!(parse_qr_code(",a,b,c").is_err());
        assert!(parse_qr_code("ref,!!!,AAAA,AAAA").is_err());
        let short_key = STANDARD.encode([1u8; 16]);
        let code = format!("ref,{0},{0},{0}", short_key);
        assert!(matches!(parse_qr_code(&code), Err(PairError::InvalidQrCode(_))));
    }

    #[test]
    fn test_rotation_timeouts() {
        let rotation = QrRotation::new(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            QrTimeouts::default(),
        );
        let items: Vec<_> = rotation.collect();
        assert_eq!(
            items,
            vec![
                ("a".to_string(), Duration::from_secs(60)),
                ("b".to_string(), Duration::from_secs(20)),
                ("c".to_string(), Duration::from_secs(20)),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_rotates_then_times_out() {
        let dispatcher = Arc::new(Dispatcher::new());
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        let mut rx = spawn_qr_channel(&dispatcher, short(), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        dispatcher.dispatch(&Event::Qr {
            codes: vec!["one".to_string(), "two".to_string()],
        });

        assert_eq!(
            rx.recv().await,
            Some(QrEvent::Code {
                code: "one".to_string(),
                timeout: Duration::from_millis(60)
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(QrEvent::Code {
                code: "two".to_string(),
                timeout: Duration::from_millis(20)
            })
        );
        assert_eq!(rx.recv().await, Some(QrEvent::Timeout));
        assert_eq!(rx.recv().await, None);

        assert!(disconnected.load(Ordering::SeqCst));
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_channel_reports_success() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut rx = spawn_qr_channel(&dispatcher, QrTimeouts::default(), || async {});

        dispatcher.dispatch(&Event::Qr {
            codes: vec!["one".to_string()],
        });
        assert!(matches!(rx.recv().await, Some(QrEvent::Code { .. })));

        dispatcher.dispatch(&Event::PairSuccess {
            id: "15550001:1@s.tether.net".parse().unwrap(),
            business_name: String::new(),
            platform: "android".to_string(),
        });
        assert_eq!(rx.recv().await, Some(QrEvent::Success));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_channel_reports_error_and_unexpected_state() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut rx = spawn_qr_channel(&dispatcher, QrTimeouts::default(), || async {});
        dispatcher.dispatch(&Event::PairError {
            id: Default::default(),
            business_name: String::new(),
            platform: String::new(),
            error: "hmac mismatch".to_string(),
        });
        assert_eq!(rx.recv().await, Some(QrEvent::Error("hmac mismatch".to_string())));

        let dispatcher = Arc::new(Dispatcher::new());
        let mut rx = spawn_qr_channel(&dispatcher, QrTimeouts::default(), || async {});
        dispatcher.dispatch(&Event::Connected);
        assert_eq!(rx.recv().await, Some(QrEvent::UnexpectedState));
        assert_eq!(QrEvent::UnexpectedState.name(), "unexpected-state");
    }
}
