//! End-to-end flows against the development service over in-memory
//! transports.

use std::time::Duration;

use tokio::sync::mpsc;

use tether::client::Backoff;
use tether::events::{format_message_line, MessageContent};
use tether::service::{Contact, Phone, Service, ServiceConfig, ServiceError};
use tether::transport::memory::{self, MemoryDialer};
use tether::{Client, ClientConfig, Container, Event, Jid, QrEvent};

const WAIT: Duration = Duration::from_secs(5);

fn client_config(service: &Service) -> ClientConfig {
    ClientConfig {
        server_key: Some(service.public_key()),
        backoff: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        },
        ..ClientConfig::default()
    }
}

fn start_service(config: ServiceConfig) -> (Service, MemoryDialer) {
    let service = Service::new(config);
    let (dialer, listener) = memory::listener();
    service.spawn_memory(listener);
    (service, dialer)
}

fn record_events(client: &Client) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.add_event_handler(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<Event>, mut wanted: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached")
}

/// Pair a fresh device; returns the logged-in client
async fn pair(
    service: &Service,
    dialer: &MemoryDialer,
    store: &Container,
    phone: &Phone,
) -> (Client, Jid, mpsc::UnboundedReceiver<Event>) {
    let device = store.get_first_device().unwrap();
    assert!(device.id.is_none());
    let client = Client::with_dialer(
        device,
        store.clone(),
        Box::new(dialer.clone()),
        client_config(service),
    );
    let mut events = record_events(&client);

    let mut qr = client.get_qr_channel().await.unwrap();
    client.connect().await.unwrap();

    let code = match tokio::time::timeout(WAIT, qr.recv()).await.unwrap() {
        Some(QrEvent::Code { code, timeout }) => {
            assert_eq!(timeout, Duration::from_secs(60));
            code
        }
        other => panic!("expected a code, got {:?}", other),
    };
    assert_eq!(service.pending_refs().len(), 6);

    let jid = service.approve(&code, phone).unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, qr.recv()).await.unwrap(),
        Some(QrEvent::Success)
    );
    match wait_for(&mut events, |e| matches!(e, Event::PairSuccess { .. })).await {
        Event::PairSuccess { id, platform, .. } => {
            assert_eq!(id, jid);
            assert_eq!(platform, "android");
        }
        _ => unreachable!(),
    }

    // The service restarts the stream and the device logs in
    wait_for(&mut events, |e| *e == Event::Connected).await;
    assert!(client.is_logged_in());
    (client, jid, events)
}

#[tokio::test]
async fn test_pair_restart_login_and_receive() {
    let (service, dialer) = start_service(ServiceConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.db");
    let phone = Phone::new("15550001", "Alice");
    let mut bob = Contact::new("15550002", "Bob");

    let store = Container::open(&path).unwrap();
    let (client, jid, mut events) = pair(&service, &dialer, &store, &phone).await;
    assert_eq!(client.store_id(), Some(jid.clone()));
    assert_eq!(jid.to_string(), "15550001:1@s.tether.net");
    assert_eq!(service.registered_devices(), vec![jid.clone()]);
    assert!(service.pending_refs().is_empty());
    client.ping().await.unwrap();

    service
        .deliver(&jid, &mut bob, &MessageContent::text("hello"))
        .unwrap();
    let event = wait_for(&mut events, |e| matches!(e, Event::Message(_))).await;
    assert_eq!(
        format_message_line(&event).as_deref(),
        Some("Received a message from 15550002@s.tether.net: hello")
    );
    if let Event::Message(message) = &event {
        assert_eq!(message.info.push_name, "Bob");
        assert_eq!(message.info.chat, *bob.jid());
    }

    client.disconnect().await;
    assert!(!client.is_connected());
    drop(client);
    wait_until(|| !service.is_online(&jid)).await;

    // Queued while the device is away
    service
        .deliver(&jid, &mut bob, &MessageContent::text("while you were away"))
        .unwrap();
    assert_eq!(service.queued_messages(&jid), 1);
    drop(store);

    let store = Container::open(&path).unwrap();
    let device = store.get_first_device().unwrap();
    assert_eq!(device.id.as_ref(), Some(&jid));
    assert_eq!(device.push_name, "Alice");

    let client = Client::with_dialer(device, store, Box::new(dialer.clone()), client_config(&service));
    let mut events = record_events(&client);
    assert!(client.get_qr_channel().await.is_err());
    client.connect().await.unwrap();
    wait_for(&mut events, |e| *e == Event::Connected).await;

    let event = wait_for(&mut events, |e| matches!(e, Event::Message(_))).await;
    assert_eq!(
        format_message_line(&event).as_deref(),
        Some("Received a message from 15550002@s.tether.net: while you were away")
    );
    assert_eq!(service.queued_messages(&jid), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_unlink_logs_out_and_forgets_device() {
    let (service, dialer) = start_service(ServiceConfig::default());
    let store = Container::open_in_memory().unwrap();
    let phone = Phone::new("15550001", "Alice");
    let (client, jid, mut events) = pair(&service, &dialer, &store, &phone).await;

    assert!(service.unlink(&jid));
    match wait_for(&mut events, |e| matches!(e, Event::LoggedOut { .. })).await {
        Event::LoggedOut { on_connect, reason } => {
            assert!(!on_connect);
            assert_eq!(reason, "401");
        }
        _ => unreachable!(),
    }

    wait_until(|| !client.is_connected()).await;
    assert!(client.store_id().is_none());
    assert!(store.get_all_devices().unwrap().is_empty());
}

#[tokio::test]
async fn test_login_refused_for_unknown_device() {
    let (service, dialer) = start_service(ServiceConfig::default());
    let store = Container::open_in_memory().unwrap();
    let mut device = store.get_first_device().unwrap();
    device.id = Some("15559999:3@s.tether.net".parse().unwrap());
    store.save_device(&device).unwrap();

    let client = Client::with_dialer(device, store.clone(), Box::new(dialer), client_config(&service));
    let mut events = record_events(&client);
    client.connect().await.unwrap();

    match wait_for(&mut events, |e| matches!(e, Event::LoggedOut { .. })).await {
        Event::LoggedOut { on_connect, .. } => assert!(on_connect),
        _ => unreachable!(),
    }
    wait_until(|| store.get_all_devices().unwrap().is_empty()).await;
}

#[tokio::test]
async fn test_second_login_replaces_first() {
    let (service, dialer) = start_service(ServiceConfig::default());
    let store = Container::open_in_memory().unwrap();
    let phone = Phone::new("15550001", "Alice");
    let (first, jid, mut first_events) = pair(&service, &dialer, &store, &phone).await;

    let device = store.get_device(&jid).unwrap().unwrap();
    let second = Client::with_dialer(device, store.clone(), Box::new(dialer.clone()), client_config(&service));
    let mut second_events = record_events(&second);
    second.connect().await.unwrap();

    wait_for(&mut second_events, |e| *e == Event::Connected).await;
    wait_for(&mut first_events, |e| *e == Event::StreamReplaced).await;
    wait_until(|| !first.is_connected()).await;
    assert!(second.is_connected());
    assert!(service.is_online(&jid));

    second.disconnect().await;
}

#[tokio::test]
async fn test_outdated_client_is_told_so() {
    let (service, dialer) = start_service(ServiceConfig {
        min_version: Some("999.0.0".to_string()),
        ..ServiceConfig::default()
    });
    let store = Container::open_in_memory().unwrap();
    let client = Client::with_dialer(
        store.get_first_device().unwrap(),
        store,
        Box::new(dialer),
        client_config(&service),
    );
    let mut qr = client.get_qr_channel().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        tokio::time::timeout(WAIT, qr.recv()).await.unwrap(),
        Some(QrEvent::ClientOutdated)
    );
    wait_until(|| !client.is_connected()).await;
}

#[tokio::test]
async fn test_pinned_key_mismatch_fails_connect() {
    let (_service, dialer) = start_service(ServiceConfig::default());
    let store = Container::open_in_memory().unwrap();
    let client = Client::with_dialer(
        store.get_first_device().unwrap(),
        store,
        Box::new(dialer),
        ClientConfig {
            server_key: Some([7; 32]),
            ..ClientConfig::default()
        },
    );
    assert!(client.connect().await.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_qr_timeout_disconnects() {
    let (service, dialer) = start_service(ServiceConfig {
        refs_per_registration: 2,
        ..ServiceConfig::default()
    });
    let store = Container::open_in_memory().unwrap();
    let client = Client::with_dialer(
        store.get_first_device().unwrap(),
        store,
        Box::new(dialer),
        ClientConfig {
            qr_timeouts: tether::pairing::QrTimeouts {
                first: Duration::from_millis(30),
                next: Duration::from_millis(10),
            },
            ..client_config(&service)
        },
    );
    let mut qr = client.get_qr_channel().await.unwrap();
    client.connect().await.unwrap();

    let mut codes = 0;
    loop {
        match tokio::time::timeout(WAIT, qr.recv()).await.unwrap() {
            Some(QrEvent::Code { .. }) => codes += 1,
            Some(QrEvent::Timeout) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(codes, 2);
    assert_eq!(tokio::time::timeout(WAIT, qr.recv()).await.unwrap(), None);
    assert!(!client.is_connected());
    wait_until(|| service.pending_refs().is_empty()).await;
}

#[tokio::test]
async fn test_second_device_needs_the_same_account() {
    let (service, dialer) = start_service(ServiceConfig::default());
    let phone = Phone::new("15550001", "Alice");
    let first_store = Container::open_in_memory().unwrap();
    let (first, first_jid, _) = pair(&service, &dialer, &first_store, &phone).await;

    let store = Container::open_in_memory().unwrap();
    let client = Client::with_dialer(
        store.get_first_device().unwrap(),
        store.clone(),
        Box::new(dialer.clone()),
        client_config(&service),
    );
    let mut qr = client.get_qr_channel().await.unwrap();
    client.connect().await.unwrap();
    let code = match tokio::time::timeout(WAIT, qr.recv()).await.unwrap() {
        Some(QrEvent::Code { code, .. }) => code,
        other => panic!("expected a code, got {:?}", other),
    };

    // Same number, different account key
    let impostor = Phone::new("15550001", "Mallory");
    assert!(matches!(
        service.approve(&code, &impostor),
        Err(ServiceError::AccountMismatch(_))
    ));
    assert!(service.pending_refs().contains(&code.split(',').next().unwrap().to_string()));

    let jid = service.approve(&code, &phone).unwrap();
    assert_eq!(jid.to_string(), "15550001:2@s.tether.net");
    assert_eq!(
        tokio::time::timeout(WAIT, qr.recv()).await.unwrap(),
        Some(QrEvent::Success)
    );
    wait_until(|| service.is_online(&jid)).await;
    assert!(service.is_online(&first_jid));

    client.disconnect().await;
    first.disconnect().await;
}
