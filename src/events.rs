//! Events reported to application handlers
//!
//! The client turns protocol traffic into [`Event`]s and hands each one to
//! every registered handler, in registration order, from its connection
//! task. A handler that panics is logged and skipped; the remaining
//! handlers still see the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::Jid;

/// Quoted or linked text message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
}

/// Decrypted message body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text: Option<ExtendedText>,
}

impl MessageContent {
    /// Plain text message
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent {
            conversation: Some(text.into()),
            extended_text: None,
        }
    }

    /// Text of the message, or `""` for messages without text
    pub fn get_conversation(&self) -> &str {
        self.conversation
            .as_deref()
            .or_else(|| self.extended_text.as_ref().map(|e| e.text.as_str()))
            .unwrap_or("")
    }
}

/// Metadata of a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: String,
    /// Device that sent the message
    pub sender: Jid,
    /// Conversation the message belongs to
    pub chat: Jid,
    pub push_name: String,
    pub timestamp: SystemTime,
}

/// A decrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub info: MessageInfo,
    pub message: MessageContent,
}

/// Everything a handler can observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// New pairing codes; each replaces the previous one
    Qr { codes: Vec<String> },
    /// The phone approved this device
    PairSuccess {
        id: Jid,
        business_name: String,
        platform: String,
    },
    /// The pairing result could not be accepted
    PairError {
        id: Jid,
        business_name: String,
        platform: String,
        error: String,
    },
    /// Logged in and ready
    Connected,
    /// Connection dropped
    Disconnected,
    /// The device was unlinked; it has been removed from the store
    LoggedOut { on_connect: bool, reason: String },
    /// Another client connected with this device
    StreamReplaced,
    /// The service refused this client version
    ClientOutdated,
    /// Unhandled stream error
    StreamError { code: String },
    /// Keepalive pings are failing
    KeepAliveTimeout {
        error_count: u32,
        last_success: Option<SystemTime>,
    },
    /// Keepalive pings work again
    KeepAliveRestored,
    /// Incoming message
    Message(MessageEvent),
    /// Incoming message that could not be decrypted
    UndecryptableMessage { info: MessageInfo, reason: String },
}

/// The demo's console line for an event, `None` for anything but messages
pub fn format_message_line(event: &Event) -> Option<String> {
    match event {
        Event::Message(message) => Some(format!(
            "Received a message from {}: {}",
            message.info.sender,
            message.message.get_conversation()
        )),
        _ => None,
    }
}

/// Returned by [`Dispatcher::add_handler`], used to remove the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Ordered list of event handlers
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it runs after every handler registered before it
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler; `false` if it was not registered
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every handler
    pub fn dispatch(&self, event: &Event) {
        // Snapshot so handlers may add or remove handlers while running
        let handlers: Vec<(HandlerId, Handler)> = self.read().clone();
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(target: "tether::events", "event handler {:?} panicked", id);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(HandlerId, Handler)>> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(HandlerId, Handler)>> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Seconds since the epoch to a timestamp
pub(crate) fn timestamp_from_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_USER_SERVER;
    use std::sync::Mutex;

    fn message(text: Option<&str>) -> Event {
        let sender = Jid::new("15550002", DEFAULT_USER_SERVER);
        Event::Message(MessageEvent {
            info: MessageInfo {
                id: "ABC".to_string(),
                sender: sender.clone(),
                chat: sender,
                push_name: "Bob".to_string(),
                timestamp: timestamp_from_secs(1_700_000_000),
            },
            message: MessageContent {
                conversation: text.map(str::to_string),
                extended_text: None,
            },
        })
    }

    #[test]
    fn test_message_line_only_for_messages() {
        assert_eq!(
            format_message_line(&message(Some("hi there"))).as_deref(),
            Some("Received a message from 15550002@s.tether.net: hi there")
        );
        assert_eq!(
            format_message_line(&message(None)).as_deref(),
            Some("Received a message from 15550002@s.tether.net: ")
        );
        assert_eq!(format_message_line(&Event::Connected), None);
        assert_eq!(format_message_line(&Event::Qr { codes: vec![] }), None);
    }

    #[test]
    fn test_extended_text_fallback() {
        let content = MessageContent {
            conversation: None,
            extended_text: Some(ExtendedText {
                text: "see https://tether.net".to_string(),
                matched_text: Some("https://tether.net".to_string()),
            }),
        };
        assert_eq!(content.get_conversation(), "see https://tether.net");
        assert_eq!(MessageContent::default().get_conversation(), "");
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            dispatcher.add_handler(move |_| seen.lock().unwrap().push(name));
        }
        dispatcher.dispatch(&Event::Connected);

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_events_arrive_in_dispatch_order() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.add_handler(move |event| sink.lock().unwrap().push(event.clone()));

        dispatcher.dispatch(&Event::Connected);
        dispatcher.dispatch(&message(Some("x")));
        dispatcher.dispatch(&Event::Disconnected);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Event::Connected);
        assert!(matches!(seen[1], Event::Message(_)));
        assert_eq!(seen[2], Event::Disconnected);
    }

    #[test]
    fn test_remove_handler() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = dispatcher.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&Event::Connected);
        assert!(dispatcher.remove_handler(id));
        assert!(!dispatcher.remove_handler(id));
        dispatcher.dispatch(&Event::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        let reached = Arc::new(AtomicU64::new(0));

        dispatcher.add_handler(|_| panic!("handler bug"));
        let counter = reached.clone();
        dispatcher.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&Event::Connected);
        dispatcher.dispatch(&Event::Disconnected);
        assert_eq!(reached.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.add_handler(move |_| {
            inner.add_handler(|_| {});
        });

        dispatcher.dispatch(&Event::Connected);
        assert_eq!(dispatcher.len(), 2);
    }
}
