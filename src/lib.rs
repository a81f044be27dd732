//! # Tether
//!
//! Multi-device pairing and an encrypted message-event pipeline.
//!
//! A [`Client`] links a new device to an account by showing pairing codes
//! that the account's phone scans, keeps the device's keys and sessions in
//! a SQLite [`Container`], and turns encrypted traffic from the service into
//! [`Event`]s for registered handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::{Client, ClientConfig, Container, Event};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Container::open("tether.db")?;
//! let device = store.get_first_device()?;
//! let client = Client::new(device, store, "ws://127.0.0.1:8765", ClientConfig::default());
//!
//! client.add_event_handler(|event| {
//!     if let Some(line) = tether::events::format_message_line(event) {
//!         println!("{}", line);
//!     }
//! });
//!
//! if client.store_id().is_none() {
//!     let mut qr = client.get_qr_channel().await?;
//!     client.connect().await?;
//!     while let Some(event) = qr.recv().await {
//!         println!("{:?}", event);
//!     }
//! } else {
//!     client.connect().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   CLIENT                    │
//! │  connect | reconnect | keepalive | routing  │
//! └──────┬──────────────┬───────────────┬───────┘
//!        │              │               │
//! ┌──────▼─────┐ ┌──────▼──────┐ ┌──────▼──────┐
//! │  PAIRING   │ │   SESSION   │ │   EVENTS    │
//! │ codes, ADV │ │ pkmsg / msg │ │  handlers   │
//! └──────┬─────┘ └──────┬──────┘ └─────────────┘
//!        │              │
//! ┌──────▼──────────────▼───────────────────────┐
//! │         STORE (SQLite)  |  CRYPTO           │
//! └─────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────┐
//! │  TRANSPORT: frames | Noise XX | WebSocket   │
//! │  BINARY: token-compressed nodes             │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod binary;
pub mod client;
pub mod config;
pub mod crypto;
pub mod events;
pub mod pairing;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use client::{Client, ClientConfig, ClientError, ClientResult};
pub use config::Config;
pub use crypto::{CryptoError, CryptoResult, Identity, PublicKey, SignatureBytes};
pub use events::{Event, MessageEvent};
pub use pairing::QrEvent;
pub use store::{Container, Device};
pub use types::Jid;
