//! Tether development service
//!
//! A WebSocket service that pairs, logs in and feeds messages to tether
//! clients. Commands are read from stdin:
//!
//! ```text
//! pair <code>        scan a pairing code with the phone
//! unlink <jid>       log a device out
//! devices            list paired devices
//! <user>: <text>     send a message from <user> to every paired device
//! ```
//!
//! Usage:
//!   tether-service [--port 8765] [--host 0.0.0.0]

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tether::events::MessageContent;
use tether::service::{Contact, Phone, Service, ServiceConfig};

/// Tether development service
#[derive(Parser)]
#[command(name = "tether-service")]
#[command(about = "WebSocket development service for tether clients")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Hex-encoded Noise static secret; random when omitted
    #[arg(long, env = "TETHER_SERVICE_KEY")]
    noise_key: Option<String>,

    /// Phone number of the simulated account
    #[arg(long, default_value = "15550001")]
    account: String,

    /// Refuse clients older than this version
    #[arg(long)]
    min_version: Option<String>,
}

fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).context("noise key is not hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("noise key must be 32 bytes"))
}

/// Run one stdin command
fn handle_command(
    service: &Service,
    phone: &Phone,
    contacts: &mut HashMap<String, Contact>,
    line: &str,
) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    if let Some(code) = line.strip_prefix("pair ") {
        let jid = service.approve(code.trim(), phone)?;
        info!("Approved {}, waiting for the device to confirm", jid);
    } else if let Some(jid) = line.strip_prefix("unlink ") {
        let jid = jid.trim().parse().context("invalid JID")?;
        if !service.unlink(&jid) {
            warn!("{} is not paired", jid);
        }
    } else if line == "devices" {
        for jid in service.registered_devices() {
            let state = if service.is_online(&jid) { "online" } else { "offline" };
            println!("{} ({}, {} queued)", jid, state, service.queued_messages(&jid));
        }
    } else if let Some((user, text)) = line.split_once(':') {
        let user = user.trim();
        let contact = contacts
            .entry(user.to_string())
            .or_insert_with(|| Contact::new(user, user));
        let content = MessageContent::text(text.trim());
        for jid in service.registered_devices() {
            let id = service.deliver(&jid, contact, &content)?;
            info!("Message {} for {}", id, jid);
        }
    } else {
        warn!("Unknown command: {}", line);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tether=info,tether_service=info")),
        )
        .init();

    let args = Args::parse();
    let noise_key = args.noise_key.as_deref().map(parse_key).transpose()?;
    let service = Service::new(ServiceConfig {
        noise_key,
        min_version: args.min_version,
        ..ServiceConfig::default()
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Tether service listening on ws://{}", addr);
    info!("Service key: {}", hex::encode(service.public_key()));

    let listening = service.clone();
    tokio::spawn(async move {
        if let Err(e) = listening.listen(listener).await {
            error!("Listener failed: {}", e);
        }
    });

    let phone = Phone::new(args.account, "Tether Phone");
    info!("Simulated phone is {}", phone.jid());
    let mut contacts = HashMap::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = handle_command(&service, &phone, &mut contacts, &line) {
                        warn!("{:#}", e);
                    }
                }
                None => {
                    // No more commands; keep serving
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    Ok(())
}
