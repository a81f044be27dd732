//! Tether demo client
//!
//! Links this machine as a device of an account, then prints every
//! incoming text message until interrupted.
//!
//! Usage:
//!   tether [--config FILE] [--db tether.db] [--server ws://127.0.0.1:8765]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use qrcode::render::unicode;
use qrcode::QrCode;
use tracing::{error, info, warn};

use tether::events::format_message_line;
use tether::{Client, Config, Container, QrEvent};

/// Tether: link a device and print incoming messages
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/tether/config.toml)
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Session store file
    #[arg(long, env = "TETHER_DB")]
    db: Option<PathBuf>,

    /// Service WebSocket URL
    #[arg(long, env = "TETHER_SERVER")]
    server: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_code(code: &str) {
    println!("Scan the QR code with your phone:");
    println!("{}", code);
    match QrCode::new(code.as_bytes()) {
        Ok(qr) => println!("{}", qr.render::<unicode::Dense1x2>().quiet_zone(true).build()),
        Err(e) => warn!("Could not render QR code: {}", e),
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    let store = Container::open(&config.database).context("Failed to create database")?;
    let device = store.get_first_device().context("Failed to get device")?;
    let client_config = config.client_config()?;
    let client = Client::new(device, store, &config.server_url, client_config);

    client.add_event_handler(|event| {
        if let Some(line) = format_message_line(event) {
            println!("{}", line);
        }
    });

    if client.store_id().is_none() {
        let mut qr = client.get_qr_channel().await?;
        client.connect().await.context("Failed to connect")?;

        while let Some(event) = qr.recv().await {
            match event {
                QrEvent::Code { code, .. } => print_code(&code),
                QrEvent::Success => {
                    println!("Logged in!");
                    break;
                }
                other => bail!("Pairing ended: {}", other.name()),
            }
        }
    } else {
        client.connect().await.context("Failed to connect")?;
    }

    wait_for_signal().await?;
    client.disconnect().await;
    info!("Client disconnected.");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
