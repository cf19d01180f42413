//! # Engine.IO Interop Client
//!
//! A line-oriented client for poking at any Engine.IO server: connects,
//! prints every session event, and sends each stdin line as a message.
//! Useful for interoperability testing against servers in other languages.
//!
//! ```bash
//! # connect over polling and upgrade to websocket
//! engine-io-client http://localhost:3000
//!
//! # force a single transport, speak the legacy revision
//! engine-io-client http://localhost:3000 --transports websocket --eio3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use engine_io::{client, ClientOptions, SocketEvent, TransportKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Engine.IO interop client for manual testing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL, e.g. http://localhost:3000
    url: String,

    /// Transports to use, in preference order (polling, websocket,
    /// webtransport)
    #[arg(long, value_delimiter = ',', default_values_t = vec!["polling".to_string(), "websocket".to_string()])]
    transports: Vec<String>,

    /// Disable in-session transport upgrades
    #[arg(long)]
    no_upgrade: bool,

    /// Speak the legacy v3 wire revision
    #[arg(long)]
    eio3: bool,

    /// Force base64 encoding for binary payloads
    #[arg(long)]
    force_base64: bool,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let transports: Vec<TransportKind> = args
        .transports
        .iter()
        .map(|name| {
            TransportKind::parse(name)
                .with_context(|| format!("unknown transport: {}", name))
        })
        .collect::<Result<_>>()?;

    let opts = ClientOptions {
        transports,
        upgrade: !args.no_upgrade,
        force_base64: args.force_base64,
        protocol: if args.eio3 { 3 } else { 4 },
        ..ClientOptions::default()
    };

    let socket = client::connect(&args.url, opts)
        .await
        .context("failed to open the session")?;
    let mut events = socket.events().expect("session event stream");

    let writer = socket.clone();
    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            writer.send(line).await;
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("closing");
                socket.close().await;
            }
            event = events.recv() => match event {
                Some(SocketEvent::Open(handshake)) => {
                    info!(
                        "open: sid={} pingInterval={}ms pingTimeout={}ms upgrades={:?}",
                        handshake.sid,
                        handshake.ping_interval,
                        handshake.ping_timeout,
                        handshake.upgrades
                    );
                }
                Some(SocketEvent::Message(data)) => match data.as_text() {
                    Some(text) => info!("message: {}", text),
                    None => info!("binary message: {} bytes", data.len()),
                },
                Some(SocketEvent::Upgrading(kind)) => info!("probing {}", kind),
                Some(SocketEvent::Upgrade(kind)) => info!("upgraded to {}", kind),
                Some(SocketEvent::UpgradeError(reason)) => warn!("upgrade failed: {}", reason),
                Some(SocketEvent::Error(err)) => warn!("error: {}", err),
                Some(SocketEvent::Close { reason, description }) => {
                    info!(
                        "closed: {}{}",
                        reason.as_str(),
                        description
                            .map(|d| format!(" ({})", d))
                            .unwrap_or_default()
                    );
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    input.abort();
    Ok(())
}
