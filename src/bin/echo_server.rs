//! # Engine.IO Echo Server
//!
//! A small demonstration binary: serves the engine endpoint and echoes
//! every received message back to its session. Useful for interoperability
//! testing against other Engine.IO implementations.
//!
//! ```bash
//! # serve on the default address with debug logging
//! engine-io-echo -v
//!
//! # custom bind address and mount path
//! engine-io-echo --bind 0.0.0.0:8080 --path /engine.io
//! ```

use anyhow::Result;
use clap::Parser;
use engine_io::server::{ServerEvent, Socket};
use engine_io::{Server, ServerOptions, SocketEvent, TransportKind};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Engine.IO echo server for interoperability testing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP endpoint to
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Mount path of the engine endpoint
    #[arg(long, default_value = "/engine.io")]
    path: String,

    /// Disable in-session transport upgrades
    #[arg(long)]
    no_upgrades: bool,

    /// Accept peers speaking the legacy v3 wire revision
    #[arg(long)]
    allow_eio3: bool,

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
        .compact()
        .init();

    let opts = ServerOptions {
        path: args.path.clone(),
        allow_upgrades: !args.no_upgrades,
        allow_eio3: args.allow_eio3,
        transports: vec![TransportKind::Polling, TransportKind::Websocket],
        ..ServerOptions::default()
    };

    let server = Server::new(opts);
    let addr = server.serve(args.bind).await?;
    info!("echo server ready on http://{}{}/", addr, args.path);

    let mut events = server.events().expect("server event stream");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                server.close().await;
                break;
            }
            event = events.recv() => match event {
                Some(ServerEvent::Connection(socket)) => {
                    info!(
                        "session {} connected over {}",
                        socket.sid(),
                        socket
                            .transport_kind()
                            .map(|k| k.as_str())
                            .unwrap_or("unknown")
                    );
                    tokio::spawn(echo(socket));
                }
                Some(ServerEvent::ConnectionError { kind, method, path }) => {
                    warn!(
                        "rejected {} {}: {} (code {})",
                        method,
                        path,
                        kind.message(),
                        kind.code()
                    );
                }
                None => break,
            }
        }
    }

    Ok(())
}

/// Echo every message of one session back to it
async fn echo(socket: Socket) {
    let Some(mut events) = socket.events() else {
        return;
    };
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Message(data) => {
                socket.send(data).await;
            }
            SocketEvent::Upgrade(kind) => {
                info!("session {} upgraded to {}", socket.sid(), kind);
            }
            SocketEvent::Close { reason, .. } => {
                info!("session {} closed: {}", socket.sid(), reason.as_str());
                break;
            }
            _ => {}
        }
    }
}
