//! # Engine.IO for Rust
//!
//! An Engine.IO v4 endpoint pair implemented in Rust: a transport-agnostic,
//! bidirectional, stateful message channel between a client and a server over
//! HTTP long-polling, WebSocket or WebTransport, with in-session transport
//! upgrade. The v3 wire revision is supported for interoperability with
//! legacy peers.

pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod parser;
pub mod server;
pub mod session;
pub mod transport;
pub mod util;

pub use client::ClientSocket;
pub use config::{ClientOptions, ServerOptions};
pub use error::{EngineError, ParseError, ProtocolErrorKind};
pub use packet::{Packet, PacketData, PacketType};
pub use server::Server;
pub use session::{CloseReason, Handshake, ReadyState, SocketEvent};
pub use transport::{Transport, TransportKind, TransportState};

/// The current version of the engine-io crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default HTTP mount path for the engine endpoint
    pub const PATH: &str = "/engine.io";

    /// Default interval between server heartbeat probes
    pub const PING_INTERVAL: Duration = Duration::from_millis(25_000);

    /// Default grace period for the heartbeat answer
    pub const PING_TIMEOUT: Duration = Duration::from_millis(20_000);

    /// Default upper bound on the encoded size of a polling response body
    pub const MAX_PAYLOAD: usize = 1_000_000;

    /// Default upper bound on the size of a polling request body
    pub const MAX_HTTP_BUFFER_SIZE: usize = 1_000_000;

    /// Default time budget for a single upgrade probe
    pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default grace period for an orderly polling shutdown
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Delay applied to non-WebTransport probes so WebTransport can win
    /// the race when both upgrades are offered
    pub const PROBE_DELAY: Duration = Duration::from_millis(200);

    /// Default query parameter carrying the cache-busting timestamp
    pub const TIMESTAMP_PARAM: &str = "t";

    /// Default compression threshold in bytes for per-message deflate
    pub const COMPRESSION_THRESHOLD: usize = 1024;

    /// Capacity of the per-transport and per-session event channels
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}
