//! # Session Vocabulary
//!
//! Types shared by the server-side and client-side session state machines:
//! the session lifecycle states, the close reasons surfaced to the
//! application, the handshake configuration exchanged in the first packet,
//! and the event stream a session exposes.

use crate::packet::PacketData;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// The state is monotonic along `Opening → Open → Closing → Closed`;
/// a failed handshake jumps straight from `Opening` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in flight
    Opening,
    /// Session established; packets flow
    Open,
    /// Orderly shutdown in progress, waiting for pending writes
    Closing,
    /// Terminal state
    Closed,
}

impl ReadyState {
    /// Human-readable name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            ReadyState::Opening => "opening",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        }
    }
}

/// Why a session closed, as surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport reported an orderly close
    TransportClose,
    /// The transport failed
    TransportError,
    /// The heartbeat window elapsed without an answer
    PingTimeout,
    /// A packet failed to decode
    ParseError,
    /// The local application closed the session
    ForcedClose,
    /// The remote server instructed the client to close
    ServerClose,
}

impl CloseReason {
    /// Stable reason string carried by the `close` event
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError => "transport error",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ParseError => "parse error",
            CloseReason::ForcedClose => "forced close",
            CloseReason::ServerClose => "server close",
        }
    }
}

/// The server's one-shot session configuration, sent as the payload of the
/// first `open` packet and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Unique session identifier assigned by the server
    pub sid: String,
    /// Transports the server is willing to upgrade this session to
    pub upgrades: Vec<String>,
    /// Interval between heartbeat probes, in milliseconds
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    /// Grace period for the heartbeat answer, in milliseconds
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
    /// Upper bound on the encoded size of a polling response body, in bytes
    #[serde(rename = "maxPayload")]
    pub max_payload: u64,
}

/// Events a session emits to the application.
///
/// Events are serialized per session: a single consumer observes them in
/// the order the session produced them.
#[derive(Debug)]
pub enum SocketEvent {
    /// The session reached the `open` state. On the client this carries the
    /// handshake received from the server.
    Open(Handshake),
    /// An application message arrived
    Message(PacketData),
    /// A heartbeat exchange completed
    Heartbeat,
    /// The write buffer is being handed to the transport
    Flush,
    /// All previously flushed packets have left through the transport
    Drain,
    /// An upgrade probe succeeded and the handover is starting
    Upgrading(TransportKind),
    /// The session now runs on the upgraded transport
    Upgrade(TransportKind),
    /// An upgrade probe failed; the session continues on its transport
    UpgradeError(String),
    /// A non-fatal error was observed
    Error(String),
    /// Terminal event
    Close {
        reason: CloseReason,
        description: Option<String>,
    },
}

/// Local send acknowledgement: invoked once the packets enqueued alongside
/// it have been handed to the transport. This is not a remote receipt.
pub type SendCallback = Box<dyn FnOnce() + Send + 'static>;
