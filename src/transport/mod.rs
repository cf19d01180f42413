//! # Transport Abstraction
//!
//! This module provides the unified abstraction layer over the three
//! physical connection types the engine can run on, enabling the session
//! state machine to stay transport-agnostic.
//!
//! ## Key Design Principles
//!
//! - **Unified Interface**: every transport implements the same
//!   [`Transport`] trait and is held by its session as a trait object
//! - **Events, not callbacks**: transports signal their session through an
//!   event channel; only the owning session mutates session state
//! - **Async-First**: built on Tokio for non-blocking I/O
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌──────────────────────┐
//! │     Session     │───▶│    Transport     │───▶│       Concrete       │
//! │  state machine  │    │      Trait       │    │    implementation    │
//! │                 │◀───│  (abstraction)   │◀───│ (polling / ws / wt)  │
//! └─────────────────┘    └──────────────────┘    └──────────────────────┘
//!          ▲                     events                    │
//!          └───────────────── mpsc channel ────────────────┘
//! ```
//!
//! ## Supported Transports
//!
//! - **Polling**: HTTP long-polling with disjoint GET (download) and POST
//!   (upload) half-connections
//! - **WebSocket**: one packet per frame over a persistent socket
//! - **WebTransport**: one bidirectional stream with internal message
//!   framing; the QUIC plumbing is supplied by the embedding layer

pub mod framing;

use crate::error::{EngineError, ProtocolErrorKind};
use crate::packet::Packet;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Identifies a concrete transport on the wire and in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling
    Polling,
    /// WebSocket
    Websocket,
    /// WebTransport
    Webtransport,
}

impl TransportKind {
    /// Wire name used in the `transport` query parameter
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::Websocket => "websocket",
            TransportKind::Webtransport => "webtransport",
        }
    }

    /// Parse a `transport` query parameter value
    pub fn parse(name: &str) -> Option<TransportKind> {
        match name {
            "polling" => Some(TransportKind::Polling),
            "websocket" => Some(TransportKind::Websocket),
            "webtransport" => Some(TransportKind::Webtransport),
            _ => None,
        }
    }

    /// Transports a session on this transport may upgrade to
    pub fn upgrades_to(self) -> &'static [TransportKind] {
        match self {
            TransportKind::Polling => {
                &[TransportKind::Websocket, TransportKind::Webtransport]
            }
            TransportKind::Websocket => &[],
            TransportKind::Webtransport => &[],
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transport.
///
/// ```text
/// opening ──success──▶ open ──pause()──▶ pausing ──▶ paused
///    │                   │                              │
///    └──failure──▶ closed ◀──────── close() ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Connection attempt in flight
    Opening,
    /// Ready for traffic
    Open,
    /// Quiescing in-flight work before an upgrade handover
    Pausing,
    /// Quiesced; no further packets are produced or written
    Paused,
    /// Terminal state
    Closed,
}

impl TransportState {
    /// Human-readable name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::Opening => "opening",
            TransportState::Open => "open",
            TransportState::Pausing => "pausing",
            TransportState::Paused => "paused",
            TransportState::Closed => "closed",
        }
    }
}

/// Events a transport emits to its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and packets may flow
    Open,
    /// A packet arrived from the wire
    Packet(Packet),
    /// The previous write completed; the transport is writable again
    Drain,
    /// The write half became available (a fresh poll cycle on the server)
    Ready,
    /// The transport failed; a `Close` event follows
    Error(EngineError),
    /// The transport is gone
    Close,
}

/// Sender half of a transport's event channel
pub type TransportEventTx = mpsc::Sender<TransportEvent>;

/// Receiver half of a transport's event channel
pub type TransportEventRx = mpsc::Receiver<TransportEvent>;

/// Create the event channel a transport hands to its session
pub fn event_channel() -> (TransportEventTx, TransportEventRx) {
    mpsc::channel(crate::defaults::EVENT_CHANNEL_CAPACITY)
}

/// A bidirectional byte stream usable as a WebTransport session stream.
///
/// The QUIC/TLS plumbing lives outside the engine; anything that reads and
/// writes asynchronously can carry the transport.
pub trait BidiStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BidiStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An HTTP request routed to a transport, reduced to the parts the engine
/// consumes. The embedding HTTP server reads the body up front.
#[derive(Debug)]
pub struct RawRequest {
    /// Request method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
    /// Peer address, when the embedding server knows it
    pub remote_addr: Option<SocketAddr>,
}

impl RawRequest {
    /// Look up a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Look up a header as a string, if present and valid
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// An HTTP response produced by a transport or the dispatcher.
#[derive(Debug)]
pub struct RawResponse {
    /// Response status
    pub status: StatusCode,
    /// Value of the `Content-Type` header
    pub content_type: &'static str,
    /// Response body
    pub body: Bytes,
    /// Additional headers (cookies and the like)
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl RawResponse {
    /// A 200 response carrying an encoded payload body
    pub fn payload(body: Bytes, binary: bool) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: crate::parser::payload_content_type(binary),
            body,
            headers: Vec::new(),
        }
    }

    /// The fixed acknowledgement for a data upload. The `text/html` content
    /// type is historical and load-bearing: legacy user agents prompt a
    /// download for other types.
    pub fn post_ack() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/html",
            body: Bytes::from_static(b"ok"),
            headers: Vec::new(),
        }
    }

    /// A protocol error response: 400 (or 403) with the stable JSON body
    pub fn protocol_error(kind: ProtocolErrorKind) -> Self {
        Self {
            status: StatusCode::from_u16(kind.status()).expect("static status"),
            content_type: "application/json",
            body: Bytes::from(kind.to_json()),
            headers: Vec::new(),
        }
    }

    /// Attach an extra header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

/// Generic transport interface.
///
/// All methods take `&self`; implementations use interior mutability and
/// may be driven concurrently by their session and by the dispatcher. A
/// transport never touches session state directly: it reports through its
/// event channel and the session reacts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identify the concrete transport
    fn kind(&self) -> TransportKind;

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// True when a `send` may be issued right now
    fn writable(&self) -> bool;

    /// True when the wire can carry raw binary payloads
    fn supports_binary(&self) -> bool;

    /// True when the transport writes one frame per packet; false when it
    /// batches packets into payload bodies (polling)
    fn supports_framing(&self) -> bool;

    /// Establish the connection (client side). Server-side transports are
    /// created around an already-established connection and ignore this.
    async fn open(&self) {}

    /// Attach the session id to subsequent requests (client side). Set on
    /// handshake receipt; server-side transports ignore this.
    fn set_sid(&self, sid: &str) {
        let _ = sid;
    }

    /// Write a batch of packets.
    ///
    /// Must only be called while the transport is open and writable. The
    /// transport clears `writable`, performs the write, emits `Drain` and
    /// restores `writable` (for polling, writability returns with the next
    /// poll cycle instead).
    async fn send(&self, packets: Vec<Packet>);

    /// Quiesce the transport before an upgrade handover: wait for the
    /// in-flight poll and any pending write to complete, then stop
    /// producing. Resolves once paused; resolves immediately when already
    /// quiet. Framed transports have nothing to quiesce.
    async fn pause(&self) {}

    /// Close the transport, emitting `Close` on the event channel.
    async fn close(&self);

    /// Drop the transport without ceremony after an upgrade: pending reads
    /// are discarded and no `Close` event is emitted. Defaults to `close`.
    async fn discard(&self) {
        self.close().await;
    }

    /// Route an HTTP request to this transport (polling only).
    async fn handle_request(&self, request: RawRequest) -> RawResponse {
        let _ = request;
        RawResponse::protocol_error(ProtocolErrorKind::BadRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            TransportKind::Polling,
            TransportKind::Websocket,
            TransportKind::Webtransport,
        ] {
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::parse("carrier-pigeon"), None);
    }

    #[test]
    fn polling_upgrades_to_framed_transports() {
        let upgrades = TransportKind::Polling.upgrades_to();
        assert!(upgrades.contains(&TransportKind::Websocket));
        assert!(upgrades.contains(&TransportKind::Webtransport));
        assert!(TransportKind::Websocket.upgrades_to().is_empty());
    }

    #[test]
    fn post_ack_is_historical_text_html() {
        let ack = RawResponse::post_ack();
        assert_eq!(ack.status, StatusCode::OK);
        assert_eq!(ack.content_type, "text/html");
        assert_eq!(&ack.body[..], b"ok");
    }

    #[test]
    fn protocol_error_response_shape() {
        let resp = RawResponse::protocol_error(ProtocolErrorKind::UnknownSid);
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(&resp.body[..], br#"{"code":1,"message":"Session ID unknown"}"#);

        let resp = RawResponse::protocol_error(ProtocolErrorKind::Forbidden);
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
    }
}
