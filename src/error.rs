//! # Error Types
//!
//! This module defines the error taxonomy of the engine:
//!
//! - **Protocol errors**: request-level violations surfaced to HTTP with a
//!   JSON body and a stable numeric code
//! - **Transport errors**: faults of the underlying connection, wrapping a
//!   cause and carrying a short human-readable tag
//! - **Parser errors**: wire decode failures
//!
//! Errors are values; none of the library paths panic on malformed input.

use std::fmt;
use thiserror::Error;

/// Convenience result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request-level protocol violations with stable numeric codes.
///
/// The codes and messages are part of the wire contract: HTTP error
/// responses carry them as `{"code": <n>, "message": "<msg>"}` and peers in
/// other languages match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The `transport` query parameter is missing or names a transport that
    /// is not enabled on this server
    UnknownTransport,
    /// The `sid` query parameter does not map to a live session
    UnknownSid,
    /// A handshake request used a method other than GET
    BadHandshakeMethod,
    /// Malformed request: invalid Origin characters, request overlap,
    /// invalid encoding, or a middleware rejection
    BadRequest,
    /// The request-gating callback rejected the request
    Forbidden,
    /// The `EIO` query parameter names a protocol revision this server does
    /// not speak
    UnsupportedProtocolVersion,
}

impl ProtocolErrorKind {
    /// Stable numeric code carried in the JSON error body
    pub fn code(self) -> u8 {
        match self {
            ProtocolErrorKind::UnknownTransport => 0,
            ProtocolErrorKind::UnknownSid => 1,
            ProtocolErrorKind::BadHandshakeMethod => 2,
            ProtocolErrorKind::BadRequest => 3,
            ProtocolErrorKind::Forbidden => 4,
            ProtocolErrorKind::UnsupportedProtocolVersion => 5,
        }
    }

    /// Stable textual message carried in the JSON error body
    pub fn message(self) -> &'static str {
        match self {
            ProtocolErrorKind::UnknownTransport => "Transport unknown",
            ProtocolErrorKind::UnknownSid => "Session ID unknown",
            ProtocolErrorKind::BadHandshakeMethod => "Bad handshake method",
            ProtocolErrorKind::BadRequest => "Bad request",
            ProtocolErrorKind::Forbidden => "Forbidden",
            ProtocolErrorKind::UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }

    /// HTTP status for the error response (403 for Forbidden, 400 otherwise)
    pub fn status(self) -> u16 {
        match self {
            ProtocolErrorKind::Forbidden => 403,
            _ => 400,
        }
    }

    /// JSON body of the error response
    pub fn to_json(self) -> String {
        format!(
            "{{\"code\":{},\"message\":\"{}\"}}",
            self.code(),
            self.message()
        )
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Wire decode failures.
///
/// Payload decoding is greedy: callers receive the prefix of successfully
/// decoded packets together with the first error encountered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer was empty where at least a type byte was required
    #[error("parser error: empty packet")]
    EmptyPacket,
    /// The leading byte is not a known type digit or the base64 marker
    #[error("parser error: unknown packet type")]
    UnknownType,
    /// Base64 payload data could not be decoded
    #[error("parser error: invalid base64 data")]
    InvalidBase64,
    /// Textual packet bytes are not valid UTF-8
    #[error("parser error: invalid utf-8 data")]
    InvalidUtf8,
    /// A length-prefixed payload ended before the advertised length
    #[error("parser error: truncated payload")]
    TruncatedPayload,
    /// A payload length header is missing or non-numeric
    #[error("parser error: invalid length header")]
    InvalidLengthHeader,
    /// The packet type has no wire representation
    #[error("parser error: packet type has no wire form")]
    UnencodableType,
}

/// Top-level error type of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request-level protocol violation
    #[error("{0}")]
    Protocol(ProtocolErrorKind),

    /// Fault of the underlying connection. `tag` is a short human-readable
    /// description ("websocket error", "poll request error", ...); the
    /// source, when present, is the library error that triggered it.
    #[error("{tag}")]
    Transport {
        tag: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Wire decode failure
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The heartbeat window elapsed without an answer
    #[error("ping timeout")]
    PingTimeout,

    /// The session or transport is closed and cannot accept the operation
    #[error("session is closed")]
    Closed,

    /// Malformed or unusable endpoint URL
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl EngineError {
    /// Build a transport error from a tag and an underlying cause
    pub fn transport<E>(tag: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EngineError::Transport {
            tag: tag.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a transport error carrying only a descriptive tag
    pub fn transport_msg(tag: impl Into<String>) -> Self {
        EngineError::Transport {
            tag: tag.into(),
            source: None,
        }
    }

    /// Short description suitable for a session `close` event
    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl From<ProtocolErrorKind> for EngineError {
    fn from(kind: ProtocolErrorKind) -> Self {
        EngineError::Protocol(kind)
    }
}
