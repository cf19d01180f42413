//! # Packet Model
//!
//! This module defines the unit of communication between the two endpoints:
//! the [`Packet`]. A packet pairs a [`PacketType`] with an optional payload
//! held in a [`PacketData`] buffer that preserves the text/binary
//! distinction all the way through encoding.
//!
//! ## Packet Lifecycle
//!
//! 1. **Creation**: produced by a session (heartbeats, upgrade control) or
//!    by the application (`message` payloads)
//! 2. **Encoding**: converted to its wire form by the parser
//! 3. **Transmission**: carried by the active transport
//! 4. **Decoding**: reconstructed on the receiving side
//! 5. **Dispatch**: consumed exactly once by the owning session

use bytes::Bytes;

/// Classification of a packet.
///
/// The wire byte of each variant in the v4 revision is the ASCII digit
/// `'0' + ordinal`. [`PacketType::Error`] is reserved for decode failures
/// and never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// First packet of a session; carries the handshake configuration
    Open,
    /// Orderly end of the transport
    Close,
    /// Heartbeat probe
    Ping,
    /// Heartbeat answer
    Pong,
    /// Application payload
    Message,
    /// Commit of a transport upgrade
    Upgrade,
    /// Padding packet used to complete a polling cycle
    Noop,
    /// Internal decode-failure marker; not a wire type
    Error,
}

impl PacketType {
    /// ASCII digit identifying the type on the wire, `None` for the
    /// reserved error marker
    pub fn to_digit(self) -> Option<u8> {
        match self {
            PacketType::Open => Some(b'0'),
            PacketType::Close => Some(b'1'),
            PacketType::Ping => Some(b'2'),
            PacketType::Pong => Some(b'3'),
            PacketType::Message => Some(b'4'),
            PacketType::Upgrade => Some(b'5'),
            PacketType::Noop => Some(b'6'),
            PacketType::Error => None,
        }
    }

    /// Map a wire digit back to a packet type
    pub fn from_digit(digit: u8) -> Option<PacketType> {
        match digit {
            b'0' => Some(PacketType::Open),
            b'1' => Some(PacketType::Close),
            b'2' => Some(PacketType::Ping),
            b'3' => Some(PacketType::Pong),
            b'4' => Some(PacketType::Message),
            b'5' => Some(PacketType::Upgrade),
            b'6' => Some(PacketType::Noop),
            _ => None,
        }
    }

    /// Map a raw binary type byte (the v3 binary frame form) to a type
    pub fn from_raw(value: u8) -> Option<PacketType> {
        match value {
            0 => Some(PacketType::Open),
            1 => Some(PacketType::Close),
            2 => Some(PacketType::Ping),
            3 => Some(PacketType::Pong),
            4 => Some(PacketType::Message),
            5 => Some(PacketType::Upgrade),
            6 => Some(PacketType::Noop),
            _ => None,
        }
    }

    /// Raw numeric value of the type (the v3 binary frame form)
    pub fn to_raw(self) -> Option<u8> {
        self.to_digit().map(|d| d - b'0')
    }

    /// Human-readable name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Open => "open",
            PacketType::Close => "close",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::Message => "message",
            PacketType::Upgrade => "upgrade",
            PacketType::Noop => "noop",
            PacketType::Error => "error",
        }
    }
}

/// Payload buffer preserving the text/binary distinction.
///
/// A single concrete type with a tag is sufficient to carry both payload
/// kinds through encoding: textual data stays UTF-8, binary data is wrapped
/// in base64 only when the transport cannot carry raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData {
    /// UTF-8 textual payload
    Text(String),
    /// Raw binary payload
    Binary(Bytes),
}

impl PacketData {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            PacketData::Text(s) => s.len(),
            PacketData::Binary(b) => b.len(),
        }
    }

    /// True when the payload holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for binary payloads
    pub fn is_binary(&self) -> bool {
        matches!(self, PacketData::Binary(_))
    }

    /// Borrow the textual form, if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PacketData::Text(s) => Some(s.as_str()),
            PacketData::Binary(_) => None,
        }
    }

    /// Borrow the raw bytes of either payload kind
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PacketData::Text(s) => s.as_bytes(),
            PacketData::Binary(b) => b.as_ref(),
        }
    }

    /// Consume the payload into its raw bytes
    pub fn into_bytes(self) -> Bytes {
        match self {
            PacketData::Text(s) => Bytes::from(s.into_bytes()),
            PacketData::Binary(b) => b,
        }
    }
}

impl From<&str> for PacketData {
    fn from(value: &str) -> Self {
        PacketData::Text(value.to_string())
    }
}

impl From<String> for PacketData {
    fn from(value: String) -> Self {
        PacketData::Text(value)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(value: Vec<u8>) -> Self {
        PacketData::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for PacketData {
    fn from(value: Bytes) -> Self {
        PacketData::Binary(value)
    }
}

/// Per-packet send options.
///
/// These never appear on the wire; they steer transport-level behavior for
/// the write that carries the packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Request transport-level compression for this packet, subject to the
    /// configured size threshold
    pub compress: bool,
}

/// One unit of communication between the endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet classification
    pub kind: PacketType,
    /// Optional payload
    pub data: Option<PacketData>,
    /// Send options for the carrying write
    pub options: PacketOptions,
}

impl Packet {
    /// Create a packet with a payload
    pub fn new(kind: PacketType, data: impl Into<PacketData>) -> Self {
        Self {
            kind,
            data: Some(data.into()),
            options: PacketOptions::default(),
        }
    }

    /// Create a packet without a payload
    pub fn empty(kind: PacketType) -> Self {
        Self {
            kind,
            data: None,
            options: PacketOptions::default(),
        }
    }

    /// Application message packet
    pub fn message(data: impl Into<PacketData>) -> Self {
        Packet::new(PacketType::Message, data)
    }

    /// Session-opening packet carrying the handshake JSON
    pub fn open(handshake_json: String) -> Self {
        Packet::new(PacketType::Open, handshake_json)
    }

    /// Orderly close packet
    pub fn close() -> Self {
        Packet::empty(PacketType::Close)
    }

    /// Bare heartbeat probe
    pub fn ping() -> Self {
        Packet::empty(PacketType::Ping)
    }

    /// Bare heartbeat answer
    pub fn pong() -> Self {
        Packet::empty(PacketType::Pong)
    }

    /// Heartbeat probe used to validate a candidate upgrade transport
    pub fn ping_probe() -> Self {
        Packet::new(PacketType::Ping, "probe")
    }

    /// Answer to the upgrade probe
    pub fn pong_probe() -> Self {
        Packet::new(PacketType::Pong, "probe")
    }

    /// Upgrade-commit packet
    pub fn upgrade() -> Self {
        Packet::empty(PacketType::Upgrade)
    }

    /// Padding packet completing a polling cycle
    pub fn noop() -> Self {
        Packet::empty(PacketType::Noop)
    }

    /// Reserved decode-failure packet surfaced by the parser
    pub fn parser_error() -> Self {
        Packet::new(PacketType::Error, "parser error")
    }

    /// True when the packet carries the given textual payload
    pub fn has_text(&self, text: &str) -> bool {
        matches!(&self.data, Some(PacketData::Text(s)) if s == text)
    }

    /// Estimated encoded size in bytes, used for payload budgeting.
    ///
    /// Textual packets cost one type byte plus the payload; binary packets
    /// are budgeted at the base64 expansion factor of 1.33 plus the marker
    /// byte, matching the polling wire form.
    pub fn encoded_size_estimate(&self) -> usize {
        match &self.data {
            None => 1,
            Some(PacketData::Text(s)) => 1 + s.len(),
            Some(PacketData::Binary(b)) => 1 + (b.len() as f64 * 1.33).ceil() as usize,
        }
    }
}
