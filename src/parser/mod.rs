//! # Wire Codec
//!
//! This module encodes and decodes single packets and payloads (ordered
//! packet sequences carried by one polling request or response) for the two
//! supported wire revisions:
//!
//! - **v4** (`EIO=4`): textual packets prefixed by an ASCII type digit,
//!   payloads joined by the `0x1E` record separator, binary carried either
//!   raw (framed transports) or as `'b' + base64`
//! - **v3** (`EIO=3`, legacy): length-prefixed payload framing with the
//!   historical UTF-16 code-unit length convention
//!
//! Encoding is byte-exact across peers: the representative wire forms are
//! pinned by the unit tests in the revision submodules.

pub mod v3;
pub mod v4;

use crate::error::ParseError;
use crate::packet::Packet;
use bytes::Bytes;

/// Byte separating packets inside a v4 payload
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Wire revision identifier for the legacy protocol
pub const PROTOCOL_V3: u8 = 3;

/// Wire revision identifier for the current protocol
pub const PROTOCOL_V4: u8 = 4;

/// A single encoded packet, ready for the transport.
///
/// Framed transports map the variants directly onto their frame kinds
/// (text frame / binary frame); polling transports only ever see the text
/// variant because payload framing is textual.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Textual frame (UTF-8)
    Text(String),
    /// Raw binary frame
    Binary(Bytes),
}

impl WireFrame {
    /// Frame length in bytes
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(s) => s.len(),
            WireFrame::Binary(b) => b.len(),
        }
    }

    /// True when the frame holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for binary frames
    pub fn is_binary(&self) -> bool {
        matches!(self, WireFrame::Binary(_))
    }
}

/// Encode a single packet for the given wire revision.
///
/// When the carrying transport cannot transfer raw bytes
/// (`supports_binary == false`), binary payloads are wrapped in base64
/// textual form.
pub fn encode_packet(
    packet: &Packet,
    protocol: u8,
    supports_binary: bool,
) -> Result<WireFrame, ParseError> {
    if protocol == PROTOCOL_V3 {
        v3::encode_packet(packet, supports_binary, false)
    } else {
        v4::encode_packet(packet, supports_binary)
    }
}

/// Decode a single packet for the given wire revision.
pub fn decode_packet(frame: &WireFrame, protocol: u8) -> Result<Packet, ParseError> {
    if protocol == PROTOCOL_V3 {
        v3::decode_packet(frame, false)
    } else {
        v4::decode_packet(frame)
    }
}

/// Encode an ordered packet sequence into one payload body.
pub fn encode_payload(
    packets: &[Packet],
    protocol: u8,
    supports_binary: bool,
) -> Result<Bytes, ParseError> {
    if protocol == PROTOCOL_V3 {
        v3::encode_payload(packets, supports_binary, false)
    } else {
        v4::encode_payload(packets)
    }
}

/// Decode a payload body into its packet sequence.
///
/// Decoding is greedy: the prefix of successfully decoded packets is
/// returned together with the first error encountered, if any. Callers must
/// accept partial success.
pub fn decode_payload(data: &[u8], protocol: u8) -> (Vec<Packet>, Option<ParseError>) {
    if protocol == PROTOCOL_V3 {
        v3::decode_payload(data, false)
    } else {
        v4::decode_payload(data)
    }
}

/// HTTP content type of an encoded payload body
pub fn payload_content_type(binary: bool) -> &'static str {
    if binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=UTF-8"
    }
}
