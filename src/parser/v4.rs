//! # v4 Wire Grammar
//!
//! A textual v4 packet is `<type-digit><UTF-8 payload>`. Binary payloads are
//! either raw bytes (framed transports) or `'b' + base64` when the carrier
//! is text-only; the `'b'` form implies a `message` packet on decode, as
//! does a raw binary frame. Payloads join the textual packet forms with the
//! `0x1E` record separator; the empty payload encodes to the empty buffer.

use super::{WireFrame, RECORD_SEPARATOR};
use crate::error::ParseError;
use crate::packet::{Packet, PacketData, PacketType};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

/// Encode a single packet.
///
/// Textual and empty payloads produce the digit-prefixed text form. Binary
/// payloads produce a raw binary frame when the transport supports it and
/// the `'b' + base64` text form otherwise.
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> Result<WireFrame, ParseError> {
    let digit = packet
        .kind
        .to_digit()
        .ok_or(ParseError::UnencodableType)?;

    match &packet.data {
        None => Ok(WireFrame::Text((digit as char).to_string())),
        Some(PacketData::Text(text)) => {
            let mut out = String::with_capacity(1 + text.len());
            out.push(digit as char);
            out.push_str(text);
            Ok(WireFrame::Text(out))
        }
        Some(PacketData::Binary(bytes)) => {
            if supports_binary {
                Ok(WireFrame::Binary(bytes.clone()))
            } else {
                let mut out = String::with_capacity(1 + (bytes.len() * 4 + 2) / 3);
                out.push('b');
                STANDARD.encode_string(bytes, &mut out);
                Ok(WireFrame::Text(out))
            }
        }
    }
}

/// Decode a single packet.
///
/// Raw binary frames and the `'b'` base64 form both decode to a `message`
/// packet with binary payload. An unknown leading byte or a malformed
/// base64 body is a parser error, not a silent skip.
pub fn decode_packet(frame: &WireFrame) -> Result<Packet, ParseError> {
    match frame {
        WireFrame::Binary(bytes) => Ok(Packet::new(PacketType::Message, bytes.clone())),
        WireFrame::Text(text) => decode_packet_str(text),
    }
}

fn decode_packet_str(text: &str) -> Result<Packet, ParseError> {
    let mut bytes = text.bytes();
    let lead = bytes.next().ok_or(ParseError::EmptyPacket)?;

    if lead == b'b' {
        let decoded = STANDARD
            .decode(&text.as_bytes()[1..])
            .map_err(|_| ParseError::InvalidBase64)?;
        return Ok(Packet::new(PacketType::Message, decoded));
    }

    let kind = PacketType::from_digit(lead).ok_or(ParseError::UnknownType)?;
    let rest = &text[1..];
    if rest.is_empty() {
        Ok(Packet::empty(kind))
    } else {
        Ok(Packet::new(kind, rest))
    }
}

/// Encode an ordered packet sequence into one payload body.
///
/// Payload framing is textual: every packet is encoded in its text form
/// (binary payloads become base64) and the forms are joined with `0x1E`.
pub fn encode_payload(packets: &[Packet]) -> Result<Bytes, ParseError> {
    let mut out = Vec::new();
    for (index, packet) in packets.iter().enumerate() {
        if index > 0 {
            out.push(RECORD_SEPARATOR);
        }
        match encode_packet(packet, false)? {
            WireFrame::Text(text) => out.extend_from_slice(text.as_bytes()),
            // encode_packet never yields a binary frame when binary support
            // is off; keep the arm for totality
            WireFrame::Binary(bytes) => out.extend_from_slice(&bytes),
        }
    }
    Ok(Bytes::from(out))
}

/// Decode a payload body into its packet sequence.
///
/// Greedy: returns the successfully decoded prefix and the first error.
/// A `0x1E` byte is only ever a frame boundary; content that decodes to
/// contain the separator inside a packet is passed through undisturbed.
pub fn decode_payload(data: &[u8]) -> (Vec<Packet>, Option<ParseError>) {
    if data.is_empty() {
        return (Vec::new(), None);
    }

    let mut packets = Vec::new();
    for chunk in data.split(|&b| b == RECORD_SEPARATOR) {
        let text = match std::str::from_utf8(chunk) {
            Ok(text) => text,
            Err(_) => return (packets, Some(ParseError::InvalidUtf8)),
        };
        match decode_packet_str(text) {
            Ok(packet) => packets.push(packet),
            Err(err) => return (packets, Some(err)),
        }
    }
    (packets, None)
}
