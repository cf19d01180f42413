//! # v3 Wire Grammar (legacy)
//!
//! The legacy revision keeps the same type digits as v4 but frames payloads
//! with explicit length prefixes instead of a separator byte:
//!
//! - **Textual payload**: repetition of `<len>:<packet>` where `<len>` is
//!   the UTF-16 code-unit count of the packet's textual form (code points
//!   above U+FFFF count as two units, per the surrogate rule)
//! - **Binary payload**: repetition of `<0|1><len digits>0xFF<bytes>` with
//!   raw marker bytes: `0` for a textual packet, `1` for a binary one, and
//!   the decimal digits of the length as raw byte values `0..=9`
//!
//! Binary packets on framed transports carry a raw leading type byte
//! (`0..=6`, not an ASCII digit) followed by the payload. The historical
//! `utf8` option transfers strings byte-per-character; see
//! [`legacy_utf8_encode`].

use super::WireFrame;
use crate::error::ParseError;
use crate::packet::{Packet, PacketData, PacketType};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

/// Encode a single packet in the legacy form.
///
/// Binary payloads produce a raw frame with a leading raw type byte when
/// binary is supported, and the `'b' + <digit> + base64` text form
/// otherwise. With `utf8_encode`, textual data is transferred
/// byte-per-character (the historical XHR text convention).
pub fn encode_packet(
    packet: &Packet,
    supports_binary: bool,
    utf8_encode: bool,
) -> Result<WireFrame, ParseError> {
    let digit = packet
        .kind
        .to_digit()
        .ok_or(ParseError::UnencodableType)?;

    match &packet.data {
        None => Ok(WireFrame::Text((digit as char).to_string())),
        Some(PacketData::Text(text)) => {
            let mut out = String::with_capacity(1 + text.len());
            out.push(digit as char);
            if utf8_encode {
                out.push_str(&legacy_utf8_encode(text));
            } else {
                out.push_str(text);
            }
            Ok(WireFrame::Text(out))
        }
        Some(PacketData::Binary(bytes)) => {
            if supports_binary {
                let mut out = Vec::with_capacity(1 + bytes.len());
                // raw type byte, not an ASCII digit
                out.push(digit - b'0');
                out.extend_from_slice(bytes);
                Ok(WireFrame::Binary(Bytes::from(out)))
            } else {
                let mut out = String::with_capacity(2 + (bytes.len() * 4 + 2) / 3);
                out.push('b');
                out.push(digit as char);
                STANDARD.encode_string(bytes, &mut out);
                Ok(WireFrame::Text(out))
            }
        }
    }
}

/// Decode a single legacy packet.
pub fn decode_packet(frame: &WireFrame, utf8_decode: bool) -> Result<Packet, ParseError> {
    match frame {
        WireFrame::Binary(bytes) => {
            let (&lead, rest) = bytes.split_first().ok_or(ParseError::EmptyPacket)?;
            let kind = PacketType::from_raw(lead).ok_or(ParseError::UnknownType)?;
            if rest.is_empty() {
                Ok(Packet::empty(kind))
            } else {
                Ok(Packet::new(kind, rest.to_vec()))
            }
        }
        WireFrame::Text(text) => decode_packet_str(text, utf8_decode),
    }
}

fn decode_packet_str(text: &str, utf8_decode: bool) -> Result<Packet, ParseError> {
    let lead = *text.as_bytes().first().ok_or(ParseError::EmptyPacket)?;

    if lead == b'b' {
        let digit = *text.as_bytes().get(1).ok_or(ParseError::EmptyPacket)?;
        let kind = PacketType::from_digit(digit).ok_or(ParseError::UnknownType)?;
        let decoded = STANDARD
            .decode(&text.as_bytes()[2..])
            .map_err(|_| ParseError::InvalidBase64)?;
        return Ok(Packet::new(kind, decoded));
    }

    let kind = PacketType::from_digit(lead).ok_or(ParseError::UnknownType)?;
    let rest = &text[1..];
    if rest.is_empty() {
        Ok(Packet::empty(kind))
    } else if utf8_decode {
        Ok(Packet::new(kind, legacy_utf8_decode(rest)?))
    } else {
        Ok(Packet::new(kind, rest))
    }
}

/// Encode an ordered packet sequence into one legacy payload body.
pub fn encode_payload(
    packets: &[Packet],
    supports_binary: bool,
    utf8_encode: bool,
) -> Result<Bytes, ParseError> {
    if packets.is_empty() {
        // the legacy empty payload is an explicit zero-length record
        return Ok(Bytes::from_static(b"0:"));
    }

    if supports_binary {
        encode_payload_as_binary(packets, utf8_encode)
    } else {
        encode_payload_as_text(packets, utf8_encode)
    }
}

fn encode_payload_as_text(packets: &[Packet], utf8_encode: bool) -> Result<Bytes, ParseError> {
    let mut out = String::new();
    for packet in packets {
        let encoded = match encode_packet(packet, false, utf8_encode)? {
            WireFrame::Text(text) => text,
            WireFrame::Binary(_) => unreachable!("text encoding never yields binary frames"),
        };
        let units: usize = encoded.chars().map(char::len_utf16).sum();
        out.push_str(&units.to_string());
        out.push(':');
        out.push_str(&encoded);
    }
    Ok(Bytes::from(out.into_bytes()))
}

fn encode_payload_as_binary(packets: &[Packet], utf8_encode: bool) -> Result<Bytes, ParseError> {
    let mut out = Vec::new();
    for packet in packets {
        let (marker, bytes) = match encode_packet(packet, true, utf8_encode)? {
            WireFrame::Text(text) => (0u8, text.into_bytes()),
            WireFrame::Binary(bytes) => (1u8, bytes.to_vec()),
        };
        out.push(marker);
        for digit in bytes.len().to_string().bytes() {
            out.push(digit - b'0');
        }
        out.push(0xff);
        out.extend_from_slice(&bytes);
    }
    Ok(Bytes::from(out))
}

/// Decode a legacy payload body into its packet sequence.
///
/// The framing flavor is sniffed from the first byte: binary framing starts
/// with a raw `0`/`1` marker, textual framing with an ASCII length digit.
/// Greedy like the v4 decoder: prefix of successes plus the first error.
pub fn decode_payload(data: &[u8], utf8_decode: bool) -> (Vec<Packet>, Option<ParseError>) {
    if data.is_empty() {
        return (Vec::new(), Some(ParseError::EmptyPacket));
    }
    if data[0] <= 1 {
        decode_payload_binary(data, utf8_decode)
    } else {
        decode_payload_text(data, utf8_decode)
    }
}

fn decode_payload_text(data: &[u8], utf8_decode: bool) -> (Vec<Packet>, Option<ParseError>) {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return (Vec::new(), Some(ParseError::InvalidUtf8)),
    };

    let mut packets = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let colon = match rest.find(':') {
            Some(pos) if pos > 0 => pos,
            _ => return (packets, Some(ParseError::InvalidLengthHeader)),
        };
        let units: usize = match rest[..colon].parse() {
            Ok(n) => n,
            Err(_) => return (packets, Some(ParseError::InvalidLengthHeader)),
        };
        let body = &rest[colon + 1..];

        // walk `units` UTF-16 code units to find the byte boundary
        let mut taken_units = 0usize;
        let mut byte_end = 0usize;
        for ch in body.chars() {
            if taken_units == units {
                break;
            }
            taken_units += ch.len_utf16();
            byte_end += ch.len_utf8();
        }
        if taken_units != units {
            return (packets, Some(ParseError::TruncatedPayload));
        }

        let message = &body[..byte_end];
        if !message.is_empty() {
            match decode_packet_str(message, utf8_decode) {
                Ok(packet) => packets.push(packet),
                Err(err) => return (packets, Some(err)),
            }
        }
        rest = &body[byte_end..];
    }
    (packets, None)
}

fn decode_payload_binary(data: &[u8], utf8_decode: bool) -> (Vec<Packet>, Option<ParseError>) {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let is_binary = match rest[0] {
            0 => false,
            1 => true,
            _ => return (packets, Some(ParseError::InvalidLengthHeader)),
        };

        let mut len = 0usize;
        let mut pos = 1usize;
        loop {
            match rest.get(pos) {
                Some(&0xff) => {
                    pos += 1;
                    break;
                }
                Some(&digit) if digit <= 9 => {
                    len = len * 10 + digit as usize;
                    pos += 1;
                    if pos > 11 {
                        return (packets, Some(ParseError::InvalidLengthHeader));
                    }
                }
                _ => return (packets, Some(ParseError::InvalidLengthHeader)),
            }
        }

        if rest.len() < pos + len {
            return (packets, Some(ParseError::TruncatedPayload));
        }
        let body = &rest[pos..pos + len];

        let result = if is_binary {
            decode_packet(&WireFrame::Binary(Bytes::from(body.to_vec())), utf8_decode)
        } else {
            match std::str::from_utf8(body) {
                Ok(text) => decode_packet_str(text, utf8_decode),
                Err(_) => Err(ParseError::InvalidUtf8),
            }
        };
        match result {
            Ok(packet) => packets.push(packet),
            Err(err) => return (packets, Some(err)),
        }
        rest = &rest[pos + len..];
    }
    (packets, None)
}

/// Historical `utf8` string transfer: every byte of the input becomes one
/// character of the output, which the carrier then serializes as UTF-8.
/// This preserves interoperability with clients that moved strings through
/// XHR text bodies one 8-bit character at a time.
pub fn legacy_utf8_encode(input: &str) -> String {
    input.bytes().map(char::from).collect()
}

/// Reverse of [`legacy_utf8_encode`]: collapse each character back to a
/// single byte and reinterpret the byte sequence as UTF-8.
pub fn legacy_utf8_decode(input: &str) -> Result<String, ParseError> {
    let mut bytes = Vec::with_capacity(input.len());
    for ch in input.chars() {
        let value = ch as u32;
        if value > 0xff {
            return Err(ParseError::InvalidUtf8);
        }
        bytes.push(value as u8);
    }
    String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)
}
