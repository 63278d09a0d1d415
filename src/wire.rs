//! Hello payload serialization and parsing.
//!
//! All integers are big-endian. Decoders take a byte slice and a read index
//! and return the value together with the index just past it, so fields can be
//! chained. Every decoder checks bounds before reading.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::proto::{HelloEvent, HelloRequest, HelloResponse, TimeOfDay, TimerId};

/// SOME/IP protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of an encoded [`HelloEvent`]: four `i32` fields and one tag byte.
pub const HELLO_EVENT_PAYLOAD_SIZE: usize = 17;

/// SOME/IP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
}

impl MessageType {
    /// Whether the sender waits for an answer
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request)
    }
}

/// Byte layout used for string payloads of requests and responses.
///
/// Both peers must agree on the profile; there is no negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WireProfile {
    /// UTF-8 bytes followed by one NUL, no length prefix.
    #[default]
    Raw,
    /// [`encode_string`] layout: length prefix, UTF-8 bytes, NUL.
    LengthPrefixed,
}

impl std::str::FromStr for WireProfile {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "length-prefixed" | "prefixed" => Ok(Self::LengthPrefixed),
            other => Err(crate::error::ConfigError::new(format!(
                "unknown wire profile '{other}' (expected raw or length-prefixed)"
            ))),
        }
    }
}

// ============================================================================
// PRIMITIVES
// ============================================================================

pub fn encode_int32(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Read a big-endian `i32` at `index`.
pub fn decode_int32(bytes: &[u8], index: usize) -> Result<(i32, usize), CodecError> {
    let mut rest = remaining_from(bytes, index, 4)?;
    Ok((rest.get_i32(), index + 4))
}

/// Length-prefixed string: `u32` length (bytes + 1), the UTF-8 bytes, one NUL.
pub fn encode_string(value: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + value.len() + 1);
    put_string(&mut buf, value);
    buf.freeze()
}

fn put_string(buf: &mut impl BufMut, value: &str) {
    // Payloads are far below 4 GiB; saturate instead of wrapping if one is not.
    let length = u32::try_from(value.len() + 1).unwrap_or(u32::MAX);
    buf.put_u32(length);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Read a string written by [`encode_string`].
///
/// The returned string is the `length - 1` bytes following the prefix; the
/// terminator byte is skipped without inspection. Invalid UTF-8 is replaced
/// rather than rejected.
pub fn decode_string(bytes: &[u8], index: usize) -> Result<(String, usize), CodecError> {
    let (raw_length, start) = decode_int32(bytes, index)?;
    let length = raw_length as u32;
    let remaining = bytes.len() - start;
    if length == 0 || (length - 1) as usize > remaining {
        return Err(CodecError::MalformedLength { length, remaining });
    }
    let text_len = (length - 1) as usize;
    let text = String::from_utf8_lossy(&bytes[start..start + text_len]).into_owned();
    // A conforming encoder always writes the NUL; tolerate its absence at the very end.
    let next = (start + text_len + 1).min(bytes.len());
    Ok((text, next))
}

fn remaining_from(bytes: &[u8], index: usize, needed: usize) -> Result<&[u8], CodecError> {
    match bytes.get(index..) {
        Some(rest) if rest.len() >= needed => Ok(rest),
        rest => Err(CodecError::TruncatedInput {
            needed,
            remaining: rest.map_or(0, <[u8]>::len),
        }),
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

fn encode_text(text: &str, profile: WireProfile) -> Bytes {
    match profile {
        WireProfile::LengthPrefixed => encode_string(text),
        WireProfile::Raw => {
            let mut buf = BytesMut::with_capacity(text.len() + 1);
            buf.put_slice(text.as_bytes());
            buf.put_u8(0);
            buf.freeze()
        }
    }
}

fn decode_text(payload: &[u8], profile: WireProfile) -> Result<String, CodecError> {
    if payload.is_empty() {
        return Ok(String::new());
    }
    match profile {
        WireProfile::LengthPrefixed => decode_string(payload, 0).map(|(text, _)| text),
        WireProfile::Raw => {
            let text = payload.strip_suffix(&[0]).unwrap_or(payload);
            Ok(String::from_utf8_lossy(text).into_owned())
        }
    }
}

pub fn encode_request(request: &HelloRequest, profile: WireProfile) -> Bytes {
    encode_text(&request.message, profile)
}

pub fn decode_request(payload: &[u8], profile: WireProfile) -> Result<HelloRequest, CodecError> {
    decode_text(payload, profile).map(|message| HelloRequest { message })
}

pub fn encode_response(response: &HelloResponse, profile: WireProfile) -> Bytes {
    encode_text(&response.reply, profile)
}

pub fn decode_response(payload: &[u8], profile: WireProfile) -> Result<HelloResponse, CodecError> {
    decode_text(payload, profile).map(|reply| HelloResponse { reply })
}

// ============================================================================
// EVENTS
// ============================================================================

/// Append the 17-byte event layout to `buf`.
pub fn put_event(buf: &mut impl BufMut, event: &HelloEvent) {
    let t = &event.time_of_day;
    buf.put_i32(t.hours);
    buf.put_i32(t.minutes);
    buf.put_i32(t.seconds);
    buf.put_i32(t.nanos);
    buf.put_u8(event.timer_id.tag());
}

pub fn encode_event(event: &HelloEvent) -> Bytes {
    let mut buf = BytesMut::with_capacity(HELLO_EVENT_PAYLOAD_SIZE);
    put_event(&mut buf, event);
    buf.freeze()
}

/// Parse an event payload. Bytes past the 17th are ignored.
pub fn decode_event(payload: &[u8]) -> Result<HelloEvent, CodecError> {
    if payload.len() < HELLO_EVENT_PAYLOAD_SIZE {
        return Err(CodecError::ShortPayload { len: payload.len() });
    }
    let mut buf = payload;
    let hours = buf.get_i32();
    let minutes = buf.get_i32();
    let seconds = buf.get_i32();
    let nanos = buf.get_i32();
    let tag = buf.get_u8();
    let timer_id = TimerId::from_tag(tag).ok_or(CodecError::UnknownTimerTag(tag))?;
    Ok(HelloEvent {
        time_of_day: TimeOfDay {
            hours,
            minutes,
            seconds,
            nanos,
        },
        timer_id,
    })
}

/// Render bytes as `"57 6F 00"` for trace output.
pub fn to_hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}
