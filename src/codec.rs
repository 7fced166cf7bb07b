//! Shared little-endian wire primitives.
//!
//! The message header, directory records and error payloads all use the same
//! building blocks: little-endian integers, u32-length-prefixed UTF-8 strings
//! and u32-count-prefixed vectors. Bounds are checked before every read so a
//! truncated buffer surfaces as a protocol error, never a panic.

use crate::error::{BusError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Append a length-prefixed UTF-8 string.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Read a length-prefixed UTF-8 string.
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(BusError::protocol(format!(
            "truncated string: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| BusError::protocol_with_source("string is not valid UTF-8", e))
}

/// Append a count-prefixed vector of strings.
pub fn put_string_vec(buf: &mut BytesMut, values: &[String]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        put_string(buf, value);
    }
}

/// Read a count-prefixed vector of strings.
pub fn get_string_vec(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = get_u32(buf)? as usize;
    // An adversarial count must not drive a huge allocation before the
    // element reads fail; each entry needs at least its 4-byte length.
    if buf.remaining() < count.saturating_mul(4) {
        return Err(BusError::protocol(format!(
            "truncated vector: {} entries announced, {} bytes remain",
            count,
            buf.remaining()
        )));
    }
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_string(buf)?);
    }
    Ok(values)
}

/// Read a little-endian u32.
pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(BusError::protocol(format!(
            "truncated u32: {} bytes remain",
            buf.remaining()
        )));
    }
    Ok(buf.get_u32_le())
}

/// Read a little-endian u16.
pub fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(BusError::protocol(format!(
            "truncated u16: {} bytes remain",
            buf.remaining()
        )));
    }
    Ok(buf.get_u16_le())
}

/// Read a single byte.
pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(BusError::protocol("truncated u8: buffer empty"));
    }
    Ok(buf.get_u8())
}

/// Encode a bare u32 payload (service-directory resolve requests).
pub fn encode_u32(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(value);
    buf.freeze()
}

/// Encode a bare string payload (error descriptions).
pub fn encode_string(value: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + value.len());
    put_string(&mut buf, value);
    buf.freeze()
}
