//! Value-level JSON helpers.
//!
//! Thin surface over `serde_json` used for configuration and endpoint dumps.
//! Both entry points propagate parse errors: the whole-string decode rejects
//! trailing non-whitespace input, and the prefix decode reports how many
//! bytes it consumed so callers can continue scanning a larger document.

use crate::error::{BusError, Result};
use serde::Serialize;
use serde_json::Value;

/// Output shape for `encode_json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFormat {
    Compact,
    Pretty,
}

/// Encode any serializable value as JSON text.
pub fn encode_json<T: Serialize>(value: &T, format: JsonFormat) -> Result<String> {
    let result = match format {
        JsonFormat::Compact => serde_json::to_string(value),
        JsonFormat::Pretty => serde_json::to_string_pretty(value),
    };
    result.map_err(|e| BusError::protocol_with_source("JSON encoding failed", e))
}

/// Decode a complete JSON document. Trailing non-whitespace input is an
/// error, matching the strictness of the prefix-based variant.
pub fn decode_json(input: &str) -> Result<Value> {
    let (value, consumed) = decode_json_prefix(input)?;
    if !input[consumed..].trim().is_empty() {
        return Err(BusError::protocol(format!(
            "trailing characters after JSON value at byte {}",
            consumed
        )));
    }
    Ok(value)
}

/// Decode the first JSON value of `input`, returning it together with the
/// number of bytes consumed.
pub fn decode_json_prefix(input: &str) -> Result<(Value, usize)> {
    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok((value, stream.byte_offset())),
        Some(Err(e)) => Err(BusError::protocol_with_source("JSON parse error", e)),
        None => Err(BusError::protocol("empty JSON input")),
    }
}
