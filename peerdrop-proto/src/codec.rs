//! JSON encode/decode helpers shared by the relay and peer-channel protocols.
//!
//! Both wire surfaces are text-encoded JSON, so a single error type covers
//! every codec failure in this crate.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The input was not valid UTF-8.
    #[error("invalid utf-8 in frame: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Serializes a value into a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Deserializes a value from a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not valid JSON for `T`.
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Deserializes a value from UTF-8 JSON bytes.
///
/// # Errors
///
/// Returns `CodecError::InvalidUtf8` for non-UTF-8 input, otherwise the same
/// errors as [`from_json`].
pub fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(bytes)?;
    from_json(text)
}
