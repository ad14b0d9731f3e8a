//! Binary codec for network message serialization.
//!
//! Centralizes the bincode configuration so every message in a session is encoded
//! the same way. Fixed-integer encoding is used deliberately: deterministic message
//! sizes, no variable-length surprises between platforms.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
#[derive(Debug)]
pub enum CodecError {
    /// The encoding operation failed.
    Encode(String),
    /// The decoding operation failed.
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encoding failed: {msg}"),
            Self::Decode(msg) => write!(f, "decoding failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
///
/// # Examples
///
/// ```
/// use bulwark_rollback::network::codec::encode;
///
/// let bytes = encode(&42u32).expect("encoding should succeed");
/// assert!(!bytes.is_empty());
/// ```
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a value from a byte slice, returning the value and bytes consumed.
///
/// # Examples
///
/// ```
/// use bulwark_rollback::network::codec::{encode, decode};
///
/// let bytes = encode(&42u32).expect("encoding should succeed");
/// let (value, read): (u32, _) = decode(&bytes).expect("decoding should succeed");
/// assert_eq!(value, 42);
/// assert_eq!(read, bytes.len());
/// ```
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}
