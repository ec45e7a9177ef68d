//! Postcard encode/decode helpers
//!
//! The store keys values by a digest of their encoded bytes, so encoding
//! must be deterministic; postcard guarantees that for a fixed type.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value to its canonical postcard bytes.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

/// Decode a value from postcard bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}
