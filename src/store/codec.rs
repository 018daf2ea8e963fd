//! Record encoding.
//!
//! Records are MessagePack maps keyed by field name, so fields added later
//! decode as their defaults in older records and unknown fields are ignored.

use crate::core::error::StoreResult;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a record.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// Decode a record; malformed bytes are reported as corruption.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}
