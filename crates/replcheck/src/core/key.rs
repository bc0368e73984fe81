//! Order-preserving key encoding.
//!
//! Batch boundaries, primary keys, and secondary-index keys are all carried
//! as opaque byte strings whose bytewise order equals the logical order of
//! the underlying values. Digest computation folds these raw bytes, so two
//! nodes that hold the same logical keys produce the same bytes in the same
//! order regardless of how their storage engines lay the data out.
//!
//! Scalar values are encoded with a leading type tag so that values of
//! different types have a stable total order:
//!
//! `null < false < true < numbers < strings < max-sentinel`
//!
//! Non-unique secondary-index entries carry the owning record's row
//! identifier as a fixed-width suffix; [`KeyString::without_row_id`] strips
//! it for hashing and comparison.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CheckError, Result};

const TAG_NULL: u8 = 0x04;
const TAG_BOOL_FALSE: u8 = 0x08;
const TAG_BOOL_TRUE: u8 = 0x09;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x20;
const TAG_MAX: u8 = 0xFF;

/// Width of an encoded row identifier suffix.
pub const ROW_ID_SUFFIX_LEN: usize = 8;

/// Internal physical identifier of a stored record.
///
/// Appended to non-unique secondary-index keys, and used for point lookups
/// in the backing record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl RowId {
    /// Encode as a fixed-width, order-preserving byte suffix.
    pub fn encode(&self) -> [u8; ROW_ID_SUFFIX_LEN] {
        // Flip the sign bit so negative ids sort before positive ones.
        ((self.0 as u64) ^ (1 << 63)).to_be_bytes()
    }

    /// Decode from the fixed-width suffix produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ROW_ID_SUFFIX_LEN] = bytes
            .try_into()
            .map_err(|_| CheckError::storage("row id suffix has wrong length"))?;
        Ok(RowId((u64::from_be_bytes(arr) ^ (1 << 63)) as i64))
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An encoded key without a row-identifier suffix.
///
/// Used for batch boundaries and primary keys. Ordering is plain bytewise
/// comparison of the encoded form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyBytes(Vec<u8>);

impl KeyBytes {
    /// The minimal key: sorts before every encodable value.
    pub fn min_sentinel() -> Self {
        KeyBytes(Vec::new())
    }

    /// The maximal key: sorts after every encodable value.
    pub fn max_sentinel() -> Self {
        KeyBytes(vec![TAG_MAX])
    }

    /// Whether this is the maximal sentinel.
    pub fn is_max_sentinel(&self) -> bool {
        self.0 == [TAG_MAX]
    }

    /// Wrap raw encoded bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        KeyBytes(bytes)
    }

    /// The raw encoded form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode a scalar value into its ordered byte form.
    ///
    /// Only scalars participate in key spaces; arrays and objects are the
    /// caller's problem (see the index-key derivation rules in the memory
    /// backend).
    pub fn encode_value(value: &serde_json::Value) -> Result<Self> {
        let mut buf = Vec::new();
        match value {
            serde_json::Value::Null => buf.push(TAG_NULL),
            serde_json::Value::Bool(false) => buf.push(TAG_BOOL_FALSE),
            serde_json::Value::Bool(true) => buf.push(TAG_BOOL_TRUE),
            serde_json::Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| CheckError::storage(format!("unencodable number: {n}")))?;
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&monotone_f64(f));
            }
            serde_json::Value::String(s) => {
                buf.push(TAG_STRING);
                buf.extend_from_slice(s.as_bytes());
                // Terminator so "ab" sorts before "ab\x01". Keys containing
                // NUL bytes are not supported by this encoding.
                buf.push(0x00);
            }
            other => {
                return Err(CheckError::storage(format!(
                    "cannot encode non-scalar key value: {other}"
                )))
            }
        }
        Ok(KeyBytes(buf))
    }
}

impl std::fmt::Display for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Serialize for KeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(KeyBytes)
            .map_err(|e| D::Error::custom(format!("invalid hex key: {e}")))
    }
}

/// Map an f64 onto u64 big-endian bytes whose unsigned order matches the
/// numeric order (NaN sorts with the sign it carries; keys never hold NaN
/// in practice).
fn monotone_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    ordered.to_be_bytes()
}

/// An encoded secondary-index key, possibly carrying a row-identifier suffix.
///
/// Unique indexes store keys without the suffix (one entry per value);
/// non-unique indexes append the owning record's row id so duplicate values
/// remain distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyString {
    buf: Vec<u8>,
    row_id_len: usize,
}

impl KeyString {
    /// Build a key string from an encoded key and an optional row id suffix.
    pub fn new(key: KeyBytes, row_id: Option<RowId>) -> Self {
        let mut buf = key.0;
        let row_id_len = match row_id {
            Some(id) => {
                buf.extend_from_slice(&id.encode());
                ROW_ID_SUFFIX_LEN
            }
            None => 0,
        };
        KeyString { buf, row_id_len }
    }

    /// Reconstruct from raw stored bytes with a known suffix width.
    pub fn from_raw(buf: Vec<u8>, row_id_len: usize) -> Self {
        debug_assert!(buf.len() >= row_id_len);
        KeyString { buf, row_id_len }
    }

    /// The full encoded form, including any row id suffix.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The encoded form with the trailing row identifier stripped.
    ///
    /// This is the slice that participates in digests and batch-boundary
    /// comparisons.
    pub fn without_row_id(&self) -> &[u8] {
        &self.buf[..self.buf.len() - self.row_id_len]
    }

    /// The row identifier carried in the suffix, if any.
    pub fn row_id(&self) -> Result<Option<RowId>> {
        if self.row_id_len == 0 {
            return Ok(None);
        }
        RowId::decode(&self.buf[self.buf.len() - self.row_id_len..]).map(Some)
    }
}

impl std::fmt::Display for KeyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.buf))
    }
}

/// A bounded key range over one ordered key space.
///
/// The end bound is inclusive. For collection scans the start bound is
/// exclusive (it is the previous batch's reported end); for index-key scans
/// the cursor seeks to the start bound inclusively and relies on
/// duplicate-run absorption to keep boundaries convergent across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    /// Start key.
    pub start: KeyBytes,
    /// End key (inclusive).
    pub end: KeyBytes,
}

impl BatchRange {
    /// Create a new range.
    pub fn new(start: KeyBytes, end: KeyBytes) -> Self {
        BatchRange { start, end }
    }

    /// The full key space, min sentinel to max sentinel.
    pub fn full() -> Self {
        BatchRange {
            start: KeyBytes::min_sentinel(),
            end: KeyBytes::max_sentinel(),
        }
    }
}
