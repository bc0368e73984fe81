//! Core value types shared across the check pipeline.

pub mod key;
pub mod namespace;

pub use key::{BatchRange, KeyBytes, KeyString, RowId};
pub use namespace::Namespace;

use serde::{Deserialize, Serialize};

/// A storage-engine logical timestamp. Batches are hashed at a pinned
/// timestamp so every node reads the identical snapshot of the range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a replicated operation in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpTime {
    /// Timestamp component.
    pub ts: Timestamp,
    /// Election term component.
    pub t: i64,
}

impl std::fmt::Display for OpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ts: {}, t: {}}}", self.ts, self.t)
    }
}
