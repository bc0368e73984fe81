//! Collaborator interfaces consumed by the check pipeline.
//!
//! The storage engine's snapshot, cursor, record-store, and index-catalog
//! primitives are given, not redesigned here. The checker only reads: every
//! resource acquired through these traits is read-only for the duration of
//! an acquisition and released deterministically on every exit path.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::{BatchRange, KeyBytes, KeyString, Namespace, RowId, Timestamp};
use crate::error::Result;
use crate::oplog::DocValidateMode;

/// Where a read operation sources its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Read the latest committed data.
    Latest,
    /// Read at a pinned timestamp. Batch verification always pins, so both
    /// nodes hash the identical snapshot of the range.
    Provided(Timestamp),
}

/// How detected on-disk corruption is handled while a scan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionMode {
    /// Fail the operation (node-wide default).
    Throw,
    /// Report to the health log and keep scanning. The checker swaps this
    /// in for the duration of an acquisition: corruption sites already
    /// write to the health log, and the scan must reach the end of the
    /// batch to produce a comparable digest.
    LogAndContinue,
}

/// How reads behave when they encounter a prepared-transaction conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareConflictBehavior {
    /// Block until the prepared transaction resolves (node-wide default).
    Enforce,
    /// Ignore the conflict and read around it. Secondaries must use this:
    /// a document can be prepared after the primary scanned it and before
    /// the batch descriptor replicates.
    Ignore,
}

/// Handle to the storage engine's per-operation recovery/snapshot machinery.
pub trait StorageEngine: Send + Sync {
    /// Pin a snapshot for subsequent reads.
    fn open_snapshot(&self, source: ReadSource) -> Result<()>;

    /// Abandon the pinned snapshot. Idempotent.
    fn abandon_snapshot(&self);

    /// Swap the corruption-handling mode, returning the previous one.
    fn swap_corruption_mode(&self, mode: CorruptionMode) -> CorruptionMode;

    /// Swap the prepare-conflict behavior, returning the previous one.
    fn swap_prepare_conflict_behavior(
        &self,
        behavior: PrepareConflictBehavior,
    ) -> PrepareConflictBehavior;

    /// Resolve a collection in the pinned snapshot. `None` when the
    /// collection does not exist (any more) at that point in time.
    fn collection(&self, nss: &Namespace) -> Option<Arc<dyn Collection>>;
}

/// One entry from a primary-key-space cursor: the encoded key and the row
/// identifier it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// Encoded primary key (or clustering key).
    pub key: KeyBytes,
    /// Row identifier of the backing record.
    pub row_id: RowId,
}

/// Ordered cursor over a collection's primary-key space.
#[async_trait]
pub trait RecordCursor: Send {
    /// Next entry in key order, `None` at the end of the bounded range.
    async fn next(&mut self) -> Result<Option<RecordEntry>>;
}

/// One entry from a secondary-index cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The stored key, with its row-id suffix when the index is non-unique.
    pub key: KeyString,
    /// Row identifier the entry points at.
    pub row_id: RowId,
}

/// Ordered cursor over one secondary index's key space, with seek and an
/// inclusive end position.
#[async_trait]
pub trait IndexCursor: Send {
    /// Bound the cursor: entries whose row-id-stripped key sorts after
    /// `end` are never returned. Inclusive when `inclusive` is set.
    fn set_end_position(&mut self, end: &KeyBytes, inclusive: bool);

    /// Position at the first entry whose key is `>= key` and return it.
    async fn seek(&mut self, key: &[u8]) -> Result<Option<IndexEntry>>;

    /// Next entry in key order.
    async fn next(&mut self) -> Result<Option<IndexEntry>>;
}

/// Kind of a secondary index. A closed set: per-kind behavior is a match
/// over this enum, never a comparison of access-method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Ordered tree index.
    Btree,
    /// Hashed index.
    Hashed,
    /// Wildcard index.
    Wildcard,
    /// Text index.
    Text,
    /// Geospatial index.
    TwoDSphere,
}

impl IndexKind {
    /// Whether the missing-index-keys validator understands this kind.
    /// Unsupported kinds are skipped at low severity, not treated as errors.
    pub fn supports_key_validation(&self) -> bool {
        matches!(self, IndexKind::Btree | IndexKind::Hashed)
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Btree => "btree",
            IndexKind::Hashed => "hashed",
            IndexKind::Wildcard => "wildcard",
            IndexKind::Text => "text",
            IndexKind::TwoDSphere => "2dsphere",
        };
        f.write_str(name)
    }
}

/// Catalog view of one ready secondary index.
pub trait IndexAccess: Send + Sync {
    /// Index name.
    fn name(&self) -> &str;

    /// Index kind.
    fn kind(&self) -> IndexKind;

    /// Whether the index is unique. Unique indexes store keys without a
    /// row-id suffix; non-unique indexes append one.
    fn is_unique(&self) -> bool;

    /// The index specification, as recorded in the catalog.
    fn spec(&self) -> serde_json::Value;

    /// Whether a partial-index predicate excludes this document.
    /// Non-partial indexes never exclude.
    fn partial_filter_excludes(&self, doc: &[u8]) -> Result<bool>;

    /// Recompute the keys this index is expected to hold for a document.
    /// `row_id` is appended to each key when `Some` (non-unique indexes).
    fn derive_keys(&self, doc: &[u8], row_id: Option<RowId>) -> Result<Vec<KeyString>>;

    /// Open a cursor over the index's sorted key space.
    fn cursor(&self) -> Box<dyn IndexCursor>;
}

/// A structural defect found in raw stored document bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentDefect {
    /// The bytes are corrupt; reported at Error severity.
    Corrupt(String),
    /// The bytes parse but violate a conformance rule introduced by the
    /// extended validation modes; reported at Warning severity because
    /// older documents may predate the rule.
    NonConformant(String),
}

impl std::fmt::Display for DocumentDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentDefect::Corrupt(msg) => write!(f, "corrupt document: {msg}"),
            DocumentDefect::NonConformant(msg) => write!(f, "non-conformant document: {msg}"),
        }
    }
}

/// Read-only handle to one collection inside a pinned snapshot.
#[async_trait]
pub trait Collection: Send + Sync {
    /// The collection's namespace.
    fn namespace(&self) -> &Namespace;

    /// The collection's UUID.
    fn uuid(&self) -> uuid::Uuid;

    /// Whether the collection is clustered: its primary storage order is
    /// its own primary key, so range scans walk the record store directly
    /// instead of an `_id` index.
    fn is_clustered(&self) -> bool;

    /// Whether the collection is capped.
    fn is_capped(&self) -> bool;

    /// Open a cursor over the primary-key space bounded by `range`
    /// (exclusive start, inclusive end). For clustered collections this is
    /// a native clustering-key scan; otherwise an `_id`-index scan.
    fn primary_cursor(&self, range: &BatchRange) -> Result<Box<dyn RecordCursor>>;

    /// Point lookup of a record's raw bytes by row identifier. `None` when
    /// the row id has no backing record.
    async fn find_record(&self, row_id: RowId) -> Result<Option<Vec<u8>>>;

    /// Ready secondary indexes, excluding the `_id` index.
    fn ready_indexes(&self) -> Vec<Arc<dyn IndexAccess>>;

    /// Look up a ready index by name.
    fn index(&self, name: &str) -> Option<Arc<dyn IndexAccess>>;

    /// Structurally validate raw stored bytes at the given strictness.
    fn validate_document(
        &self,
        bytes: &[u8],
        mode: DocValidateMode,
    ) -> std::result::Result<(), DocumentDefect>;
}
