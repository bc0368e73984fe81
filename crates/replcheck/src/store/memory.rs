//! In-memory reference backend.
//!
//! Implements the storage collaborator traits over `BTreeMap`s with JSON
//! documents. Used by the test suite and by embedders that want to exercise
//! the check pipeline without a real storage engine. Reads are served from
//! live data; the pinned read source is recorded but not versioned, so
//! fixtures must not mutate a collection while a scan is running.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::core::key::ROW_ID_SUFFIX_LEN;
use crate::core::{BatchRange, KeyBytes, KeyString, Namespace, RowId};
use crate::error::{CheckError, Result};
use crate::healthlog::{HealthLogEntry, HealthLogSink};
use crate::oplog::DocValidateMode;
use crate::store::traits::{
    Collection, CorruptionMode, DocumentDefect, IndexAccess, IndexCursor, IndexEntry, IndexKind,
    PrepareConflictBehavior, ReadSource, RecordCursor, RecordEntry, StorageEngine,
};

/// Engine-level mutable state: tolerance policies, the pinned snapshot,
/// and the collection catalog.
struct EngineState {
    corruption: CorruptionMode,
    prepare: PrepareConflictBehavior,
    snapshot: Option<ReadSource>,
    collections: HashMap<String, Arc<MemoryCollection>>,
}

/// In-memory storage engine.
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    /// Create an empty engine with default (strict) policies.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                corruption: CorruptionMode::Throw,
                prepare: PrepareConflictBehavior::Enforce,
                snapshot: None,
                collections: HashMap::new(),
            }),
        }
    }

    /// Create and register a collection.
    pub fn create_collection(
        &self,
        nss: &Namespace,
        clustered: bool,
        capped: bool,
    ) -> Arc<MemoryCollection> {
        let coll = Arc::new(MemoryCollection::new(nss.clone(), clustered, capped));
        self.state
            .lock()
            .expect("engine state poisoned")
            .collections
            .insert(nss.to_string(), coll.clone());
        coll
    }

    /// Remove a collection, as a concurrent drop would.
    pub fn drop_collection(&self, nss: &Namespace) {
        self.state
            .lock()
            .expect("engine state poisoned")
            .collections
            .remove(&nss.to_string());
    }

    /// Current corruption-handling mode (test inspection).
    pub fn corruption_mode(&self) -> CorruptionMode {
        self.state.lock().expect("engine state poisoned").corruption
    }

    /// Current prepare-conflict behavior (test inspection).
    pub fn prepare_conflict_behavior(&self) -> PrepareConflictBehavior {
        self.state.lock().expect("engine state poisoned").prepare
    }

    /// Whether a snapshot is currently pinned (test inspection).
    pub fn snapshot_open(&self) -> bool {
        self.state
            .lock()
            .expect("engine state poisoned")
            .snapshot
            .is_some()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn open_snapshot(&self, source: ReadSource) -> Result<()> {
        self.state.lock().expect("engine state poisoned").snapshot = Some(source);
        Ok(())
    }

    fn abandon_snapshot(&self) {
        self.state.lock().expect("engine state poisoned").snapshot = None;
    }

    fn swap_corruption_mode(&self, mode: CorruptionMode) -> CorruptionMode {
        let mut state = self.state.lock().expect("engine state poisoned");
        std::mem::replace(&mut state.corruption, mode)
    }

    fn swap_prepare_conflict_behavior(
        &self,
        behavior: PrepareConflictBehavior,
    ) -> PrepareConflictBehavior {
        let mut state = self.state.lock().expect("engine state poisoned");
        std::mem::replace(&mut state.prepare, behavior)
    }

    fn collection(&self, nss: &Namespace) -> Option<Arc<dyn Collection>> {
        let state = self.state.lock().expect("engine state poisoned");
        state
            .collections
            .get(&nss.to_string())
            .cloned()
            .map(|c| c as Arc<dyn Collection>)
    }
}

/// Record store plus primary index of one collection.
struct CollectionData {
    records: BTreeMap<RowId, Vec<u8>>,
    primary: BTreeMap<Vec<u8>, RowId>,
    next_row_id: i64,
}

/// In-memory collection with JSON documents.
pub struct MemoryCollection {
    nss: Namespace,
    uuid: Uuid,
    clustered: bool,
    capped: bool,
    data: RwLock<CollectionData>,
    indexes: RwLock<Vec<Arc<MemoryIndex>>>,
}

impl MemoryCollection {
    fn new(nss: Namespace, clustered: bool, capped: bool) -> Self {
        Self {
            nss,
            uuid: Uuid::new_v4(),
            clustered,
            capped,
            data: RwLock::new(CollectionData {
                records: BTreeMap::new(),
                primary: BTreeMap::new(),
                next_row_id: 1,
            }),
            indexes: RwLock::new(Vec::new()),
        }
    }

    /// Register a secondary index over a single top-level field. Existing
    /// documents are indexed immediately.
    pub fn add_index(
        &self,
        name: &str,
        field: &str,
        kind: IndexKind,
        unique: bool,
        partial_filter: Option<PartialFilter>,
    ) -> Arc<MemoryIndex> {
        let index = Arc::new(MemoryIndex {
            name: name.to_string(),
            field: field.to_string(),
            kind,
            unique,
            partial_filter,
            entries: RwLock::new(BTreeMap::new()),
        });
        {
            let data = self.data.read().expect("collection data poisoned");
            for (row_id, bytes) in &data.records {
                if let Ok(doc) = serde_json::from_slice::<Value>(bytes) {
                    index.index_document(&doc, *row_id);
                }
            }
        }
        self.indexes
            .write()
            .expect("index catalog poisoned")
            .push(index.clone());
        index
    }

    /// Insert a document. It must carry a scalar `_id`.
    pub fn insert(&self, doc: Value) -> Result<RowId> {
        let id_value = doc
            .get("_id")
            .ok_or_else(|| CheckError::storage("document missing _id"))?;
        let key = KeyBytes::encode_value(id_value)?;
        let bytes = serde_json::to_vec(&doc)?;

        let row_id = {
            let mut data = self.data.write().expect("collection data poisoned");
            let row_id = RowId(data.next_row_id);
            data.next_row_id += 1;
            data.records.insert(row_id, bytes);
            data.primary.insert(key.as_bytes().to_vec(), row_id);
            row_id
        };

        for index in self.indexes.read().expect("index catalog poisoned").iter() {
            index.index_document(&doc, row_id);
        }
        Ok(row_id)
    }

    /// Fault injection: delete a record's bytes while leaving its primary
    /// index entry in place.
    pub fn remove_record(&self, row_id: RowId) {
        self.data
            .write()
            .expect("collection data poisoned")
            .records
            .remove(&row_id);
    }

    /// Fault injection: overwrite a record's raw bytes without reindexing.
    pub fn corrupt_record(&self, row_id: RowId, bytes: Vec<u8>) {
        self.data
            .write()
            .expect("collection data poisoned")
            .records
            .insert(row_id, bytes);
    }

    /// Fault injection: drop every entry of `index_name` that points at
    /// `row_id`, as an out-of-band index corruption would.
    pub fn remove_index_entries(&self, index_name: &str, row_id: RowId) {
        let indexes = self.indexes.read().expect("index catalog poisoned");
        if let Some(index) = indexes.iter().find(|i| i.name == index_name) {
            index
                .entries
                .write()
                .expect("index entries poisoned")
                .retain(|_, rid| *rid != row_id);
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.nss
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn is_clustered(&self) -> bool {
        self.clustered
    }

    fn is_capped(&self) -> bool {
        self.capped
    }

    fn primary_cursor(&self, range: &BatchRange) -> Result<Box<dyn RecordCursor>> {
        let data = self.data.read().expect("collection data poisoned");
        let entries: VecDeque<RecordEntry> = data
            .primary
            .iter()
            .filter(|(key, _)| {
                key.as_slice() > range.start.as_bytes() && key.as_slice() <= range.end.as_bytes()
            })
            .map(|(key, row_id)| RecordEntry {
                key: KeyBytes::from_bytes(key.clone()),
                row_id: *row_id,
            })
            .collect();
        Ok(Box::new(MemoryRecordCursor { entries }))
    }

    async fn find_record(&self, row_id: RowId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .expect("collection data poisoned")
            .records
            .get(&row_id)
            .cloned())
    }

    fn ready_indexes(&self) -> Vec<Arc<dyn IndexAccess>> {
        self.indexes
            .read()
            .expect("index catalog poisoned")
            .iter()
            .map(|i| i.clone() as Arc<dyn IndexAccess>)
            .collect()
    }

    fn index(&self, name: &str) -> Option<Arc<dyn IndexAccess>> {
        self.indexes
            .read()
            .expect("index catalog poisoned")
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.clone() as Arc<dyn IndexAccess>)
    }

    fn validate_document(
        &self,
        bytes: &[u8],
        mode: DocValidateMode,
    ) -> std::result::Result<(), DocumentDefect> {
        let doc: Value = serde_json::from_slice(bytes)
            .map_err(|e| DocumentDefect::Corrupt(e.to_string()))?;
        if matches!(mode, DocValidateMode::Extended | DocValidateMode::Full)
            && !doc.is_object()
        {
            return Err(DocumentDefect::NonConformant(
                "top-level value is not an object".into(),
            ));
        }
        if matches!(mode, DocValidateMode::Full) && doc.get("_id").is_none() {
            return Err(DocumentDefect::NonConformant("missing _id field".into()));
        }
        Ok(())
    }
}

struct MemoryRecordCursor {
    entries: VecDeque<RecordEntry>,
}

#[async_trait]
impl RecordCursor for MemoryRecordCursor {
    async fn next(&mut self) -> Result<Option<RecordEntry>> {
        Ok(self.entries.pop_front())
    }
}

/// Partial-index predicate: the field must hold a scalar, non-null value,
/// optionally at least `gte`.
///
/// Known limitation: the range-matching semantics for empty-array and
/// nested-array path values are unresolved upstream; this evaluation treats
/// any array or object value as excluded rather than guessing.
#[derive(Debug, Clone)]
pub struct PartialFilter {
    /// Field the predicate applies to.
    pub field: String,
    /// Minimum numeric value, when set.
    pub gte: Option<f64>,
}

impl PartialFilter {
    fn matches(&self, doc: &Value) -> bool {
        match doc.get(&self.field) {
            None | Some(Value::Null) => false,
            Some(Value::Array(_)) | Some(Value::Object(_)) => false,
            Some(value) => match self.gte {
                None => true,
                Some(min) => value.as_f64().is_some_and(|v| v >= min),
            },
        }
    }
}

/// In-memory secondary index over one top-level field.
pub struct MemoryIndex {
    name: String,
    field: String,
    kind: IndexKind,
    unique: bool,
    partial_filter: Option<PartialFilter>,
    /// Stored entries: full key bytes (row-id suffix included for
    /// non-unique indexes) mapped to the owning row id.
    entries: RwLock<BTreeMap<Vec<u8>, RowId>>,
}

impl MemoryIndex {
    fn row_id_len(&self) -> usize {
        if self.unique {
            0
        } else {
            ROW_ID_SUFFIX_LEN
        }
    }

    /// Encoded key values this index derives from a document. A missing
    /// field or an empty array indexes as null; array elements index
    /// individually; nested arrays and objects are skipped (see
    /// [`PartialFilter`] on the unresolved array semantics).
    fn key_values(&self, doc: &Value) -> Vec<KeyBytes> {
        let value = doc.get(&self.field).unwrap_or(&Value::Null);
        let candidates: Vec<&Value> = match value {
            Value::Array(elems) if elems.is_empty() => vec![&Value::Null],
            Value::Array(elems) => elems
                .iter()
                .filter(|e| !matches!(e, Value::Array(_) | Value::Object(_)))
                .collect(),
            Value::Object(_) => Vec::new(),
            scalar => vec![scalar],
        };
        candidates
            .into_iter()
            .filter_map(|v| KeyBytes::encode_value(v).ok())
            .collect()
    }

    fn index_document(&self, doc: &Value, row_id: RowId) {
        if let Some(filter) = &self.partial_filter {
            if !filter.matches(doc) {
                return;
            }
        }
        let suffix = if self.unique { None } else { Some(row_id) };
        let mut entries = self.entries.write().expect("index entries poisoned");
        for key in self.key_values(doc) {
            let stored = KeyString::new(key, suffix);
            entries.insert(stored.as_bytes().to_vec(), row_id);
        }
    }

    /// Insert a raw entry directly, bypassing key derivation. Fault
    /// injection for extra-index-keys tests.
    pub fn insert_raw_entry(&self, key: KeyBytes, row_id: RowId) {
        let suffix = if self.unique { None } else { Some(row_id) };
        let stored = KeyString::new(key, suffix);
        self.entries
            .write()
            .expect("index entries poisoned")
            .insert(stored.as_bytes().to_vec(), row_id);
    }
}

impl IndexAccess for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        self.kind
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn spec(&self) -> Value {
        let mut spec = json!({
            "name": self.name,
            "key": { &self.field: 1 },
            "kind": self.kind.to_string(),
            "unique": self.unique,
        });
        if let Some(filter) = &self.partial_filter {
            spec["partialFilterExpression"] = match filter.gte {
                Some(min) => json!({ &filter.field: {"$gte": min} }),
                None => json!({ &filter.field: {"$exists": true} }),
            };
        }
        spec
    }

    fn partial_filter_excludes(&self, doc: &[u8]) -> Result<bool> {
        let Some(filter) = &self.partial_filter else {
            return Ok(false);
        };
        let doc: Value = serde_json::from_slice(doc)
            .map_err(|e| CheckError::MalformedDocument(e.to_string()))?;
        Ok(!filter.matches(&doc))
    }

    fn derive_keys(&self, doc: &[u8], row_id: Option<RowId>) -> Result<Vec<KeyString>> {
        let doc: Value = serde_json::from_slice(doc)
            .map_err(|e| CheckError::MalformedDocument(e.to_string()))?;
        Ok(self
            .key_values(&doc)
            .into_iter()
            .map(|key| KeyString::new(key, row_id))
            .collect())
    }

    fn cursor(&self) -> Box<dyn IndexCursor> {
        Box::new(MemoryIndexCursor {
            entries: self.entries.read().expect("index entries poisoned").clone(),
            row_id_len: self.row_id_len(),
            position: None,
            end: None,
        })
    }
}

struct MemoryIndexCursor {
    /// Snapshot of the index at cursor-open time.
    entries: BTreeMap<Vec<u8>, RowId>,
    row_id_len: usize,
    /// Full key bytes of the last returned entry.
    position: Option<Vec<u8>>,
    end: Option<(Vec<u8>, bool)>,
}

impl MemoryIndexCursor {
    fn within_end(&self, full_key: &[u8]) -> bool {
        let Some((end, inclusive)) = &self.end else {
            return true;
        };
        let stripped = &full_key[..full_key.len() - self.row_id_len];
        if *inclusive {
            stripped <= end.as_slice()
        } else {
            stripped < end.as_slice()
        }
    }

    fn entry_at(&self, full_key: &[u8], row_id: RowId) -> IndexEntry {
        IndexEntry {
            key: KeyString::from_raw(full_key.to_vec(), self.row_id_len),
            row_id,
        }
    }

    fn first_from(&mut self, lower: std::ops::Bound<Vec<u8>>) -> Option<IndexEntry> {
        let (key, row_id) = self
            .entries
            .range((lower, std::ops::Bound::Unbounded))
            .next()
            .map(|(k, r)| (k.clone(), *r))?;
        if !self.within_end(&key) {
            return None;
        }
        self.position = Some(key.clone());
        Some(self.entry_at(&key, row_id))
    }
}

#[async_trait]
impl IndexCursor for MemoryIndexCursor {
    fn set_end_position(&mut self, end: &KeyBytes, inclusive: bool) {
        self.end = Some((end.as_bytes().to_vec(), inclusive));
    }

    async fn seek(&mut self, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self.first_from(std::ops::Bound::Included(key.to_vec())))
    }

    async fn next(&mut self) -> Result<Option<IndexEntry>> {
        let Some(position) = self.position.clone() else {
            return Ok(self.first_from(std::ops::Bound::Unbounded));
        };
        Ok(self.first_from(std::ops::Bound::Excluded(position)))
    }
}

/// Health-log sink that collects entries in memory.
#[derive(Default)]
pub struct MemoryHealthLog {
    entries: Mutex<Vec<HealthLogEntry>>,
}

impl MemoryHealthLog {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries appended so far.
    pub fn entries(&self) -> Vec<HealthLogEntry> {
        self.entries.lock().expect("health log poisoned").clone()
    }
}

impl HealthLogSink for MemoryHealthLog {
    fn log(&self, entry: HealthLogEntry) {
        self.entries.lock().expect("health log poisoned").push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> (Arc<MemoryEngine>, Arc<MemoryCollection>) {
        let engine = Arc::new(MemoryEngine::new());
        let coll = engine.create_collection(&Namespace::parse("app.orders").unwrap(), false, false);
        (engine, coll)
    }

    #[tokio::test]
    async fn test_primary_cursor_bounds() {
        let (_engine, coll) = orders();
        for id in 1..=5 {
            coll.insert(json!({"_id": id})).unwrap();
        }
        let start = KeyBytes::encode_value(&json!(2)).unwrap();
        let end = KeyBytes::encode_value(&json!(4)).unwrap();
        let mut cursor = coll
            .primary_cursor(&BatchRange::new(start, end))
            .unwrap();

        let mut seen = Vec::new();
        while let Some(entry) = cursor.next().await.unwrap() {
            seen.push(entry.key);
        }
        // Exclusive start, inclusive end.
        assert_eq!(
            seen,
            vec![
                KeyBytes::encode_value(&json!(3)).unwrap(),
                KeyBytes::encode_value(&json!(4)).unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_index_cursor_seek_and_end_position() {
        let (_engine, coll) = orders();
        let index = coll.add_index("qty_1", "qty", IndexKind::Btree, false, None);
        for (id, qty) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            coll.insert(json!({"_id": id, "qty": qty})).unwrap();
        }

        let mut cursor = index.cursor();
        cursor.set_end_position(&KeyBytes::encode_value(&json!(30)).unwrap(), true);
        let start = KeyBytes::encode_value(&json!(20)).unwrap();
        let first = cursor.seek(start.as_bytes()).await.unwrap().unwrap();
        assert_eq!(first.key.without_row_id(), start.as_bytes());

        let second = cursor.next().await.unwrap().unwrap();
        assert_eq!(
            second.key.without_row_id(),
            KeyBytes::encode_value(&json!(30)).unwrap().as_bytes()
        );
        // 40 is past the inclusive end.
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[test]
    fn test_index_derives_keys_per_array_element() {
        let (_engine, coll) = orders();
        let index = coll.add_index("tags_1", "tags", IndexKind::Btree, false, None);
        let doc = serde_json::to_vec(&json!({"_id": 1, "tags": ["a", "b"]})).unwrap();
        let keys = index.derive_keys(&doc, Some(RowId(7))).unwrap();
        assert_eq!(keys.len(), 2);

        let empty = serde_json::to_vec(&json!({"_id": 2, "tags": []})).unwrap();
        let keys = index.derive_keys(&empty, Some(RowId(8))).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(
            keys[0].without_row_id(),
            KeyBytes::encode_value(&json!(null)).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_partial_filter_excludes() {
        let (_engine, coll) = orders();
        let index = coll.add_index(
            "qty_partial",
            "qty",
            IndexKind::Btree,
            false,
            Some(PartialFilter {
                field: "qty".into(),
                gte: Some(10.0),
            }),
        );
        let small = serde_json::to_vec(&json!({"_id": 1, "qty": 5})).unwrap();
        let big = serde_json::to_vec(&json!({"_id": 2, "qty": 50})).unwrap();
        let arr = serde_json::to_vec(&json!({"_id": 3, "qty": [50]})).unwrap();
        assert!(index.partial_filter_excludes(&small).unwrap());
        assert!(!index.partial_filter_excludes(&big).unwrap());
        // Array values are conservatively excluded; see PartialFilter.
        assert!(index.partial_filter_excludes(&arr).unwrap());
    }

    #[test]
    fn test_validate_document_modes() {
        let (_engine, coll) = orders();
        assert!(coll.validate_document(b"not json", DocValidateMode::Default).is_err());
        assert!(coll.validate_document(b"[1,2]", DocValidateMode::Default).is_ok());
        assert!(matches!(
            coll.validate_document(b"[1,2]", DocValidateMode::Extended),
            Err(DocumentDefect::NonConformant(_))
        ));
        assert!(matches!(
            coll.validate_document(b"{\"a\":1}", DocValidateMode::Full),
            Err(DocumentDefect::NonConformant(_))
        ));
        assert!(coll
            .validate_document(b"{\"_id\":1}", DocValidateMode::Full)
            .is_ok());
    }
}
