//! Missing-index-key validation.
//!
//! While a collection range is being hashed, each consumed document can be
//! cross-checked against the collection's ready indexes: every key the index
//! is expected to hold for the document is probed in the index's sorted key
//! space. A key that is absent, or present but pointing at a different
//! record, is a missing index key. Findings are accumulated on the hasher
//! and reported per document, and never abort the scan.

use serde_json::{json, Value};

use crate::core::RowId;
use crate::error::{CheckError, Result};
use crate::hasher::RangeHasher;
use crate::healthlog::{error_entry, Scope};
use crate::oplog::CheckOperation;
use crate::store::RecordEntry;

/// One index key a document should have but does not.
#[derive(Debug, Clone)]
pub struct MissingKeyEntry {
    /// Name of the index missing the key.
    pub index_name: String,
    /// Catalog spec of that index.
    pub index_spec: Value,
    /// Hex of the expected stored key (row-id suffix included for
    /// non-unique indexes).
    pub key: String,
    /// Record the key should point at.
    pub row_id: RowId,
}

impl RangeHasher {
    /// Probe every ready index for the keys `doc` is expected to have.
    ///
    /// Documents a partial index excludes are skipped for that index. Any
    /// misses are appended to the hasher's findings and reported in one
    /// Error entry for the document.
    pub(crate) async fn verify_document_keys(
        &mut self,
        entry: &RecordEntry,
        doc: &[u8],
    ) -> Result<()> {
        let indexes = self.missing_key_indexes.clone();
        let mut found_misses = Vec::new();

        for index in &indexes {
            if index.partial_filter_excludes(doc)? {
                continue;
            }
            let suffix = if index.is_unique() {
                None
            } else {
                Some(entry.row_id)
            };
            for expected in index.derive_keys(doc, suffix)? {
                self.record_key_probe();
                let mut cursor = index.cursor();
                let hit = cursor.seek(expected.as_bytes()).await?;
                let present = hit.is_some_and(|found| {
                    found.key.without_row_id() == expected.without_row_id()
                        && found.row_id == entry.row_id
                });
                if !present {
                    found_misses.push(MissingKeyEntry {
                        index_name: index.name().to_string(),
                        index_spec: index.spec(),
                        key: hex::encode(expected.as_bytes()),
                        row_id: entry.row_id,
                    });
                }
            }
        }

        if !found_misses.is_empty() {
            self.report_missing_keys(entry, found_misses);
        }
        Ok(())
    }

    fn report_missing_keys(&mut self, entry: &RecordEntry, misses: Vec<MissingKeyEntry>) {
        let nss = self.collection().namespace().clone();
        let uuid = self.collection().uuid();
        let detail: Vec<Value> = misses
            .iter()
            .map(|m| json!({"indexName": m.index_name, "key": m.key, "indexSpec": m.index_spec}))
            .collect();
        self.log_sink().log(error_entry(
            self.parameters(),
            Some(&nss),
            Some(uuid),
            "document has missing index keys",
            Scope::Index,
            CheckOperation::Batch,
            &CheckError::storage("missing index keys"),
            json!({"key": entry.key.to_string(), "rowId": entry.row_id.0, "missing": detail}),
        ));
        self.missing_keys.extend(misses);
    }
}
