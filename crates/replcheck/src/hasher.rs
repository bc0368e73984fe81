//! Range hashing over one snapshot.
//!
//! A [`RangeHasher`] digests one key range of a collection (or of one
//! secondary index) into an MD5 hash. Every node that hashes the same range
//! at the same pinned timestamp must produce the identical digest, so
//! everything here is deterministic: iteration order, what feeds the digest,
//! and where a batch is allowed to stop.

use md5::{Digest, Md5};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CheckConfig;
use crate::core::{BatchRange, KeyBytes};
use crate::error::{CheckError, Result};
use crate::healthlog::{error_entry, HealthLogSink, Scope, Severity};
use crate::index_check::MissingKeyEntry;
use crate::oplog::{
    CheckOperation, DocValidateMode, SecondaryIndexCheckParameters, ValidationMode,
};
use crate::store::{Collection, DataThrottle, DocumentDefect, IndexAccess, RecordEntry};

/// Incremental hasher over one batch range.
///
/// Ceilings (`max_count`, `max_bytes`) are checked before consuming an item,
/// never after, so the first item of a batch is always accepted and a batch
/// is never empty. For index ranges an additional rule applies: once at a
/// ceiling, keys bytewise-identical to the previous one are still absorbed,
/// so a batch boundary never splits a run of duplicate keys.
pub struct RangeHasher {
    collection: Arc<dyn Collection>,
    range: BatchRange,
    parameters: Option<SecondaryIndexCheckParameters>,
    doc_validate_mode: DocValidateMode,
    max_count: u64,
    max_bytes: u64,
    max_consecutive_identical_keys: u64,
    health_log: Arc<dyn HealthLogSink>,
    throttle: DataThrottle,
    cancel: CancellationToken,
    deadline: Option<Instant>,

    md5: Md5,
    docs_seen: u64,
    keys_seen: u64,
    bytes_seen: u64,
    last_key_seen: KeyBytes,
    identical_run_len: u64,
    pub(crate) missing_key_indexes: Vec<Arc<dyn IndexAccess>>,
    pub(crate) missing_keys: Vec<MissingKeyEntry>,
}

impl RangeHasher {
    /// Set up a hasher over `range`.
    ///
    /// In missing-index-keys mode the collection's ready indexes are
    /// collected up front; kinds the key validator does not understand are
    /// skipped with a debug log, never treated as errors.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collection: Arc<dyn Collection>,
        range: BatchRange,
        parameters: Option<SecondaryIndexCheckParameters>,
        config: &CheckConfig,
        health_log: Arc<dyn HealthLogSink>,
        throttle: DataThrottle,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        let mode = match &parameters {
            Some(p) => p.canonical()?,
            None => ValidationMode::DataConsistency,
        };

        let mut missing_key_indexes = Vec::new();
        if matches!(mode, ValidationMode::DataConsistencyAndMissingIndexKeys) {
            for index in collection.ready_indexes() {
                if index.kind().supports_key_validation() {
                    missing_key_indexes.push(index);
                } else {
                    debug!(
                        namespace = %collection.namespace(),
                        index = index.name(),
                        kind = %index.kind(),
                        "skipping index kind unsupported by key validation"
                    );
                }
            }
        }

        let doc_validate_mode = parameters
            .as_ref()
            .map(|p| p.doc_validate_mode)
            .unwrap_or(DocValidateMode::Default);

        let last_key_seen = range.start.clone();
        Ok(Self {
            collection,
            range,
            parameters,
            doc_validate_mode,
            max_count: config.max_count,
            max_bytes: config.max_bytes,
            max_consecutive_identical_keys: config.max_consecutive_identical_keys,
            health_log,
            throttle,
            cancel,
            deadline,
            md5: Md5::new(),
            docs_seen: 0,
            keys_seen: 0,
            bytes_seen: 0,
            last_key_seen,
            identical_run_len: 0,
            missing_key_indexes,
            missing_keys: Vec::new(),
        })
    }

    /// Documents consumed so far.
    pub fn docs_seen(&self) -> u64 {
        self.docs_seen
    }

    /// Index keys consumed so far.
    pub fn keys_seen(&self) -> u64 {
        self.keys_seen
    }

    /// Items consumed so far. Probed index keys count toward the batch
    /// ceiling exactly like documents do.
    pub fn count_seen(&self) -> u64 {
        self.docs_seen + self.keys_seen
    }

    /// Bytes consumed so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// The last key this batch actually consumed. This is the end the batch
    /// reports, which the next batch starts after.
    pub fn last_key_seen(&self) -> &KeyBytes {
        &self.last_key_seen
    }

    /// Length of the bytewise-identical key run at the batch tail. Zero for
    /// collection ranges.
    pub fn n_consecutive_identical_keys_at_end(&self) -> u64 {
        self.identical_run_len
    }

    /// Hex digest of everything consumed so far. Does not finalize; more
    /// items may still be hashed.
    pub fn digest(&self) -> String {
        hex::encode(self.md5.clone().finalize())
    }

    /// Missing-index-key findings accumulated so far.
    pub fn missing_keys(&self) -> &[MissingKeyEntry] {
        &self.missing_keys
    }

    pub(crate) fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    pub(crate) fn log_sink(&self) -> &Arc<dyn HealthLogSink> {
        &self.health_log
    }

    pub(crate) fn parameters(&self) -> Option<&SecondaryIndexCheckParameters> {
        self.parameters.as_ref()
    }

    /// Index probes count toward the batch ceiling like documents do.
    pub(crate) fn record_key_probe(&mut self) {
        self.keys_seen += 1;
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CheckError::Interrupted);
        }
        Ok(())
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn at_limit(&self) -> bool {
        self.count_seen() >= self.max_count || self.bytes_seen >= self.max_bytes
    }

    /// Hash the collection documents in the range (exclusive start,
    /// inclusive end). Reaching a ceiling or the deadline closes the batch
    /// at the last consumed key; only cancellation is an error.
    pub async fn hash_collection_range(&mut self) -> Result<()> {
        let mut cursor = self.collection.primary_cursor(&self.range)?;
        loop {
            self.check_interrupt()?;
            if self.count_seen() >= self.max_count
                || (self.count_seen() > 0 && self.past_deadline())
            {
                return Ok(());
            }
            let Some(entry) = cursor.next().await? else {
                // Ran off the end of the range: report the range end so the
                // next batch resumes after it.
                self.last_key_seen = self.range.end.clone();
                return Ok(());
            };
            if !self.consume_record(entry).await? {
                return Ok(());
            }
        }
    }

    /// Consume one primary-cursor entry. Returns `false` when the entry was
    /// rejected because its bytes would push the batch past `max_bytes`;
    /// the batch then ends at the previous key and the entry belongs to the
    /// next batch.
    async fn consume_record(&mut self, entry: RecordEntry) -> Result<bool> {
        let nss = self.collection.namespace().clone();
        let uuid = self.collection.uuid();

        let Some(bytes) = self.collection.find_record(entry.row_id).await? else {
            // The primary index points at a record that is not there. Report
            // and keep scanning without consuming the key, so counts and the
            // batch boundary only reflect records that exist; the digest
            // difference surfaces the inconsistency cluster-wide.
            self.health_log.log(error_entry(
                self.parameters.as_ref(),
                Some(&nss),
                Some(uuid),
                "primary index entry with no backing record",
                Scope::Document,
                CheckOperation::Batch,
                &CheckError::storage("record not found"),
                json!({"key": entry.key.to_string(), "rowId": entry.row_id.0}),
            ));
            return Ok(true);
        };

        // Projected byte ceiling. The first item of a batch is exempt so a
        // single oversized document still makes progress.
        if self.count_seen() > 0 && self.bytes_seen + bytes.len() as u64 > self.max_bytes {
            return Ok(false);
        }

        if let Err(defect) = self.collection.validate_document(&bytes, self.doc_validate_mode) {
            // The verdict is a pure function of the bytes, so every node
            // excludes the same documents and digests stay comparable.
            let best_effort = self.doc_validate_mode.best_effort()
                || matches!(defect, DocumentDefect::NonConformant(_));
            let severity = if best_effort {
                Severity::Warning
            } else {
                Severity::Error
            };
            self.health_log.log(crate::healthlog::entry(
                self.parameters.as_ref(),
                Some(&nss),
                Some(uuid),
                severity,
                "document failed structural validation",
                Scope::Document,
                CheckOperation::Batch,
                Some(json!({
                    "success": false,
                    "error": defect.to_string(),
                    "context": {"key": entry.key.to_string(), "rowId": entry.row_id.0},
                })),
            ));
            self.docs_seen += 1;
            self.last_key_seen = entry.key;
            return Ok(true);
        }

        if !self.missing_key_indexes.is_empty() {
            self.verify_document_keys(&entry, &bytes).await?;
        }

        self.md5.update(&bytes);
        self.docs_seen += 1;
        self.bytes_seen += bytes.len() as u64;
        self.last_key_seen = entry.key;
        self.throttle.await_if_needed(bytes.len() as u64).await;
        Ok(true)
    }

    /// Hash one secondary index's keys in the range (inclusive start,
    /// inclusive end). Keys feed the digest with their row-id suffix
    /// stripped: row ids are node-local and must not affect the digest.
    pub async fn hash_index_key_range(&mut self, index: &dyn IndexAccess) -> Result<()> {
        let mut cursor = index.cursor();
        cursor.set_end_position(&self.range.end, true);

        let mut next = cursor.seek(self.range.start.as_bytes()).await?;
        let mut prev_stripped: Option<Vec<u8>> = None;
        loop {
            self.check_interrupt()?;
            let Some(entry) = next.take() else {
                // Exhausted the index inside the range: the max sentinel
                // tells the next batch there is nothing left to resume.
                self.last_key_seen = KeyBytes::max_sentinel();
                return Ok(());
            };

            let stripped = entry.key.without_row_id().to_vec();
            let identical = prev_stripped.as_deref() == Some(stripped.as_slice());
            if prev_stripped.is_some()
                && !identical
                && (self.at_limit() || self.past_deadline())
            {
                return Ok(());
            }

            self.md5.update(&stripped);
            let len = stripped.len() as u64;
            self.keys_seen += 1;
            self.bytes_seen += len;
            self.identical_run_len = if identical {
                self.identical_run_len + 1
            } else {
                1
            };
            self.last_key_seen = KeyBytes::from_bytes(stripped.clone());
            prev_stripped = Some(stripped);
            self.throttle.await_if_needed(len).await;

            // A pathological duplicate run must still terminate the batch
            // at the same point on every node.
            if self.identical_run_len >= self.max_consecutive_identical_keys {
                return Ok(());
            }
            next = cursor.next().await?;
        }
    }
}
