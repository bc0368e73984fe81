//! Wire descriptors replicated through the oplog.
//!
//! The primary emits one descriptor per proposed batch plus start/stop
//! markers bracketing a run. Secondaries decode these during oplog
//! application and hand them to the verifier. Decoding is the only place
//! that understands the legacy `{minKey,maxKey}` boundary encoding; the
//! rest of the pipeline sees one canonical [`BatchRange`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{BatchRange, KeyBytes, Namespace, Timestamp};
use crate::error::{CheckError, Result};

/// Kind of check operation a descriptor or health-log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOperation {
    /// One hashed batch.
    Batch,
    /// Per-collection metadata check (reserved).
    Collection,
    /// Run start marker.
    Start,
    /// Run stop marker.
    Stop,
}

impl CheckOperation {
    /// Operation name as written to the health log.
    pub fn render(&self) -> &'static str {
        match self {
            CheckOperation::Batch => "replCheckBatch",
            CheckOperation::Collection => "replCheckCollection",
            CheckOperation::Start => "replCheckStart",
            CheckOperation::Stop => "replCheckStop",
        }
    }
}

/// Wire form of the validation mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidateMode {
    /// Hash documents only.
    DataConsistency,
    /// Hash documents and cross-check their expected index keys.
    DataConsistencyAndMissingIndexKeysCheck,
    /// Hash one secondary index's key range.
    ExtraIndexKeysCheck,
}

/// Structural validation strictness for raw stored documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocValidateMode {
    /// Baseline structural checks.
    #[default]
    Default,
    /// Stricter conformance checks; failures are Warning-severity because
    /// documents predating the stricter modes may legitimately trip them.
    Extended,
    /// Strictest conformance checks; failures are Warning-severity.
    Full,
}

impl DocValidateMode {
    /// Whether a failure under this mode is reported as a Warning rather
    /// than an Error.
    pub fn best_effort(&self) -> bool {
        !matches!(self, DocValidateMode::Default)
    }
}

/// Validation parameters carried on batch and start/stop descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryIndexCheckParameters {
    /// Which cursor is opened and which per-item checks run.
    pub validate_mode: ValidateMode,
    /// Index under check in extra-index-keys mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_index_name: Option<String>,
    /// Structural validation strictness for stored documents.
    #[serde(rename = "bsonValidateMode", default)]
    pub doc_validate_mode: DocValidateMode,
}

impl SecondaryIndexCheckParameters {
    /// Parameters for a plain data-consistency run.
    pub fn data_consistency() -> Self {
        Self {
            validate_mode: ValidateMode::DataConsistency,
            secondary_index_name: None,
            doc_validate_mode: DocValidateMode::default(),
        }
    }

    /// Parameters for a data-consistency run with missing-index-keys checks.
    pub fn missing_index_keys(doc_validate_mode: DocValidateMode) -> Self {
        Self {
            validate_mode: ValidateMode::DataConsistencyAndMissingIndexKeysCheck,
            secondary_index_name: None,
            doc_validate_mode,
        }
    }

    /// Parameters for an extra-index-keys run over `index_name`.
    pub fn extra_index_keys(index_name: impl Into<String>) -> Self {
        Self {
            validate_mode: ValidateMode::ExtraIndexKeysCheck,
            secondary_index_name: Some(index_name.into()),
            doc_validate_mode: DocValidateMode::default(),
        }
    }

    /// Resolve the wire fields into the canonical validation mode.
    pub fn canonical(&self) -> Result<ValidationMode> {
        match self.validate_mode {
            ValidateMode::DataConsistency => Ok(ValidationMode::DataConsistency),
            ValidateMode::DataConsistencyAndMissingIndexKeysCheck => {
                Ok(ValidationMode::DataConsistencyAndMissingIndexKeys)
            }
            ValidateMode::ExtraIndexKeysCheck => {
                let index_name = self.secondary_index_name.clone().ok_or_else(|| {
                    CheckError::descriptor("extraIndexKeysCheck requires secondaryIndexName")
                })?;
                Ok(ValidationMode::ExtraIndexKeys { index_name })
            }
        }
    }
}

/// Canonical validation mode, resolved from the wire parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationMode {
    /// Hash documents in the primary-key space.
    DataConsistency,
    /// Hash documents and cross-check expected index keys per document.
    DataConsistencyAndMissingIndexKeys,
    /// Hash the named index's key range.
    ExtraIndexKeys {
        /// Index under check.
        index_name: String,
    },
}

/// A batch descriptor as replicated through the oplog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOplogEntry {
    /// Namespace under check.
    pub nss: Namespace,
    /// Current boundary encoding: encoded start key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_start: Option<KeyBytes>,
    /// Current boundary encoding: encoded end key (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_end: Option<KeyBytes>,
    /// Legacy boundary encoding: raw start `_id` value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_key: Option<Value>,
    /// Legacy boundary encoding: raw end `_id` value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_key: Option<Value>,
    /// Digest the primary computed for this range, lowercase hex.
    pub md5: String,
    /// Snapshot timestamp both nodes hash at.
    pub read_timestamp: Timestamp,
    /// Batch id, for correlating entries across nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    /// Validation parameters; absent means plain data consistency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_index_check_parameters: Option<SecondaryIndexCheckParameters>,
    /// Explicit per-batch override of the Info-outcome sampling policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_batch_to_health_log: Option<bool>,
}

impl BatchOplogEntry {
    /// Decode the boundary fields into one canonical range.
    ///
    /// This is the sole place the legacy `{minKey,maxKey}` shim lives:
    /// legacy descriptors carry raw `_id` values, which are run through the
    /// same key encoding the current fields carry pre-encoded.
    pub fn decode_range(&self) -> Result<BatchRange> {
        let start = match (&self.batch_start, &self.min_key) {
            (Some(key), _) => key.clone(),
            (None, Some(value)) => KeyBytes::encode_value(value)?,
            (None, None) => {
                return Err(CheckError::descriptor(
                    "batch descriptor has neither batchStart nor minKey",
                ))
            }
        };
        let end = match (&self.batch_end, &self.max_key) {
            (Some(key), _) => key.clone(),
            (None, Some(value)) => KeyBytes::encode_value(value)?,
            (None, None) => {
                return Err(CheckError::descriptor(
                    "batch descriptor has neither batchEnd nor maxKey",
                ))
            }
        };
        Ok(BatchRange::new(start, end))
    }

    /// Resolve the canonical validation mode for this batch.
    pub fn validation_mode(&self) -> Result<ValidationMode> {
        match &self.secondary_index_check_parameters {
            Some(parameters) => parameters.canonical(),
            None => Ok(ValidationMode::DataConsistency),
        }
    }
}

/// Start/stop marker bracketing a check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStopOplogEntry {
    /// Namespace the run covers.
    pub nss: Namespace,
    /// Collection UUID, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    /// The run's validation parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_index_check_parameters: Option<SecondaryIndexCheckParameters>,
}

/// Reserved per-collection descriptor. Currently a no-op on apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOplogEntry {
    /// Namespace the descriptor refers to.
    pub nss: Namespace,
}

/// A decoded check command from the oplog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CheckOplogEntry {
    /// One batch to verify.
    Batch(BatchOplogEntry),
    /// Reserved.
    Collection(CollectionOplogEntry),
    /// Run start marker.
    Start(StartStopOplogEntry),
    /// Run stop marker.
    Stop(StartStopOplogEntry),
}

impl CheckOplogEntry {
    /// The operation kind, for health-log rendering.
    pub fn operation(&self) -> CheckOperation {
        match self {
            CheckOplogEntry::Batch(_) => CheckOperation::Batch,
            CheckOplogEntry::Collection(_) => CheckOperation::Collection,
            CheckOplogEntry::Start(_) => CheckOperation::Start,
            CheckOplogEntry::Stop(_) => CheckOperation::Stop,
        }
    }
}

/// How the node is applying oplog entries when a descriptor arrives.
///
/// Batches only run in steady-state secondary application; every other mode
/// acknowledges the descriptor with a Warning entry instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Steady-state secondary application.
    Secondary,
    /// Initial sync.
    InitialSync,
    /// Recovery without a stable checkpoint.
    UnstableRecovering,
    /// Recovery from a stable checkpoint.
    StableRecovering,
    /// Direct applyOps command.
    ApplyOps,
}

impl std::fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyMode::Secondary => "secondary",
            ApplyMode::InitialSync => "initial sync",
            ApplyMode::UnstableRecovering => "unstable recovering",
            ApplyMode::StableRecovering => "stable recovering",
            ApplyMode::ApplyOps => "applyOps",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_entry() -> BatchOplogEntry {
        BatchOplogEntry {
            nss: Namespace::parse("app.orders").unwrap(),
            batch_start: None,
            batch_end: None,
            min_key: None,
            max_key: None,
            md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
            read_timestamp: Timestamp(10),
            batch_id: None,
            secondary_index_check_parameters: None,
            log_batch_to_health_log: None,
        }
    }

    #[test]
    fn test_legacy_and_current_boundaries_decode_identically() {
        let mut legacy = batch_entry();
        legacy.min_key = Some(json!(1));
        legacy.max_key = Some(json!(9));
        let legacy_range = legacy.decode_range().unwrap();

        let mut current = batch_entry();
        current.batch_start = Some(KeyBytes::encode_value(&json!(1)).unwrap());
        current.batch_end = Some(KeyBytes::encode_value(&json!(9)).unwrap());
        let current_range = current.decode_range().unwrap();

        assert_eq!(legacy_range, current_range);
    }

    #[test]
    fn test_current_boundaries_win_over_legacy() {
        let mut entry = batch_entry();
        entry.batch_start = Some(KeyBytes::encode_value(&json!(5)).unwrap());
        entry.batch_end = Some(KeyBytes::encode_value(&json!(6)).unwrap());
        entry.min_key = Some(json!(1));
        entry.max_key = Some(json!(9));
        let range = entry.decode_range().unwrap();
        assert_eq!(range.start, KeyBytes::encode_value(&json!(5)).unwrap());
        assert_eq!(range.end, KeyBytes::encode_value(&json!(6)).unwrap());
    }

    #[test]
    fn test_missing_boundaries_rejected() {
        assert!(batch_entry().decode_range().is_err());
    }

    #[test]
    fn test_extra_keys_requires_index_name() {
        let mut params = SecondaryIndexCheckParameters::extra_index_keys("a_1");
        assert!(matches!(
            params.canonical().unwrap(),
            ValidationMode::ExtraIndexKeys { index_name } if index_name == "a_1"
        ));
        params.secondary_index_name = None;
        assert!(params.canonical().is_err());
    }

    #[test]
    fn test_oplog_entry_serde_tagged() {
        let entry = CheckOplogEntry::Start(StartStopOplogEntry {
            nss: Namespace::parse("app.orders").unwrap(),
            uuid: None,
            secondary_index_check_parameters: Some(
                SecondaryIndexCheckParameters::data_consistency(),
            ),
        });
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(wire["type"], "start");
        assert_eq!(
            wire["secondaryIndexCheckParameters"]["validateMode"],
            "dataConsistency"
        );
        let back: CheckOplogEntry = serde_json::from_value(wire).unwrap();
        assert!(matches!(back, CheckOplogEntry::Start(_)));
    }

    #[test]
    fn test_doc_validate_mode_default_on_wire() {
        let wire = json!({"validateMode": "dataConsistency"});
        let params: SecondaryIndexCheckParameters = serde_json::from_value(wire).unwrap();
        assert_eq!(params.doc_validate_mode, DocValidateMode::Default);
        assert!(!params.doc_validate_mode.best_effort());
        assert!(DocValidateMode::Extended.best_effort());
    }
}
