//! Health-log entry model and builders.
//!
//! Every outcome of a consistency check (match, mismatch, per-item anomaly,
//! skipped batch) is reported as a structured, append-only audit record.
//! The persistence sink behind [`HealthLogSink`] is an external collaborator;
//! this module only formats entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::{KeyBytes, Namespace, OpTime, Timestamp};
use crate::error::CheckError;
use crate::oplog::{CheckOperation, SecondaryIndexCheckParameters};

/// Severity of a health-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected outcome (consistent batch, run started/stopped).
    Info,
    /// Anomalous but tolerated (benign-skew collections, skipped batches).
    Warning,
    /// An inconsistency or a failure that needs operator attention.
    Error,
}

/// Granularity a health-log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The whole replica set (batch outcomes compare nodes).
    Cluster,
    /// One collection.
    Collection,
    /// One document.
    Document,
    /// One index.
    Index,
}

/// One append-only audit record. Never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthLogEntry {
    /// Namespace the entry refers to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nss: Option<Namespace>,
    /// Collection UUID, when the collection was resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_uuid: Option<Uuid>,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
    /// Entry severity.
    pub severity: Severity,
    /// Entry scope.
    pub scope: Scope,
    /// Human-readable message.
    pub msg: String,
    /// Operation name (`replCheckBatch`, `replCheckStart`, ...).
    pub operation: String,
    /// Structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Append-only health-log persistence sink.
pub trait HealthLogSink: Send + Sync {
    /// Append one entry. Sinks must not fail the caller; persistence
    /// problems are their own to report.
    fn log(&self, entry: HealthLogEntry);
}

/// Fill in the fields that are the same for all of the checker's entries.
/// When validation parameters are present they are folded into `data` under
/// `checkParameters`.
pub fn entry(
    parameters: Option<&SecondaryIndexCheckParameters>,
    nss: Option<&Namespace>,
    collection_uuid: Option<Uuid>,
    severity: Severity,
    msg: impl Into<String>,
    scope: Scope,
    operation: CheckOperation,
    data: Option<Value>,
) -> HealthLogEntry {
    let data = match (data, parameters) {
        (Some(Value::Object(mut map)), Some(p)) => {
            map.insert("checkParameters".into(), json!(p));
            Some(Value::Object(map))
        }
        (Some(other), Some(p)) => Some(json!({"data": other, "checkParameters": p})),
        (Some(data), None) => Some(data),
        (None, Some(p)) => Some(json!({ "checkParameters": p })),
        (None, None) => None,
    };

    HealthLogEntry {
        nss: nss.cloned(),
        collection_uuid,
        timestamp: Utc::now(),
        severity,
        scope,
        msg: msg.into(),
        operation: operation.render().to_string(),
        data,
    }
}

/// An Error-severity entry for a failed operation, carrying the error text
/// and whatever context the caller has.
pub fn error_entry(
    parameters: Option<&SecondaryIndexCheckParameters>,
    nss: Option<&Namespace>,
    collection_uuid: Option<Uuid>,
    msg: impl Into<String>,
    scope: Scope,
    operation: CheckOperation,
    err: &CheckError,
    context: Value,
) -> HealthLogEntry {
    entry(
        parameters,
        nss,
        collection_uuid,
        Severity::Error,
        msg,
        scope,
        operation,
        Some(json!({"success": false, "error": err.to_string(), "context": context})),
    )
}

/// Like [`error_entry`] but Warning severity, for anomalies that predate
/// stricter validation modes or are otherwise tolerated.
pub fn warning_entry(
    parameters: Option<&SecondaryIndexCheckParameters>,
    nss: Option<&Namespace>,
    collection_uuid: Option<Uuid>,
    msg: impl Into<String>,
    scope: Scope,
    operation: CheckOperation,
    err: &CheckError,
    context: Value,
) -> HealthLogEntry {
    entry(
        parameters,
        nss,
        collection_uuid,
        Severity::Warning,
        msg,
        scope,
        operation,
        Some(json!({"success": false, "error": err.to_string(), "context": context})),
    )
}

/// Everything a finished batch reports.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Validation parameters the batch ran under.
    pub parameters: Option<SecondaryIndexCheckParameters>,
    /// Batch id from the descriptor, when carried.
    pub batch_id: Option<Uuid>,
    /// Namespace checked.
    pub nss: Namespace,
    /// Collection UUID.
    pub collection_uuid: Option<Uuid>,
    /// Whether the collection is capped (downgrades mismatch severity).
    pub capped: bool,
    /// Items hashed (documents plus probed index keys).
    pub count: u64,
    /// Bytes hashed.
    pub bytes: u64,
    /// Digest carried on the descriptor.
    pub expected: String,
    /// Digest computed locally.
    pub found: String,
    /// Start of the hashed range.
    pub batch_start: KeyBytes,
    /// Last key actually consumed (the batch's reported end).
    pub batch_end: KeyBytes,
    /// Length of the identical-key run at the batch tail. Zero for
    /// collection checks or when no index keys were checked.
    pub n_consecutive_identical_keys_at_end: u64,
    /// Pinned read timestamp the batch was hashed at.
    pub read_timestamp: Option<Timestamp>,
    /// Oplog position of the batch descriptor.
    pub optime: OpTime,
    /// Spec of the checked index, for extra-index-keys batches.
    pub index_spec: Option<Value>,
}

impl BatchOutcome {
    /// Whether the local digest matched the descriptor's.
    pub fn consistent(&self) -> bool {
        self.expected == self.found
    }
}

/// Build the health-log entry for a finished batch.
///
/// Severity is Info on a match. On a mismatch it is Error, except for
/// collections known to tolerate benign skew (change-stream bookkeeping,
/// capped collections), which downgrade to Warning.
pub fn batch_entry(outcome: &BatchOutcome) -> HealthLogEntry {
    let consistent = outcome.consistent();

    let mut data = serde_json::Map::new();
    if let Some(batch_id) = outcome.batch_id {
        data.insert("batchId".into(), json!(batch_id));
    }
    data.insert("success".into(), json!(true));
    data.insert("count".into(), json!(outcome.count));
    data.insert("bytes".into(), json!(outcome.bytes));
    data.insert(
        "md5".into(),
        json!({"expected": outcome.expected, "found": outcome.found}),
    );
    data.insert("batchStart".into(), json!(outcome.batch_start));
    data.insert("batchEnd".into(), json!(outcome.batch_end));
    data.insert(
        "nConsecutiveIdenticalIndexKeysSeenAtEnd".into(),
        json!(outcome.n_consecutive_identical_keys_at_end),
    );
    if let Some(ts) = outcome.read_timestamp {
        data.insert("readTimestamp".into(), json!(ts));
    }
    if let Some(spec) = &outcome.index_spec {
        data.insert("indexSpec".into(), spec.clone());
    }
    data.insert("optime".into(), json!(outcome.optime));

    let severity = if consistent {
        Severity::Info
    } else if outcome.nss.tolerates_benign_skew() || outcome.capped {
        Severity::Warning
    } else {
        Severity::Error
    };

    let msg = if consistent {
        "batch consistent"
    } else {
        "batch inconsistent"
    };

    entry(
        outcome.parameters.as_ref(),
        Some(&outcome.nss),
        outcome.collection_uuid,
        severity,
        msg,
        Scope::Cluster,
        CheckOperation::Batch,
        Some(Value::Object(data)),
    )
}
