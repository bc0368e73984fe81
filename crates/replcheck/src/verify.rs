//! Secondary-side batch verification and descriptor dispatch.
//!
//! The [`Checker`] is what oplog application hands replicated check
//! descriptors to. Applying a batch re-hashes the described range against
//! this node's own data at the pinned timestamp and compares digests. A
//! batch never fails replication: every problem, shutdown interruption
//! included, is converted into a health-log entry and the apply reports
//! success, because a node that cannot verify a batch is a finding, not a
//! replication fault.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquisition::Acquisition;
use crate::config::CheckConfig;
use crate::core::OpTime;
use crate::error::{CheckError, Result};
use crate::hasher::RangeHasher;
use crate::healthlog::{
    batch_entry, entry, error_entry, BatchOutcome, HealthLogSink, Scope, Severity,
};
use crate::oplog::{
    ApplyMode, BatchOplogEntry, CheckOperation, CheckOplogEntry, StartStopOplogEntry,
    ValidationMode,
};
use crate::store::{DataThrottle, PrepareConflictBehavior, ReadSource, StorageEngine};

/// Counters exposed for observability and tests.
#[derive(Debug, Default)]
pub struct CheckCounters {
    batches_processed: AtomicU64,
    batches_skipped: AtomicU64,
    errors_recorded: AtomicU64,
}

impl CheckCounters {
    /// Batches verified to completion (consistent or not).
    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    /// Batches acknowledged without verification.
    pub fn batches_skipped(&self) -> u64 {
        self.batches_skipped.load(Ordering::Relaxed)
    }

    /// Batches that failed and were reported to the health log.
    pub fn errors_recorded(&self) -> u64 {
        self.errors_recorded.load(Ordering::Relaxed)
    }
}

/// Failure injection for tests, passed in explicitly rather than toggled
/// through global state. Everything defaults to off.
#[derive(Debug, Clone, Default)]
pub struct CheckHooks {
    /// Delay inserted before each batch is verified.
    pub delay_before_batch: Option<std::time::Duration>,
    /// Fail every batch before hashing, as a storage fault would.
    pub fail_before_hashing: bool,
}

/// Secondary-side consistency checker.
pub struct Checker {
    engine: Arc<dyn StorageEngine>,
    health_log: Arc<dyn HealthLogSink>,
    config: CheckConfig,
    counters: CheckCounters,
    hooks: CheckHooks,
    cancel: CancellationToken,
}

impl Checker {
    /// Create a checker bound to a storage engine and a health-log sink.
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        health_log: Arc<dyn HealthLogSink>,
        config: CheckConfig,
    ) -> Self {
        Self {
            engine,
            health_log,
            config,
            counters: CheckCounters::default(),
            hooks: CheckHooks::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the failure-injection hooks.
    pub fn with_hooks(mut self, hooks: CheckHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Counters for this checker.
    pub fn counters(&self) -> &CheckCounters {
        &self.counters
    }

    /// Token that interrupts any in-flight batch when cancelled. Intended
    /// for shutdown; the aborted batch is reported to the health log and
    /// acknowledged like any other verification failure.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply one replicated check descriptor.
    ///
    /// Only steady-state secondary application verifies batches. Initial
    /// sync, recovery, and applyOps replays acknowledge the entry with a
    /// Warning instead: those nodes cannot assume their data already
    /// reflects the batch's timestamp.
    pub async fn apply_oplog_entry(
        &self,
        oplog_entry: &CheckOplogEntry,
        apply_mode: ApplyMode,
        optime: OpTime,
    ) -> Result<()> {
        if apply_mode != ApplyMode::Secondary {
            self.skip_entry(
                oplog_entry,
                format!("not applying check entry during {apply_mode}"),
            );
            return Ok(());
        }
        if self.config.skip_apply_on_secondary {
            self.skip_entry(oplog_entry, "check application disabled by configuration");
            return Ok(());
        }

        match oplog_entry {
            CheckOplogEntry::Batch(batch) => self.batch_on_secondary(batch, optime).await,
            CheckOplogEntry::Collection(coll) => {
                // Obsolete descriptor type, still acknowledged.
                debug!(namespace = %coll.nss, "ignoring legacy collection check entry");
                Ok(())
            }
            CheckOplogEntry::Start(start) => {
                self.log_start_stop(start, CheckOperation::Start, "check started");
                Ok(())
            }
            CheckOplogEntry::Stop(stop) => {
                self.log_start_stop(stop, CheckOperation::Stop, "check stopped");
                Ok(())
            }
        }
    }

    /// Acknowledge an entry without verifying it. The Warning carries the
    /// descriptor's namespace and, for a batch, its boundaries and id, so
    /// an operator can tell which ranges went unchecked.
    fn skip_entry(&self, oplog_entry: &CheckOplogEntry, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(operation = oplog_entry.operation().render(), "{reason}");
        self.counters.batches_skipped.fetch_add(1, Ordering::Relaxed);
        let log_entry = match oplog_entry {
            CheckOplogEntry::Batch(batch) => {
                let mut data = serde_json::json!({ "batchId": batch.batch_id });
                if let Ok(range) = batch.decode_range() {
                    data["batchStart"] = serde_json::json!(range.start);
                    data["batchEnd"] = serde_json::json!(range.end);
                }
                entry(
                    batch.secondary_index_check_parameters.as_ref(),
                    Some(&batch.nss),
                    None,
                    Severity::Warning,
                    reason,
                    Scope::Cluster,
                    CheckOperation::Batch,
                    Some(data),
                )
            }
            CheckOplogEntry::Collection(coll) => entry(
                None,
                Some(&coll.nss),
                None,
                Severity::Warning,
                reason,
                Scope::Cluster,
                CheckOperation::Collection,
                None,
            ),
            CheckOplogEntry::Start(e) | CheckOplogEntry::Stop(e) => entry(
                e.secondary_index_check_parameters.as_ref(),
                Some(&e.nss),
                e.uuid,
                Severity::Warning,
                reason,
                Scope::Cluster,
                oplog_entry.operation(),
                None,
            ),
        };
        self.health_log.log(log_entry);
    }

    fn log_start_stop(&self, e: &StartStopOplogEntry, op: CheckOperation, msg: &str) {
        info!(namespace = %e.nss, "{msg}");
        self.health_log.log(entry(
            e.secondary_index_check_parameters.as_ref(),
            Some(&e.nss),
            e.uuid,
            Severity::Info,
            msg,
            Scope::Cluster,
            op,
            None,
        ));
    }

    /// Verify one batch descriptor against local data.
    ///
    /// Always returns `Ok`: a batch this node cannot verify, interruption
    /// included, is reported to the health log at Error severity and
    /// acknowledged, so replication never stalls on a check.
    pub async fn batch_on_secondary(
        &self,
        batch: &BatchOplogEntry,
        optime: OpTime,
    ) -> Result<()> {
        match self.run_batch(batch, optime).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.errors_recorded.fetch_add(1, Ordering::Relaxed);
                self.health_log.log(error_entry(
                    batch.secondary_index_check_parameters.as_ref(),
                    Some(&batch.nss),
                    None,
                    "failed to verify batch",
                    Scope::Cluster,
                    CheckOperation::Batch,
                    &err,
                    serde_json::json!({
                        "md5": batch.md5,
                        "readTimestamp": batch.read_timestamp,
                        "optime": optime,
                    }),
                ));
                Ok(())
            }
        }
    }

    async fn run_batch(&self, batch: &BatchOplogEntry, optime: OpTime) -> Result<()> {
        if let Some(delay) = self.hooks.delay_before_batch {
            tokio::time::sleep(delay).await;
        }
        let range = batch.decode_range()?;
        let mode = batch.validation_mode()?;
        if self.hooks.fail_before_hashing {
            return Err(CheckError::storage("batch verification failed by hook"));
        }

        // Ignore prepare conflicts: a document can be prepared here after
        // the primary hashed it.
        let acquisition = Acquisition::open(
            self.engine.clone(),
            &batch.nss,
            ReadSource::Provided(batch.read_timestamp),
            PrepareConflictBehavior::Ignore,
        )?;

        let Some(collection) = acquisition.collection() else {
            info!(namespace = %batch.nss, "collection no longer exists, skipping batch");
            self.counters.batches_skipped.fetch_add(1, Ordering::Relaxed);
            self.health_log.log(entry(
                batch.secondary_index_check_parameters.as_ref(),
                Some(&batch.nss),
                None,
                Severity::Info,
                "collection no longer exists, skipping batch",
                Scope::Collection,
                CheckOperation::Batch,
                None,
            ));
            return Ok(());
        };

        let mut hasher = RangeHasher::new(
            collection.clone(),
            range.clone(),
            batch.secondary_index_check_parameters.clone(),
            &self.config,
            self.health_log.clone(),
            // Secondaries hash at replication speed, never throttled.
            DataThrottle::disabled(),
            self.cancel.clone(),
            None,
        )?;

        let index_spec = match &mode {
            ValidationMode::DataConsistency
            | ValidationMode::DataConsistencyAndMissingIndexKeys => {
                hasher.hash_collection_range().await?;
                None
            }
            ValidationMode::ExtraIndexKeys { index_name } => {
                let index = collection.index(index_name).ok_or_else(|| {
                    CheckError::IndexNotFound {
                        index: index_name.clone(),
                        namespace: batch.nss.to_string(),
                    }
                })?;
                hasher.hash_index_key_range(index.as_ref()).await?;
                Some(index.spec())
            }
        };

        let outcome = BatchOutcome {
            parameters: batch.secondary_index_check_parameters.clone(),
            batch_id: batch.batch_id,
            nss: batch.nss.clone(),
            collection_uuid: Some(collection.uuid()),
            capped: collection.is_capped(),
            count: hasher.count_seen(),
            bytes: hasher.bytes_seen(),
            expected: batch.md5.clone(),
            found: hasher.digest(),
            batch_start: range.start.clone(),
            batch_end: hasher.last_key_seen().clone(),
            n_consecutive_identical_keys_at_end: hasher.n_consecutive_identical_keys_at_end(),
            read_timestamp: Some(batch.read_timestamp),
            optime,
            index_spec,
        };

        let processed = self.counters.batches_processed.fetch_add(1, Ordering::Relaxed) + 1;
        let log_entry = batch_entry(&outcome);
        if self.should_emit(&log_entry.severity, batch, processed) {
            self.health_log.log(log_entry);
        }
        Ok(())
    }

    /// Info-severity outcomes are sampled in optimized builds so a full
    /// check of a large deployment does not flood the health log. Debug
    /// builds, non-Info outcomes, and a descriptor override always emit.
    fn should_emit(&self, severity: &Severity, batch: &BatchOplogEntry, processed: u64) -> bool {
        if *severity != Severity::Info {
            return true;
        }
        if batch.log_batch_to_health_log == Some(true) {
            return true;
        }
        cfg!(debug_assertions) || processed % self.config.health_log_every_n_batches == 0
    }
}
