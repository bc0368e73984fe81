//! Replica-set data-consistency checking for a replicated document store.
//!
//! A check runs as a sequence of batches. The sending node hashes a key
//! range of a collection (or of one secondary index) at a pinned timestamp
//! and replicates a batch descriptor carrying the range, the digest, and
//! the timestamp. Every receiving node re-hashes the same range against its
//! own data and compares digests. Outcomes land in an append-only health
//! log; replication itself never fails because of a check.
//!
//! # Architecture
//!
//! - [`verify::Checker`] dispatches replicated descriptors and verifies
//!   batches on secondaries
//! - [`hasher::RangeHasher`] digests one range deterministically, with
//!   batch ceilings and duplicate-key-run handling
//! - [`index_check`] probes ready indexes for keys documents should have
//! - [`acquisition::Acquisition`] pairs a pinned snapshot with the policy
//!   swaps a scan needs, restored on every exit path
//! - [`healthlog`] formats the audit records every outcome turns into
//! - [`oplog`] models the replicated descriptor formats, including the
//!   legacy boundary encoding
//! - [`store`] defines the storage collaborator traits and ships an
//!   in-memory backend
//!
//! # Example
//!
//! ```no_run
//! use replcheck::config::CheckConfig;
//! use replcheck::store::memory::{MemoryEngine, MemoryHealthLog};
//! use replcheck::verify::Checker;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let health_log = Arc::new(MemoryHealthLog::new());
//! let config = CheckConfig::load("replcheck.yaml")?;
//! let checker = Checker::new(engine, health_log, config);
//! # Ok::<(), replcheck::error::CheckError>(())
//! ```

pub mod acquisition;
pub mod config;
pub mod core;
pub mod error;
pub mod hasher;
pub mod healthlog;
pub mod index_check;
pub mod oplog;
pub mod store;
pub mod verify;

pub use config::CheckConfig;
pub use error::{CheckError, Result};
pub use hasher::RangeHasher;
pub use healthlog::{BatchOutcome, HealthLogEntry, HealthLogSink, Severity};
pub use oplog::{ApplyMode, CheckOplogEntry, SecondaryIndexCheckParameters, ValidationMode};
pub use verify::{CheckCounters, CheckHooks, Checker};
