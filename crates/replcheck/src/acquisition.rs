//! Scoped acquisition of a snapshot plus tolerance-policy overrides.

use std::sync::Arc;

use crate::core::Namespace;
use crate::error::Result;
use crate::store::{
    Collection, CorruptionMode, PrepareConflictBehavior, ReadSource, StorageEngine,
};

/// Binds a point-in-time snapshot and corruption/conflict-tolerance policy
/// to one check operation.
///
/// While the acquisition is alive, detected data corruption is logged and
/// scanned past instead of failing the operation (corruption sites already
/// write to the health log), and prepare conflicts are handled per the
/// caller's policy. On drop, success or error alike, the snapshot is abandoned
/// and both prior behaviors are restored, in that order. Never partial.
pub struct Acquisition {
    engine: Arc<dyn StorageEngine>,
    collection: Option<Arc<dyn Collection>>,
    prev_corruption: CorruptionMode,
    prev_prepare: PrepareConflictBehavior,
}

impl Acquisition {
    /// Acquire `nss` against a snapshot at `source`.
    ///
    /// The returned acquisition may hold no collection: the namespace can
    /// be gone at the pinned timestamp, which callers treat as a skipped
    /// check rather than an inconsistency.
    pub fn open(
        engine: Arc<dyn StorageEngine>,
        nss: &Namespace,
        source: ReadSource,
        prepare: PrepareConflictBehavior,
    ) -> Result<Self> {
        // Policy swaps happen before the snapshot opens, mirroring how the
        // recovery unit must be configured before any read occurs.
        let prev_prepare = engine.swap_prepare_conflict_behavior(prepare);
        let prev_corruption = engine.swap_corruption_mode(CorruptionMode::LogAndContinue);

        if let Err(err) = engine.open_snapshot(source) {
            engine.swap_corruption_mode(prev_corruption);
            engine.swap_prepare_conflict_behavior(prev_prepare);
            return Err(err);
        }

        let collection = engine.collection(nss);
        Ok(Self {
            engine,
            collection,
            prev_corruption,
            prev_prepare,
        })
    }

    /// The acquired collection, when it existed at the pinned timestamp.
    pub fn collection(&self) -> Option<&Arc<dyn Collection>> {
        self.collection.as_ref()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.engine.abandon_snapshot();
        self.engine.swap_corruption_mode(self.prev_corruption);
        self.engine.swap_prepare_conflict_behavior(self.prev_prepare);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Timestamp;
    use crate::store::memory::MemoryEngine;

    #[test]
    fn test_policies_swapped_and_restored() {
        let engine = Arc::new(MemoryEngine::new());
        let nss = Namespace::parse("app.orders").unwrap();
        assert_eq!(engine.corruption_mode(), CorruptionMode::Throw);

        {
            let acq = Acquisition::open(
                engine.clone(),
                &nss,
                ReadSource::Provided(Timestamp(1)),
                PrepareConflictBehavior::Ignore,
            )
            .unwrap();
            assert!(acq.collection().is_none());
            assert_eq!(engine.corruption_mode(), CorruptionMode::LogAndContinue);
            assert_eq!(
                engine.prepare_conflict_behavior(),
                PrepareConflictBehavior::Ignore
            );
            assert!(engine.snapshot_open());
        }

        assert_eq!(engine.corruption_mode(), CorruptionMode::Throw);
        assert_eq!(
            engine.prepare_conflict_behavior(),
            PrepareConflictBehavior::Enforce
        );
        assert!(!engine.snapshot_open());
    }

    #[test]
    fn test_collection_resolved_when_present() {
        let engine = Arc::new(MemoryEngine::new());
        let nss = Namespace::parse("app.orders").unwrap();
        engine.create_collection(&nss, false, false);

        let acq = Acquisition::open(
            engine.clone(),
            &nss,
            ReadSource::Latest,
            PrepareConflictBehavior::Ignore,
        )
        .unwrap();
        assert!(acq.collection().is_some());
    }
}
