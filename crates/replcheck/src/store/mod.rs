//! Storage collaborator traits, the in-memory reference backend, and the
//! scan-rate throttle.

pub mod memory;
pub mod throttle;
mod traits;

pub use throttle::DataThrottle;
pub use traits::{
    Collection, CorruptionMode, DocumentDefect, IndexAccess, IndexCursor, IndexEntry, IndexKind,
    PrepareConflictBehavior, ReadSource, RecordCursor, RecordEntry, StorageEngine,
};
