//! Running EDA aggregate shared across every client watching a subject.
//!
//! The canonical value lives in an `AggregateStore`. Each new sample is
//! blended in with `(previous + sample) / 2`, or taken as-is when the
//! aggregate is cold. Writes are conditional on the version that was read,
//! so two clients updating the same subject never silently drop a sample.

pub mod file;
pub mod store;
pub mod updater;

// Re-export commonly used types
pub use file::FileAggregateStore;
pub use store::{AggregateRecord, AggregateStore, MemoryAggregateStore, StoreError, WriteOutcome};
pub use updater::{blend, fold_samples, AggregateUpdate, AggregateUpdater};
