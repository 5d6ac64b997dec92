//! Activity counters for the reconciliation loop.
//!
//! Counts what the monitor did (polls, aggregate writes, status pushes)
//! so operators can see at a glance whether the backend and the stores are
//! keeping up.

pub mod counters;

// Re-export commonly used types
pub use counters::{
    create_shared_stats, create_shared_stats_with_persistence, LoopStats, SharedStats,
    StatsSnapshot,
};
