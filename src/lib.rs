//! InsideOut Telemetry - the data core of an elderly-monitoring dashboard.
//!
//! This library reconciles three sources of truth about one monitored
//! person into a single view a caregiver can read at a glance.
//!
//! # Sources
//!
//! - **Inference backend**: polled on a timer for the latest skin-response
//!   sample and its emotion and workload classifications
//! - **Aggregate store**: holds the running EDA average, updated with an
//!   optimistic versioned write on every successful poll
//! - **Status feed**: pushes coarse state documents the moment they change
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    InsideOut Telemetry                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Inference  │──▶│ Reconciler  │──▶│  Aggregate  │         │
//! │  │   Client    │   │ (per subj.) │   │   Updater   │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │                       ▲      │                               │
//! │  ┌─────────────┐      │      ▼       ┌─────────────┐         │
//! │  │Status Feed  │──────┘  Dashboard ◀─│ Access Gate │         │
//! │  │ Subscriber  │           View      │  + Mounts   │         │
//! │  └─────────────┘                     └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use insideout_telemetry::{
//!     aggregate::{AggregateUpdater, MemoryAggregateStore},
//!     inference::{InferenceClient, InferenceConfig},
//!     reconcile::{Reconciler, ReconcilerConfig, ReconcilerDeps},
//!     stats::create_shared_stats,
//!     status::BroadcastStatusFeed,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = InferenceClient::new(InferenceConfig::new("http://localhost:5000"))?;
//! let deps = ReconcilerDeps {
//!     source: Arc::new(client),
//!     updater: AggregateUpdater::new(Arc::new(MemoryAggregateStore::new()), 5),
//!     feed: Arc::new(BroadcastStatusFeed::default()),
//!     stats: create_shared_stats(),
//! };
//!
//! let mut reconciler = Reconciler::new(ReconcilerConfig::new("elderly"), deps);
//! let mut view = reconciler.observe();
//! reconciler.start()?;
//!
//! if let Some(view) = view.changed().await {
//!     println!("aggregate: {:?}", view.aggregate);
//! }
//! reconciler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod core;
pub mod gate;
pub mod inference;
pub mod reconcile;
pub mod stats;
pub mod status;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use aggregate::{
    AggregateStore, AggregateUpdater, FileAggregateStore, MemoryAggregateStore, StoreError,
};
pub use config::{Config, ConfigError};
pub use crate::core::{Classification, Reading};
pub use gate::{AccessGate, Identity, Route, SessionProvider, View, ViewMounts};
pub use inference::{FetchError, InferenceClient, InferenceConfig, InferenceSource};
pub use reconcile::{DashboardView, ReconcileError, Reconciler, ReconcilerHub, ViewObserver};
pub use stats::{LoopStats, SharedStats};
pub use status::{BroadcastStatusFeed, StatusFeed, StatusSnapshot, Subscription};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
