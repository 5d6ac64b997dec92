//! Reconciliation of polled readings, the running aggregate and pushed status.
//!
//! # Architecture
//!
//! ```text
//!  InferenceSource ──poll(seq)──▶ ┌────────────┐ ──sample──▶ AggregateUpdater ──▶ store
//!                                 │ Reconciler │
//!  StatusFeed ──subscribe──────▶  └────────────┘ ──publish──▶ DashboardView (watch)
//!                                                                  │
//!                                        ReconcilerHub ◀── views attach/detach
//! ```
//!
//! One `Reconciler` runs per subject. Views never own a loop; they attach
//! to the `ReconcilerHub` and read the published view through a
//! `ViewObserver`.

pub mod hub;
pub mod reconciler;
pub mod view;

// Re-export commonly used types
pub use hub::ReconcilerHub;
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig, ReconcilerDeps};
pub use view::{DashboardView, ViewObserver};
