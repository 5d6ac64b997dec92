//! Push-based status feed for the monitored subject.
//!
//! A single logical collection holds zero or one live document with the
//! subject's coarse emotion/EDA/PPG state. This module provides:
//! - `StatusSnapshot`, the "current" view of that document
//! - `StatusFeed`, the seam to whatever service pushes change sets
//! - `subscribe`, a supervised subscription that resubscribes with backoff

pub mod feed;
pub mod subscriber;
pub mod types;

// Re-export commonly used types
pub use feed::{BroadcastStatusFeed, StatusFeed, StatusStream};
pub use subscriber::{subscribe, subscribe_updates, Backoff, StatusEvent, Subscription};
pub use types::{ChangeSet, StatusDocument, StatusSnapshot, SubscriptionError};
