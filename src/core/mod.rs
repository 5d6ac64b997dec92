//! Core data types for the telemetry monitor.
//!
//! This module contains:
//! - `Reading`, one inference cycle's sensor value plus classifications
//! - Timestamp interpretation for the backend's local-time stamps

pub mod reading;

// Re-export commonly used types
pub use reading::{parse_observed_at, Classification, Reading, NAIVE_TIMESTAMP_FORMAT};
