//! Access gating for dashboard views.
//!
//! The `SessionProvider` is the single process-wide source of the current
//! identity. `AccessGate` turns that identity into a route decision, and
//! `ViewMounts` attaches mounted views to the `ReconcilerHub` so a guest
//! never starts a loop and a sign-out tears every gated loop down.

pub mod access;
pub mod mounts;
pub mod session;

// Re-export commonly used types
pub use access::{AccessGate, GateState, Route, Transition, View, AUTH_ENTRY};
pub use mounts::{follow_sessions, MountId, MountOutcome, ViewMounts};
pub use session::{Identity, SessionProvider, SessionState, SessionWatch};
