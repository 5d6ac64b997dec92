//! Process-wide session state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// A signed-in user as reported by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// What the provider currently knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The identity service has not answered yet
    Unresolved,
    /// `None` means nobody is signed in
    Resolved(Option<Identity>),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Resolved(identity) => identity.as_ref(),
            SessionState::Unresolved => None,
        }
    }
}

/// Holds the current session and notifies every subscriber of changes.
///
/// Cloning is cheap and every clone shares the same state; create one per
/// process and hand clones to whatever needs it.
#[derive(Clone)]
pub struct SessionProvider {
    tx: Arc<watch::Sender<SessionState>>,
}

impl SessionProvider {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Unresolved);
        Self { tx: Arc::new(tx) }
    }

    /// Record what the identity service reported.
    pub fn publish(&self, identity: Option<Identity>) {
        let next = SessionState::Resolved(identity);
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            match next.identity() {
                Some(identity) => tracing::info!(uid = %identity.uid, "Session signed in"),
                None => tracing::info!("Session signed out"),
            }
            *state = next.clone();
            true
        });
    }

    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> SessionWatch {
        SessionWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the session. Dropping it unsubscribes.
pub struct SessionWatch {
    rx: watch::Receiver<SessionState>,
}

impl SessionWatch {
    pub fn current(&self) -> SessionState {
        self.rx.borrow().clone()
    }

    /// Wait for the next session change. `None` once the provider is gone.
    pub async fn changed(&mut self) -> Option<SessionState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
