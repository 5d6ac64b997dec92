//! Route table and the guest/authenticated decision.

use crate::gate::session::Identity;

/// Where guests are sent when they request a gated view.
pub const AUTH_ENTRY: &str = "/authentication";

/// Views the route table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Landing,
    Dashboard,
    Report,
    Profile,
    Camera,
    Authentication,
    About,
    Contact,
    NotFound,
}

impl View {
    /// Views that need a signed-in user.
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            View::Dashboard | View::Report | View::Profile | View::Camera
        )
    }

    /// Views that show live telemetry and so run a reconciliation loop.
    pub fn mounts_reconciler(&self) -> bool {
        matches!(self, View::Dashboard | View::Report)
    }
}

/// What to do with a navigation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Render(View),
    Redirect(&'static str),
    /// The session is still resolving; show a placeholder
    Loading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Guest,
    Authenticated(Identity),
}

/// Session changes that matter to mounted views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    SignedIn(Identity),
    /// Gated views must unmount
    SignedOut,
    /// A different user took over; gated views must remount
    Switched(Identity),
}

/// Decides, per navigation, whether a view may render.
#[derive(Debug, Clone)]
pub struct AccessGate {
    state: GateState,
}

impl AccessGate {
    pub fn new() -> Self {
        Self {
            state: GateState::Pending,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            GateState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, GateState::Authenticated(_))
    }

    /// Feed the gate a resolved session.
    pub fn observe(&mut self, identity: Option<Identity>) -> Option<Transition> {
        let next = match identity {
            Some(identity) => GateState::Authenticated(identity),
            None => GateState::Guest,
        };

        let transition = match (&self.state, &next) {
            (GateState::Authenticated(old), GateState::Authenticated(new)) if old.uid != new.uid => {
                Some(Transition::Switched(new.clone()))
            }
            (GateState::Authenticated(_), GateState::Authenticated(_)) => None,
            (_, GateState::Authenticated(new)) => Some(Transition::SignedIn(new.clone())),
            (GateState::Authenticated(_), _) => Some(Transition::SignedOut),
            _ => None,
        };

        self.state = next;
        transition
    }

    /// Resolve a path against the route table.
    ///
    /// While the session is pending, anything that depends on it (gated
    /// views and `/`) resolves to `Route::Loading`.
    pub fn resolve(&self, path: &str) -> Route {
        let pending = self.state == GateState::Pending;

        let view = match normalize(path) {
            "/" if pending => return Route::Loading,
            "/" if self.is_authenticated() => View::Dashboard,
            "/" => View::Landing,
            "/authentication" => View::Authentication,
            "/about" => View::About,
            "/contact" => View::Contact,
            "/report" => View::Report,
            "/profile" => View::Profile,
            "/camera" => View::Camera,
            _ => View::NotFound,
        };

        if view.is_gated() {
            if pending {
                return Route::Loading;
            }
            if !self.is_authenticated() {
                return Route::Redirect(AUTH_ENTRY);
            }
        }
        Route::Render(view)
    }
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}
