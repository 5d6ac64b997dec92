//! Mounted views and their attachment to shared reconciliation loops.

use crate::gate::access::{AccessGate, Route, Transition, View};
use crate::gate::session::{SessionState, SessionWatch};
use crate::reconcile::{ReconcileError, ReconcilerHub, ViewObserver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(u64);

/// Result of asking to mount a path.
pub enum MountOutcome {
    Mounted {
        id: MountId,
        view: View,
        /// Present for views that show live telemetry
        observer: Option<ViewObserver>,
    },
    Redirect(&'static str),
    Loading,
}

struct Mounted {
    view: View,
    attached: bool,
}

/// Tracks which views are on screen for one subject.
///
/// Views that show telemetry attach to the hub while mounted; everything
/// gated is unmounted when the session ends.
pub struct ViewMounts {
    gate: AccessGate,
    hub: Arc<ReconcilerHub>,
    subject_id: String,
    mounted: HashMap<MountId, Mounted>,
    next_id: u64,
}

impl ViewMounts {
    pub fn new(hub: Arc<ReconcilerHub>, subject_id: impl Into<String>) -> Self {
        Self {
            gate: AccessGate::new(),
            hub,
            subject_id: subject_id.into(),
            mounted: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn resolve(&self, path: &str) -> Route {
        self.gate.resolve(path)
    }

    /// Resolve `path` and mount the view if the gate allows it.
    pub async fn mount(&mut self, path: &str) -> Result<MountOutcome, ReconcileError> {
        let view = match self.gate.resolve(path) {
            Route::Render(view) => view,
            Route::Redirect(to) => {
                tracing::debug!(path, to, "Guest redirected");
                return Ok(MountOutcome::Redirect(to));
            }
            Route::Loading => return Ok(MountOutcome::Loading),
        };

        let observer = if view.mounts_reconciler() {
            Some(self.hub.attach(&self.subject_id).await?)
        } else {
            None
        };

        let id = MountId(self.next_id);
        self.next_id += 1;
        self.mounted.insert(
            id,
            Mounted {
                view,
                attached: observer.is_some(),
            },
        );

        Ok(MountOutcome::Mounted { id, view, observer })
    }

    /// Unmount a view, detaching it from its loop. Unknown ids are ignored.
    pub async fn unmount(&mut self, id: MountId) -> bool {
        let Some(mounted) = self.mounted.remove(&id) else {
            return false;
        };
        if mounted.attached {
            self.hub.detach(&self.subject_id).await;
        }
        true
    }

    /// Apply a session change, unmounting gated views when the user leaves.
    pub async fn on_session(&mut self, state: SessionState) -> Option<Transition> {
        let SessionState::Resolved(identity) = state else {
            return None;
        };

        let transition = self.gate.observe(identity);
        if matches!(
            transition,
            Some(Transition::SignedOut) | Some(Transition::Switched(_))
        ) {
            let removed = self.unmount_gated().await;
            tracing::info!(removed, "Gated views unmounted after session change");
        }
        transition
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.len()
    }

    pub fn is_mounted(&self, id: MountId) -> bool {
        self.mounted.contains_key(&id)
    }

    async fn unmount_gated(&mut self) -> usize {
        let gated: Vec<MountId> = self
            .mounted
            .iter()
            .filter(|(_, m)| m.view.is_gated())
            .map(|(id, _)| *id)
            .collect();

        for id in &gated {
            self.unmount(*id).await;
        }
        gated.len()
    }
}

/// Drive `mounts` from session changes until cancelled or the provider
/// goes away.
pub async fn follow_sessions(
    mounts: Arc<Mutex<ViewMounts>>,
    mut sessions: SessionWatch,
    cancel: CancellationToken,
) {
    let initial = sessions.current();
    mounts.lock().await.on_session(initial).await;

    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => return,
            state = sessions.changed() => state,
        };
        let Some(state) = state else {
            return;
        };
        mounts.lock().await.on_session(state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateUpdater, MemoryAggregateStore};
    use crate::core::{Classification, Reading};
    use crate::gate::access::AUTH_ENTRY;
    use crate::gate::session::{Identity, SessionProvider};
    use crate::inference::{FetchError, InferenceSource};
    use crate::reconcile::{ReconcilerConfig, ReconcilerDeps};
    use crate::stats::create_shared_stats;
    use crate::status::BroadcastStatusFeed;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct CountingSource {
        polls: AtomicU64,
    }

    #[async_trait]
    impl InferenceSource for CountingSource {
        async fn poll(&self) -> Result<Reading, FetchError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(Reading {
                sensor_value: 0.3,
                emotion: Classification::default(),
                workload: Classification::default(),
            })
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn setup() -> (Arc<CountingSource>, Arc<ReconcilerHub>, ViewMounts) {
        let source = Arc::new(CountingSource {
            polls: AtomicU64::new(0),
        });
        let deps = ReconcilerDeps {
            source: source.clone(),
            updater: AggregateUpdater::with_writer_id(
                Arc::new(MemoryAggregateStore::new()),
                3,
                "mount-test",
            ),
            feed: Arc::new(BroadcastStatusFeed::default()),
            stats: create_shared_stats(),
        };
        let hub = Arc::new(ReconcilerHub::new(
            ReconcilerConfig::new("elderly").with_poll_interval(Duration::from_millis(20)),
            deps,
        ));
        let mounts = ViewMounts::new(hub.clone(), "elderly");
        (source, hub, mounts)
    }

    #[tokio::test]
    async fn test_guest_never_starts_a_loop() {
        let (source, hub, mut mounts) = setup();
        mounts.on_session(SessionState::Resolved(None)).await;

        assert!(matches!(
            mounts.mount("/report").await.unwrap(),
            MountOutcome::Redirect(AUTH_ENTRY)
        ));
        assert!(matches!(
            mounts.mount("/").await.unwrap(),
            MountOutcome::Mounted { view: View::Landing, observer: None, .. }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
        assert!(!hub.is_running("elderly").await);
    }

    #[tokio::test]
    async fn test_pending_session_mounts_nothing() {
        let (_, _, mut mounts) = setup();
        assert!(matches!(mounts.mount("/").await.unwrap(), MountOutcome::Loading));
        assert_eq!(mounts.mounted_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_out_unmounts_gated_views() {
        let (_, hub, mut mounts) = setup();
        mounts
            .on_session(SessionState::Resolved(Some(Identity::new("caregiver-1"))))
            .await;

        let MountOutcome::Mounted { observer, .. } = mounts.mount("/").await.unwrap() else {
            panic!("dashboard should mount");
        };
        assert!(observer.is_some());
        mounts.mount("/report").await.unwrap();
        mounts.mount("/about").await.unwrap();
        assert_eq!(hub.attached("elderly").await, 2);

        let transition = mounts.on_session(SessionState::Resolved(None)).await;
        assert_eq!(transition, Some(Transition::SignedOut));
        assert_eq!(mounts.mounted_count(), 1);
        assert!(!hub.is_running("elderly").await);
    }

    #[tokio::test]
    async fn test_unmount_last_view_stops_loop() {
        let (source, hub, mut mounts) = setup();
        mounts
            .on_session(SessionState::Resolved(Some(Identity::new("caregiver-1"))))
            .await;
        let MountOutcome::Mounted { id, .. } = mounts.mount("/report").await.unwrap() else {
            panic!("report should mount");
        };
        assert!(hub.is_running("elderly").await);

        assert!(mounts.unmount(id).await);
        assert!(!mounts.unmount(id).await);
        assert!(!hub.is_running("elderly").await);

        let polls = source.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test]
    async fn test_follow_sessions_reacts_to_provider() {
        let (_, hub, mounts) = setup();
        let provider = SessionProvider::new();
        provider.publish(Some(Identity::new("caregiver-1")));

        let mounts = Arc::new(Mutex::new(mounts));
        let cancel = CancellationToken::new();
        let follower = tokio::spawn(follow_sessions(
            mounts.clone(),
            provider.subscribe(),
            cancel.clone(),
        ));

        // Wait for the follower to apply the initial session.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !mounts.lock().await.gate().is_authenticated() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        mounts.lock().await.mount("/").await.unwrap();
        assert!(hub.is_running("elderly").await);

        provider.publish(None);
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.is_running("elderly").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        follower.await.unwrap();
    }
}
