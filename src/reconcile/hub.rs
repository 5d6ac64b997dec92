//! One shared reconciler per subject, reference-counted by attached views.

use crate::reconcile::reconciler::{ReconcileError, Reconciler, ReconcilerConfig, ReconcilerDeps};
use crate::reconcile::view::ViewObserver;
use std::collections::HashMap;
use tokio::sync::Mutex;

struct HubEntry {
    reconciler: Reconciler,
    attached: usize,
}

/// Starts a subject's loop when its first view attaches and stops it when
/// the last one detaches, so concurrent views never issue duplicate polls.
pub struct ReconcilerHub {
    base: ReconcilerConfig,
    deps: ReconcilerDeps,
    entries: Mutex<HashMap<String, HubEntry>>,
}

impl ReconcilerHub {
    /// `base` supplies intervals and backoff; its subject is ignored.
    pub fn new(base: ReconcilerConfig, deps: ReconcilerDeps) -> Self {
        Self {
            base,
            deps,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a view to the subject's loop, starting it if needed.
    pub async fn attach(&self, subject_id: &str) -> Result<ViewObserver, ReconcileError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(subject_id) {
            entry.attached += 1;
            tracing::debug!(subject_id, attached = entry.attached, "View attached");
            return Ok(entry.reconciler.observe());
        }

        let mut reconciler = Reconciler::new(self.base.for_subject(subject_id), self.deps.clone());
        reconciler.start()?;
        let observer = reconciler.observe();
        entries.insert(
            subject_id.to_string(),
            HubEntry {
                reconciler,
                attached: 1,
            },
        );
        Ok(observer)
    }

    /// Detach one view. Returns `true` if this stopped the subject's loop.
    pub async fn detach(&self, subject_id: &str) -> bool {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(subject_id) else {
            tracing::debug!(subject_id, "Detach for subject with no loop");
            return false;
        };
        entry.attached = entry.attached.saturating_sub(1);
        if entry.attached > 0 {
            return false;
        }

        if let Some(mut entry) = entries.remove(subject_id) {
            entry.reconciler.stop().await;
        }
        true
    }

    /// Number of views attached to the subject.
    pub async fn attached(&self, subject_id: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(subject_id)
            .map(|e| e.attached)
            .unwrap_or(0)
    }

    pub async fn is_running(&self, subject_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(subject_id)
            .is_some_and(|e| e.reconciler.is_running())
    }

    /// Stop every loop regardless of attached views.
    pub async fn shutdown(&self) {
        let drained: Vec<HubEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in drained {
            entry.reconciler.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateUpdater, MemoryAggregateStore};
    use crate::core::{Classification, Reading};
    use crate::inference::{FetchError, InferenceSource};
    use crate::stats::create_shared_stats;
    use crate::status::BroadcastStatusFeed;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FixedSource;

    #[async_trait]
    impl InferenceSource for FixedSource {
        async fn poll(&self) -> Result<Reading, FetchError> {
            Ok(Reading {
                sensor_value: 0.5,
                emotion: Classification::default(),
                workload: Classification::default(),
            })
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn hub() -> ReconcilerHub {
        let deps = ReconcilerDeps {
            source: Arc::new(FixedSource),
            updater: AggregateUpdater::with_writer_id(
                Arc::new(MemoryAggregateStore::new()),
                3,
                "hub-test",
            ),
            feed: Arc::new(BroadcastStatusFeed::default()),
            stats: create_shared_stats(),
        };
        let base = ReconcilerConfig::new("unused").with_poll_interval(Duration::from_millis(20));
        ReconcilerHub::new(base, deps)
    }

    #[tokio::test]
    async fn test_views_share_one_loop() {
        let hub = hub();
        let mut first = hub.attach("elderly").await.unwrap();
        let mut second = hub.attach("elderly").await.unwrap();
        assert_eq!(hub.attached("elderly").await, 2);

        let a = timeout(Duration::from_secs(3), first.wait_for(|v| v.sequence >= 1))
            .await
            .unwrap()
            .unwrap();
        let b = timeout(Duration::from_secs(3), second.wait_for(|v| v.sequence >= 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.subject_id, "elderly");
        assert_eq!(b.subject_id, "elderly");

        assert!(!hub.detach("elderly").await);
        assert!(hub.is_running("elderly").await);
        assert!(hub.detach("elderly").await);
        assert!(!hub.is_running("elderly").await);

        // The loop is gone, so observers see the publisher close.
        timeout(Duration::from_secs(3), async {
            while first.changed().await.is_some() {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_detach_unknown_subject() {
        let hub = hub();
        assert!(!hub.detach("nobody").await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_subjects() {
        let hub = hub();
        hub.attach("elderly").await.unwrap();
        hub.attach("resident-2").await.unwrap();

        hub.shutdown().await;
        assert!(!hub.is_running("elderly").await);
        assert!(!hub.is_running("resident-2").await);
        assert_eq!(hub.attached("elderly").await, 0);
    }
}
