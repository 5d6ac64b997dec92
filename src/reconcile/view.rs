//! The merged view published to the presentation layer.

use crate::core::Reading;
use crate::status::StatusSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Latest reading, aggregate and status for one subject.
///
/// Each field is replaced wholesale; the error fields hold human-readable
/// causes for a banner and are cleared by the next success of their kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardView {
    pub subject_id: String,
    /// Last successfully polled reading
    pub reading: Option<Reading>,
    /// Last aggregate value this client computed or read
    pub aggregate: Option<f64>,
    /// Latest pushed status
    pub status: StatusSnapshot,
    /// Set when the most recent applied poll failed
    pub fetch_error: Option<String>,
    /// Set when the most recent aggregate update failed
    pub store_warning: Option<String>,
    /// Set while the status subscription is down
    pub subscription_error: Option<String>,
    /// Result of the last liveness probe, if one has run
    pub backend_reachable: Option<bool>,
    /// Sequence number of the last applied poll
    pub sequence: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DashboardView {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Self::default()
        }
    }

    /// Whether any banner-worthy fault is currently set.
    pub fn has_fault(&self) -> bool {
        self.fetch_error.is_some()
            || self.store_warning.is_some()
            || self.subscription_error.is_some()
    }
}

/// Read-only handle on a reconciler's published view.
#[derive(Clone)]
pub struct ViewObserver {
    rx: watch::Receiver<DashboardView>,
}

impl ViewObserver {
    pub(crate) fn new(rx: watch::Receiver<DashboardView>) -> Self {
        Self { rx }
    }

    /// The view as currently published.
    pub fn current(&self) -> DashboardView {
        self.rx.borrow().clone()
    }

    /// Wait for the next publish. `None` once the reconciler is gone.
    pub async fn changed(&mut self) -> Option<DashboardView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the published view satisfies `predicate`, checking the
    /// current value first. `None` once the reconciler is gone.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<DashboardView>
    where
        F: FnMut(&DashboardView) -> bool,
    {
        self.rx
            .wait_for(|view| predicate(view))
            .await
            .ok()
            .map(|view| view.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observer_sees_publishes() {
        let (tx, rx) = watch::channel(DashboardView::new("elderly"));
        let mut observer = ViewObserver::new(rx);
        assert_eq!(observer.current().subject_id, "elderly");

        tx.send_modify(|view| view.aggregate = Some(0.4));
        let view = observer.changed().await.unwrap();
        assert_eq!(view.aggregate, Some(0.4));

        drop(tx);
        assert!(observer.changed().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_checks_current_value() {
        let (tx, rx) = watch::channel(DashboardView::new("elderly"));
        tx.send_modify(|view| view.sequence = 3);

        let mut observer = ViewObserver::new(rx);
        let view = observer.wait_for(|v| v.sequence == 3).await.unwrap();
        assert_eq!(view.sequence, 3);
    }

    #[test]
    fn test_has_fault() {
        let mut view = DashboardView::new("elderly");
        assert!(!view.has_fault());
        view.store_warning = Some("disk full".to_string());
        assert!(view.has_fault());
    }
}
