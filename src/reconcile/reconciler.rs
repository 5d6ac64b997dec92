//! The timer-driven reconciliation loop.

use crate::aggregate::AggregateUpdater;
use crate::config::Config;
use crate::core::Reading;
use crate::inference::{FetchError, InferenceSource};
use crate::reconcile::view::{DashboardView, ViewObserver};
use crate::stats::SharedStats;
use crate::status::{subscribe, Backoff, StatusEvent, StatusFeed, Subscription};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Per-subject loop settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub subject_id: String,
    pub poll_interval: Duration,
    /// `None` disables the liveness probe
    pub probe_interval: Option<Duration>,
    pub backoff: Backoff,
}

impl ReconcilerConfig {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            poll_interval: Duration::from_secs(2),
            probe_interval: None,
            backoff: Backoff::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            subject_id: config.subject_id.clone(),
            poll_interval: config.poll_interval,
            probe_interval: (!config.probe_interval.is_zero()).then_some(config.probe_interval),
            backoff: Backoff::new(config.resubscribe_initial, config.resubscribe_max),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_probe_interval(mut self, probe_interval: Duration) -> Self {
        self.probe_interval = Some(probe_interval);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Same settings for another subject.
    pub fn for_subject(&self, subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..self.clone()
        }
    }
}

/// Collaborators a loop talks to.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub source: Arc<dyn InferenceSource>,
    pub updater: AggregateUpdater,
    pub feed: Arc<dyn StatusFeed>,
    pub stats: SharedStats,
}

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("Reconciliation loop already running for subject '{0}'")]
    AlreadyRunning(String),
}

struct ActiveLoop {
    cancel: CancellationToken,
    subscription: Subscription,
    handle: JoinHandle<()>,
}

/// Owns the poll timer and status subscription for one subject and
/// publishes the merged `DashboardView`.
pub struct Reconciler {
    config: ReconcilerConfig,
    deps: ReconcilerDeps,
    view: Arc<watch::Sender<DashboardView>>,
    active: Option<ActiveLoop>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, deps: ReconcilerDeps) -> Self {
        let (view, _) = watch::channel(DashboardView::new(config.subject_id.clone()));
        Self {
            config,
            deps,
            view: Arc::new(view),
            active: None,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.config.subject_id
    }

    /// Observe the published view. Works before `start` and after `stop`.
    pub fn observe(&self) -> ViewObserver {
        ViewObserver::new(self.view.subscribe())
    }

    pub fn current(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Open the status subscription and start the poll timer.
    ///
    /// The first poll is issued immediately. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self) -> Result<(), ReconcileError> {
        if self.active.is_some() {
            return Err(ReconcileError::AlreadyRunning(self.config.subject_id.clone()));
        }

        let cancel = CancellationToken::new();
        let subscription = self.subscribe_status();
        let state = LoopState {
            subject_id: self.config.subject_id.clone(),
            deps: self.deps.clone(),
            view: self.view.clone(),
            cancel: cancel.clone(),
            last_applied: 0,
            aggregate: self.view.borrow().aggregate,
        };
        let handle = tokio::spawn(run_loop(self.config.clone(), state));

        tracing::info!(
            subject_id = %self.config.subject_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Reconciliation loop started"
        );

        self.active = Some(ActiveLoop {
            cancel,
            subscription,
            handle,
        });
        Ok(())
    }

    /// Cancel the timer and release the subscription, then wait for the
    /// loop task to exit. Nothing is published after this returns.
    /// Calling it on a stopped loop does nothing.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        active.subscription.unsubscribe();
        if let Err(e) = active.handle.await {
            tracing::warn!("Reconciliation task ended abnormally: {}", e);
        }
        active.subscription.shutdown().await;

        tracing::info!(subject_id = %self.config.subject_id, "Reconciliation loop stopped");
    }

    fn subscribe_status(&self) -> Subscription {
        let view = self.view.clone();
        let stats = self.deps.stats.clone();

        subscribe(self.deps.feed.clone(), self.config.backoff, move |event| match event {
            StatusEvent::Update(status) => {
                stats.record_status_update();
                view.send_modify(|v| {
                    v.status = status;
                    v.subscription_error = None;
                });
            }
            StatusEvent::Lost(e) => {
                view.send_modify(|v| v.subscription_error = Some(e.to_string()));
            }
            StatusEvent::Restored => {
                stats.record_resubscribe();
                view.send_modify(|v| v.subscription_error = None);
            }
        })
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            active.subscription.unsubscribe();
        }
    }
}

enum LoopMessage {
    Poll {
        sequence: u64,
        result: Result<Reading, FetchError>,
    },
    Probe(bool),
}

struct LoopState {
    subject_id: String,
    deps: ReconcilerDeps,
    view: Arc<watch::Sender<DashboardView>>,
    cancel: CancellationToken,
    last_applied: u64,
    /// Last aggregate we computed or read; kept when a write fails
    aggregate: Option<f64>,
}

async fn run_loop(config: ReconcilerConfig, mut state: LoopState) {
    let (tx, mut rx) = mpsc::channel::<LoopMessage>(32);

    let mut poll_ticker = interval(config.poll_interval);
    poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probe_ticker = config.probe_interval.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut next_sequence: u64 = 1;

    state.prime_aggregate().await;

    loop {
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => break,
            Some(message) = rx.recv() => match message {
                LoopMessage::Poll { sequence, result } => state.apply_poll(sequence, result).await,
                LoopMessage::Probe(reachable) => state.apply_probe(reachable),
            },
            _ = poll_ticker.tick() => {
                state.issue_poll(next_sequence, tx.clone());
                next_sequence += 1;
            }
            _ = tick(&mut probe_ticker) => state.issue_probe(tx.clone()),
        }
    }

    tracing::debug!(subject_id = %state.subject_id, "Reconciliation task exiting");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl LoopState {
    /// Show the stored aggregate before the first poll lands.
    async fn prime_aggregate(&mut self) {
        let current = tokio::select! {
            _ = self.cancel.cancelled() => return,
            current = self.deps.updater.current(&self.subject_id) => current,
        };

        match current {
            Ok(Some(value)) => {
                self.aggregate = Some(value);
                self.view.send_modify(|v| v.aggregate = Some(value));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(subject_id = %self.subject_id, "Could not read aggregate: {}", e);
                self.view
                    .send_modify(|v| v.store_warning = Some(e.to_string()));
            }
        }
    }

    /// Polls run concurrently; results come back tagged with their sequence.
    ///
    /// A poll already sent always runs to completion. If the loop has
    /// stopped by then, the closed channel rejects the result and it is
    /// counted as discarded.
    fn issue_poll(&self, sequence: u64, tx: mpsc::Sender<LoopMessage>) {
        let source = self.deps.source.clone();
        let stats = self.deps.stats.clone();
        stats.record_poll_issued();

        tokio::spawn(async move {
            let result = source.poll().await;
            if tx.send(LoopMessage::Poll { sequence, result }).await.is_err() {
                stats.record_poll_discarded();
            }
        });
    }

    fn issue_probe(&self, tx: mpsc::Sender<LoopMessage>) {
        let source = self.deps.source.clone();

        tokio::spawn(async move {
            let reachable = source.probe().await;
            let _ = tx.send(LoopMessage::Probe(reachable)).await;
        });
    }

    async fn apply_poll(&mut self, sequence: u64, result: Result<Reading, FetchError>) {
        if sequence <= self.last_applied {
            tracing::debug!(
                subject_id = %self.subject_id,
                sequence,
                last_applied = self.last_applied,
                "Discarding stale poll result"
            );
            self.deps.stats.record_poll_discarded();
            return;
        }
        self.last_applied = sequence;

        match result {
            Ok(reading) => {
                self.deps.stats.record_poll_succeeded();
                let store_warning = self.update_aggregate(reading.sensor_value).await;
                if self.cancel.is_cancelled() {
                    return;
                }

                let aggregate = self.aggregate;
                self.view.send_modify(|v| {
                    v.reading = Some(reading);
                    v.aggregate = aggregate;
                    v.fetch_error = None;
                    v.store_warning = store_warning;
                    v.sequence = sequence;
                    v.updated_at = Some(Utc::now());
                });
            }
            Err(e) => {
                self.deps.stats.record_poll_failed();
                tracing::warn!(subject_id = %self.subject_id, sequence, "Poll failed: {}", e);
                if self.cancel.is_cancelled() {
                    return;
                }

                self.view.send_modify(|v| {
                    v.fetch_error = Some(e.to_string());
                    v.sequence = sequence;
                    v.updated_at = Some(Utc::now());
                });
            }
        }
    }

    /// Returns the warning to show, if the write failed.
    async fn update_aggregate(&mut self, sample: f64) -> Option<String> {
        match self.deps.updater.apply(&self.subject_id, sample).await {
            Ok(update) => {
                self.deps.stats.record_aggregate_write(update.attempts);
                self.aggregate = Some(update.value);
                None
            }
            Err(e) => {
                self.deps.stats.record_aggregate_failure();
                tracing::warn!(subject_id = %self.subject_id, "Aggregate update failed: {}", e);
                Some(e.to_string())
            }
        }
    }

    fn apply_probe(&self, reachable: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !reachable {
            tracing::warn!(subject_id = %self.subject_id, "Inference backend unreachable");
        }
        self.view.send_if_modified(|v| {
            let changed = v.backend_reachable != Some(reachable);
            v.backend_reachable = Some(reachable);
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MemoryAggregateStore;
    use crate::core::Classification;
    use crate::stats::create_shared_stats;
    use crate::status::BroadcastStatusFeed;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    struct CountingSource {
        polls: AtomicU64,
        value: f64,
    }

    #[async_trait]
    impl InferenceSource for CountingSource {
        async fn poll(&self) -> Result<Reading, FetchError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(Reading {
                sensor_value: self.value,
                emotion: Classification::default(),
                workload: Classification::default(),
            })
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn reconciler(source: Arc<CountingSource>) -> Reconciler {
        let deps = ReconcilerDeps {
            source,
            updater: AggregateUpdater::with_writer_id(
                Arc::new(MemoryAggregateStore::new()),
                3,
                "test-writer",
            ),
            feed: Arc::new(BroadcastStatusFeed::default()),
            stats: create_shared_stats(),
        };
        let config = ReconcilerConfig::new("elderly")
            .with_poll_interval(Duration::from_millis(20))
            .with_probe_interval(Duration::from_millis(20));
        Reconciler::new(config, deps)
    }

    fn source(value: f64) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            polls: AtomicU64::new(0),
            value,
        })
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut reconciler = reconciler(source(0.5));
        reconciler.start().unwrap();
        assert!(matches!(
            reconciler.start(),
            Err(ReconcileError::AlreadyRunning(subject)) if subject == "elderly"
        ));
        reconciler.stop().await;
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn test_first_poll_is_immediate_and_published() {
        let mut reconciler = reconciler(source(0.5));
        let mut observer = reconciler.observe();
        reconciler.start().unwrap();

        let view = timeout(WAIT, observer.wait_for(|v| v.reading.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.aggregate, Some(0.5));
        assert!(view.fetch_error.is_none());

        let view = timeout(WAIT, observer.wait_for(|v| v.backend_reachable.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.backend_reachable, Some(true));

        reconciler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_halts_polling_and_is_idempotent() {
        let counting = source(0.5);
        let mut reconciler = reconciler(counting.clone());
        let mut observer = reconciler.observe();
        reconciler.start().unwrap();
        timeout(WAIT, observer.wait_for(|v| v.sequence >= 2))
            .await
            .unwrap()
            .unwrap();

        reconciler.stop().await;
        reconciler.stop().await;

        let polls = counting.polls.load(Ordering::SeqCst);
        let published = reconciler.current();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counting.polls.load(Ordering::SeqCst), polls);
        assert_eq!(reconciler.current(), published);
    }

    #[test]
    fn test_config_from_file_settings() {
        let mut config = Config::default();
        config.probe_interval = Duration::ZERO;
        config.poll_interval = Duration::from_millis(750);

        let loop_config = ReconcilerConfig::from_config(&config);
        assert_eq!(loop_config.poll_interval, Duration::from_millis(750));
        assert!(loop_config.probe_interval.is_none());
        assert_eq!(loop_config.for_subject("other").subject_id, "other");
    }
}
