//! Supervised status subscription.
//!
//! `subscribe` keeps exactly one stream open against a `StatusFeed`. When
//! the stream breaks or cannot be opened it resubscribes after an
//! exponential backoff, and keeps doing so until unsubscribed.

use crate::status::feed::StatusFeed;
use crate::status::types::{StatusSnapshot, SubscriptionError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exponential resubscribe delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before the given retry (0-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// What a subscription reports to its owner.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A change set arrived
    Update(StatusSnapshot),
    /// The subscription broke; a resubscribe is scheduled
    Lost(SubscriptionError),
    /// A resubscribe succeeded after a loss
    Restored,
}

type EventCallback = Box<dyn Fn(StatusEvent) + Send + Sync>;

struct Delivery {
    active: Mutex<bool>,
    callback: EventCallback,
}

impl Delivery {
    /// Run the callback unless the subscription is gone. Returns whether
    /// the event was delivered.
    fn emit(&self, event: StatusEvent) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !*active {
            return false;
        }
        (self.callback)(event);
        true
    }

    fn deactivate(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *active, false)
    }

    fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle to a live status subscription.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    delivery: Arc<Delivery>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivery. Idempotent.
    ///
    /// Once this returns the callback will not run again, even if the feed
    /// keeps pushing. It waits for a callback already running on another
    /// task, so it must not be called from inside the callback itself.
    pub fn unsubscribe(&self) {
        if self.delivery.deactivate() {
            tracing::debug!("Status subscription released");
        }
        self.cancel.cancel();
    }

    /// Unsubscribe and wait for the supervising task to finish.
    pub async fn shutdown(mut self) {
        self.unsubscribe();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.delivery.is_active()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Subscribe to a feed, reporting updates, losses and recoveries.
///
/// Must be called from within a tokio runtime.
pub fn subscribe<F>(feed: Arc<dyn StatusFeed>, backoff: Backoff, on_event: F) -> Subscription
where
    F: Fn(StatusEvent) + Send + Sync + 'static,
{
    let delivery = Arc::new(Delivery {
        active: Mutex::new(true),
        callback: Box::new(on_event),
    });
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(supervise(feed, backoff, delivery.clone(), cancel.clone()));

    Subscription {
        delivery,
        cancel,
        handle: Some(handle),
    }
}

/// Subscribe to snapshot updates only.
pub fn subscribe_updates<F>(
    feed: Arc<dyn StatusFeed>,
    backoff: Backoff,
    on_update: F,
) -> Subscription
where
    F: Fn(StatusSnapshot) + Send + Sync + 'static,
{
    subscribe(feed, backoff, move |event| {
        if let StatusEvent::Update(snapshot) = event {
            on_update(snapshot);
        }
    })
}

async fn supervise(
    feed: Arc<dyn StatusFeed>,
    backoff: Backoff,
    delivery: Arc<Delivery>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut lost = false;

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = feed.open() => opened,
        };

        match opened {
            Ok(mut stream) => {
                tracing::debug!("Status feed subscribed");
                attempt = 0;
                if lost {
                    lost = false;
                    if !delivery.emit(StatusEvent::Restored) {
                        return;
                    }
                }

                let error = loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(changes)) => {
                            let snapshot = StatusSnapshot::from_change_set(&changes);
                            if !delivery.emit(StatusEvent::Update(snapshot)) {
                                return;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break SubscriptionError::Closed,
                    }
                };

                tracing::warn!("Status subscription lost: {}; resubscribing", error);
                lost = true;
                if !delivery.emit(StatusEvent::Lost(error)) {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Status feed open failed: {}", e);
                if !lost {
                    lost = true;
                    if !delivery.emit(StatusEvent::Lost(e)) {
                        return;
                    }
                }
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
