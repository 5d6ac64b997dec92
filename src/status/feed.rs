//! Status feed seam and the in-process broadcast implementation.

use crate::status::types::{ChangeSet, StatusDocument, SubscriptionError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Change sets flowing out of one open subscription.
///
/// The stream ends (`next` returns `None`) when the feed closes it; an
/// `Err` item means the subscription is broken and must be reopened.
pub struct StatusStream {
    rx: mpsc::Receiver<Result<ChangeSet, SubscriptionError>>,
}

impl StatusStream {
    pub fn new(rx: mpsc::Receiver<Result<ChangeSet, SubscriptionError>>) -> Self {
        Self { rx }
    }

    /// Create a stream together with the sender that feeds it.
    pub fn channel(
        buffer: usize,
    ) -> (mpsc::Sender<Result<ChangeSet, SubscriptionError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    /// Wait for the next change set.
    pub async fn next(&mut self) -> Option<Result<ChangeSet, SubscriptionError>> {
        self.rx.recv().await
    }
}

/// A remote collection that pushes its contents on every change.
///
/// Opening a stream delivers the current contents first, then one change
/// set per remote write, in the order the service emits them.
#[async_trait]
pub trait StatusFeed: Send + Sync {
    async fn open(&self) -> Result<StatusStream, SubscriptionError>;
}

struct FeedState {
    documents: Mutex<ChangeSet>,
    tx: broadcast::Sender<ChangeSet>,
}

/// In-process status collection backed by a broadcast channel.
///
/// Holds zero or one document. The HTTP server's `POST /status` writes
/// here, and every open stream sees the write.
#[derive(Clone)]
pub struct BroadcastStatusFeed {
    state: Arc<FeedState>,
}

impl BroadcastStatusFeed {
    /// Create a feed whose subscribers may fall `capacity` change sets
    /// behind before they are told they lagged.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(FeedState {
                documents: Mutex::new(Vec::new()),
                tx,
            }),
        }
    }

    /// Replace the collection's document and push the change.
    pub fn set_document(&self, document: StatusDocument) {
        self.replace(vec![document]);
    }

    /// Empty the collection and push the change.
    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    /// Current collection contents.
    pub fn current(&self) -> ChangeSet {
        self.documents().clone()
    }

    /// Number of open streams.
    pub fn subscriber_count(&self) -> usize {
        self.state.tx.receiver_count()
    }

    fn replace(&self, documents: ChangeSet) {
        let mut current = self.documents();
        *current = documents;
        // No receivers is fine; the next open() starts from `current`.
        let _ = self.state.tx.send(current.clone());
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, ChangeSet> {
        self.state
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BroadcastStatusFeed {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl StatusFeed for BroadcastStatusFeed {
    async fn open(&self) -> Result<StatusStream, SubscriptionError> {
        // Subscribe and snapshot under the same lock so no write slips
        // between the initial contents and the first broadcast.
        let (mut rx, initial) = {
            let documents = self.documents();
            (self.state.tx.subscribe(), documents.clone())
        };

        let (out, stream) = StatusStream::channel(16);
        tokio::spawn(async move {
            if out.send(Ok(initial)).await.is_err() {
                return;
            }
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = out.closed() => return,
                };
                match received {
                    Ok(changes) => {
                        if out.send(Ok(changes)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let _ = out.send(Err(SubscriptionError::Lagged(skipped))).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(stream)
    }
}
