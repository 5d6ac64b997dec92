//! Read-blend-write of the running aggregate.

use crate::aggregate::store::{AggregateStore, StoreError, WriteOutcome};
use std::sync::Arc;

/// Blend a sample into the previous aggregate.
///
/// A cold aggregate takes the sample as-is; afterwards each sample carries
/// half the weight of the new value.
pub fn blend(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(previous) => (previous + sample) / 2.0,
        None => sample,
    }
}

/// Left-fold a run of samples through `blend`, starting from `initial`.
pub fn fold_samples(initial: Option<f64>, samples: &[f64]) -> Option<f64> {
    samples
        .iter()
        .fold(initial, |acc, &sample| Some(blend(acc, sample)))
}

/// A committed aggregate update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateUpdate {
    /// The aggregate value now stored
    pub value: f64,
    /// Store version after the write
    pub version: u64,
    /// Write attempts used, including the one that landed
    pub attempts: u32,
}

/// Applies samples to a subject's aggregate through an `AggregateStore`.
#[derive(Clone)]
pub struct AggregateUpdater {
    store: Arc<dyn AggregateStore>,
    writer_id: String,
    max_attempts: u32,
}

impl AggregateUpdater {
    /// Create a new updater with a writer id derived from the hostname.
    pub fn new(store: Arc<dyn AggregateStore>, max_attempts: u32) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let writer_id = format!(
            "monitor-{}-{}",
            hostname,
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        Self::with_writer_id(store, max_attempts, writer_id)
    }

    pub fn with_writer_id(
        store: Arc<dyn AggregateStore>,
        max_attempts: u32,
        writer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            writer_id: writer_id.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Blend `sample` into the subject's aggregate and return the new value.
    pub async fn update_aggregate(&self, subject_id: &str, sample: f64) -> Result<f64, StoreError> {
        self.apply(subject_id, sample).await.map(|u| u.value)
    }

    /// Same as `update_aggregate`, with the version and attempt count.
    ///
    /// On conflict the record is re-read and the sample re-blended against
    /// the fresher value. A failed update never changes the stored record.
    pub async fn apply(&self, subject_id: &str, sample: f64) -> Result<AggregateUpdate, StoreError> {
        if !sample.is_finite() {
            return Err(StoreError::InvalidSample(sample));
        }

        for attempt in 1..=self.max_attempts {
            let current = self.store.read(subject_id).await?;
            let expected_version = current.as_ref().map(|r| r.version).unwrap_or(0);
            let previous = current.and_then(|r| r.eda_average);
            let value = blend(previous, sample);

            match self
                .store
                .write_if_version(subject_id, expected_version, value, &self.writer_id)
                .await?
            {
                WriteOutcome::Committed(record) => {
                    return Ok(AggregateUpdate {
                        value,
                        version: record.version,
                        attempts: attempt,
                    });
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(
                        subject_id,
                        attempt,
                        "Aggregate write conflicted; re-reading"
                    );
                }
            }
        }

        Err(StoreError::Contention {
            attempts: self.max_attempts,
        })
    }

    /// Read the subject's current aggregate without changing it.
    pub async fn current(&self, subject_id: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .store
            .read(subject_id)
            .await?
            .and_then(|r| r.eda_average))
    }

    /// Drop the subject's aggregate so the next sample starts it cold.
    pub async fn reset(&self, subject_id: &str) -> Result<bool, StoreError> {
        self.store.clear(subject_id).await
    }

    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }
}
