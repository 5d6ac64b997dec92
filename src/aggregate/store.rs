//! Storage boundary for running aggregates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// One subject's aggregate document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Running EDA average; absent until the first sample lands
    #[serde(rename = "edaAverage", default, skip_serializing_if = "Option::is_none")]
    pub eda_average: Option<f64>,
    /// Incremented on every committed write; 0 means never written
    #[serde(default)]
    pub version: u64,
    /// When the last write was committed
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Which writer committed the last write
    #[serde(rename = "updatedBy", default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl AggregateRecord {
    fn next(previous: Option<&AggregateRecord>, value: f64, writer: &str) -> Self {
        Self {
            eda_average: Some(value),
            version: previous.map(|r| r.version).unwrap_or(0) + 1,
            updated_at: Some(Utc::now()),
            updated_by: Some(writer.to_string()),
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write landed; carries the stored record
    Committed(AggregateRecord),
    /// Someone else wrote first; nothing was changed
    Conflict,
}

/// Aggregate store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Aggregate store IO error: {0}")]
    Io(String),
    #[error("Aggregate store holds unreadable data: {0}")]
    Corrupt(String),
    #[error("Aggregate store unavailable: {0}")]
    Unavailable(String),
    #[error("Aggregate update gave up after {attempts} conflicting writes")]
    Contention { attempts: u32 },
    #[error("Refusing to blend non-finite sample {0}")]
    InvalidSample(f64),
}

/// Versioned document storage for aggregates, keyed by subject.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Read the current record for a subject, if any.
    async fn read(&self, subject_id: &str) -> Result<Option<AggregateRecord>, StoreError>;

    /// Store `value` only if the record's version still equals
    /// `expected_version` (0 when no record exists).
    async fn write_if_version(
        &self,
        subject_id: &str,
        expected_version: u64,
        value: f64,
        writer: &str,
    ) -> Result<WriteOutcome, StoreError>;

    /// Remove a subject's record. Returns whether one existed.
    async fn clear(&self, subject_id: &str) -> Result<bool, StoreError>;
}

/// Apply a conditional write to an in-memory map of records.
pub(crate) fn apply_conditional_write(
    records: &mut HashMap<String, AggregateRecord>,
    subject_id: &str,
    expected_version: u64,
    value: f64,
    writer: &str,
) -> WriteOutcome {
    let current = records.get(subject_id);
    let current_version = current.map(|r| r.version).unwrap_or(0);
    if current_version != expected_version {
        return WriteOutcome::Conflict;
    }

    let record = AggregateRecord::next(current, value, writer);
    records.insert(subject_id.to_string(), record.clone());
    WriteOutcome::Committed(record)
}

/// Process-local aggregate store.
#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    records: Mutex<HashMap<String, AggregateRecord>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, replacing whatever was there.
    pub async fn insert(&self, subject_id: &str, record: AggregateRecord) {
        self.records
            .lock()
            .await
            .insert(subject_id.to_string(), record);
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn read(&self, subject_id: &str) -> Result<Option<AggregateRecord>, StoreError> {
        Ok(self.records.lock().await.get(subject_id).cloned())
    }

    async fn write_if_version(
        &self,
        subject_id: &str,
        expected_version: u64,
        value: f64,
        writer: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut records = self.records.lock().await;
        Ok(apply_conditional_write(
            &mut records,
            subject_id,
            expected_version,
            value,
            writer,
        ))
    }

    async fn clear(&self, subject_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.remove(subject_id).is_some())
    }
}
