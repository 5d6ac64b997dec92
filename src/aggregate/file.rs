//! JSON-file aggregate store.
//!
//! All subjects live in one JSON object keyed by subject id. Every
//! read-modify-write cycle holds an exclusive lock on a sibling `.lock` file,
//! so separate processes sharing the file still see each other's versions.
//! Writes go to a fresh temp file in the same directory and are renamed into
//! place, so readers never see a half-written document.

use crate::aggregate::store::{
    apply_conditional_write, AggregateRecord, AggregateStore, StoreError, WriteOutcome,
};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

type Records = HashMap<String, AggregateRecord>;

/// Aggregate store persisted to a single JSON file.
#[derive(Debug)]
pub struct FileAggregateStore {
    path: PathBuf,
    // Keeps this instance's callers from queueing on the file lock in
    // blocking threads.
    lock: Mutex<()>,
}

impl FileAggregateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sibling file used for cross-process locking.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Run `op` on the loaded records while holding the file lock. When `op`
    /// reports the records dirty they are persisted before the lock drops.
    async fn locked<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Records) -> (T, bool) + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || {
            let _lock = acquire(&lock_path)?;
            let mut records = load(&path)?;
            let (output, dirty) = op(&mut records);
            if dirty {
                persist(&path, &records)?;
            }
            Ok(output)
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Open the lock file and block until this handle holds it exclusively.
/// The lock is released when the returned file is dropped.
fn acquire(lock_path: &Path) -> Result<File, StoreError> {
    std::fs::create_dir_all(parent_dir(lock_path)).map_err(io_error)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(io_error)?;
    file.lock_exclusive().map_err(io_error)?;
    Ok(file)
}

fn load(path: &Path) -> Result<Records, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
        Ok(content) => {
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(io_error(e)),
    }
}

fn persist(path: &Path, records: &Records) -> Result<(), StoreError> {
    let json =
        serde_json::to_string_pretty(records).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(parent_dir(path)).map_err(io_error)?;
    tmp.write_all(json.as_bytes()).map_err(io_error)?;
    tmp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

#[async_trait]
impl AggregateStore for FileAggregateStore {
    async fn read(&self, subject_id: &str) -> Result<Option<AggregateRecord>, StoreError> {
        let subject_id = subject_id.to_string();
        self.locked(move |records| (records.remove(&subject_id), false))
            .await
    }

    async fn write_if_version(
        &self,
        subject_id: &str,
        expected_version: u64,
        value: f64,
        writer: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let subject_id = subject_id.to_string();
        let writer = writer.to_string();
        self.locked(move |records| {
            let outcome =
                apply_conditional_write(records, &subject_id, expected_version, value, &writer);
            let dirty = matches!(outcome, WriteOutcome::Committed(_));
            (outcome, dirty)
        })
        .await
    }

    async fn clear(&self, subject_id: &str) -> Result<bool, StoreError> {
        let subject_id = subject_id.to_string();
        self.locked(move |records| {
            let existed = records.remove(&subject_id).is_some();
            (existed, existed)
        })
        .await
    }
}
