//! Lock-free counters with optional JSON persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running totals for one monitor process (plus whatever was persisted).
#[derive(Debug)]
pub struct LoopStats {
    polls_issued: AtomicU64,
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    /// Results that arrived after a newer one, or after the loop stopped
    polls_discarded: AtomicU64,
    aggregate_writes: AtomicU64,
    /// Conditional writes that lost a race and were retried
    aggregate_conflicts: AtomicU64,
    aggregate_failures: AtomicU64,
    status_updates: AtomicU64,
    resubscribes: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl LoopStats {
    pub fn new() -> Self {
        Self {
            polls_issued: AtomicU64::new(0),
            polls_succeeded: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            polls_discarded: AtomicU64::new(0),
            aggregate_writes: AtomicU64::new(0),
            aggregate_conflicts: AtomicU64::new(0),
            aggregate_failures: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            resubscribes: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create counters that resume from, and save to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("Could not load previous stats: {}", e);
        }

        stats
    }

    pub fn record_poll_issued(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_succeeded(&self) {
        self.polls_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_discarded(&self) {
        self.polls_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed aggregate write and the conflicts it took.
    pub fn record_aggregate_write(&self, attempts: u32) {
        self.aggregate_writes.fetch_add(1, Ordering::Relaxed);
        self.aggregate_conflicts
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
    }

    pub fn record_aggregate_failure(&self) {
        self.aggregate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_update(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resubscribe(&self) {
        self.resubscribes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polls_issued: self.polls_issued.load(Ordering::Relaxed),
            polls_succeeded: self.polls_succeeded.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_discarded: self.polls_discarded.load(Ordering::Relaxed),
            aggregate_writes: self.aggregate_writes.load(Ordering::Relaxed),
            aggregate_conflicts: self.aggregate_conflicts.load(Ordering::Relaxed),
            aggregate_failures: self.aggregate_failures.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Monitor Statistics:\n\
             - Polls issued: {}\n\
             - Polls succeeded: {}\n\
             - Polls failed: {}\n\
             - Stale results discarded: {}\n\
             - Aggregate writes: {} ({} conflicts retried, {} failed)\n\
             - Status updates: {}\n\
             - Resubscribes: {}\n\
             - Uptime: {} seconds",
            stats.polls_issued,
            stats.polls_succeeded,
            stats.polls_failed,
            stats.polls_discarded,
            stats.aggregate_writes,
            stats.aggregate_conflicts,
            stats.aggregate_failures,
            stats.status_updates,
            stats.resubscribes,
            stats.uptime_secs
        )
    }

    /// Save counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.snapshot();
            let persisted = PersistedStats {
                polls_issued: stats.polls_issued,
                polls_succeeded: stats.polls_succeeded,
                polls_failed: stats.polls_failed,
                polls_discarded: stats.polls_discarded,
                aggregate_writes: stats.aggregate_writes,
                aggregate_conflicts: stats.aggregate_conflicts,
                aggregate_failures: stats.aggregate_failures,
                status_updates: stats.status_updates,
                resubscribes: stats.resubscribes,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.polls_issued.store(persisted.polls_issued, Ordering::Relaxed);
                self.polls_succeeded
                    .store(persisted.polls_succeeded, Ordering::Relaxed);
                self.polls_failed.store(persisted.polls_failed, Ordering::Relaxed);
                self.polls_discarded
                    .store(persisted.polls_discarded, Ordering::Relaxed);
                self.aggregate_writes
                    .store(persisted.aggregate_writes, Ordering::Relaxed);
                self.aggregate_conflicts
                    .store(persisted.aggregate_conflicts, Ordering::Relaxed);
                self.aggregate_failures
                    .store(persisted.aggregate_failures, Ordering::Relaxed);
                self.status_updates
                    .store(persisted.status_updates, Ordering::Relaxed);
                self.resubscribes.store(persisted.resubscribes, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.polls_issued,
            &self.polls_succeeded,
            &self.polls_failed,
            &self.polls_discarded,
            &self.aggregate_writes,
            &self.aggregate_conflicts,
            &self.aggregate_failures,
            &self.status_updates,
            &self.resubscribes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for LoopStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub polls_issued: u64,
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub polls_discarded: u64,
    pub aggregate_writes: u64,
    pub aggregate_conflicts: u64,
    pub aggregate_failures: u64,
    pub status_updates: u64,
    pub resubscribes: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    polls_issued: u64,
    polls_succeeded: u64,
    polls_failed: u64,
    #[serde(default)]
    polls_discarded: u64,
    aggregate_writes: u64,
    #[serde(default)]
    aggregate_conflicts: u64,
    #[serde(default)]
    aggregate_failures: u64,
    status_updates: u64,
    #[serde(default)]
    resubscribes: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared counters.
pub type SharedStats = Arc<LoopStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(LoopStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(LoopStats::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = LoopStats::new();

        stats.record_poll_issued();
        stats.record_poll_issued();
        stats.record_poll_succeeded();
        stats.record_poll_failed();
        stats.record_aggregate_write(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.polls_issued, 2);
        assert_eq!(snapshot.polls_succeeded, 1);
        assert_eq!(snapshot.polls_failed, 1);
        assert_eq!(snapshot.aggregate_writes, 1);
        assert_eq!(snapshot.aggregate_conflicts, 2);
    }

    #[test]
    fn test_reset() {
        let stats = LoopStats::new();
        stats.record_status_update();
        stats.record_resubscribe();
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.status_updates, 0);
        assert_eq!(snapshot.resubscribes, 0);
    }

    #[test]
    fn test_persistence_resumes_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = LoopStats::with_persistence(path.clone());
        stats.record_poll_issued();
        stats.record_poll_discarded();
        stats.save().unwrap();

        let resumed = LoopStats::with_persistence(path);
        let snapshot = resumed.snapshot();
        assert_eq!(snapshot.polls_issued, 1);
        assert_eq!(snapshot.polls_discarded, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = LoopStats::new().summary();
        assert!(summary.contains("Polls issued"));
        assert!(summary.contains("Stale results discarded"));
        assert!(summary.contains("Resubscribes"));
    }
}
