//! Merge counters

use crate::fileset::LevelStat;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated by merge tasks and the scheduler
#[derive(Debug, Default)]
pub struct MergeMetrics {
    tasks_started: AtomicU64,
    tasks_committed: AtomicU64,
    tasks_failed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    points_written: AtomicU64,
    chunks_appended: AtomicU64,
    chunks_rewritten: AtomicU64,
    total_merge_us: AtomicU64,
    last_merge_us: AtomicU64,
    selection_timeouts: AtomicU64,
    admission_delays: AtomicU64,
}

impl MergeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_committed(&self, elapsed: Duration, bytes_written: u64, points_written: u64) {
        let us = elapsed.as_micros() as u64;
        self.tasks_committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.points_written.fetch_add(points_written, Ordering::Relaxed);
        self.total_merge_us.fetch_add(us, Ordering::Relaxed);
        self.last_merge_us.store(us, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_chunks(&self, appended: u64, rewritten: u64) {
        self.chunks_appended.fetch_add(appended, Ordering::Relaxed);
        self.chunks_rewritten.fetch_add(rewritten, Ordering::Relaxed);
    }

    pub fn selection_timeout(&self) {
        self.selection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admission_delayed(&self) {
        self.admission_delays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_committed: self.tasks_committed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            chunks_appended: self.chunks_appended.load(Ordering::Relaxed),
            chunks_rewritten: self.chunks_rewritten.load(Ordering::Relaxed),
            total_merge_ms: self.total_merge_us.load(Ordering::Relaxed) / 1000,
            last_merge_ms: self.last_merge_us.load(Ordering::Relaxed) / 1000,
            selection_timeouts: self.selection_timeouts.load(Ordering::Relaxed),
            admission_delays: self.admission_delays.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MergeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_started: u64,
    pub tasks_committed: u64,
    pub tasks_failed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub points_written: u64,
    pub chunks_appended: u64,
    pub chunks_rewritten: u64,
    pub total_merge_ms: u64,
    pub last_merge_ms: u64,
    pub selection_timeouts: u64,
    pub admission_delays: u64,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub metrics: MetricsSnapshot,
    pub running_tasks: usize,
    pub reserved_memory: u64,
    pub memory_budget: u64,
    pub pending_deletions: usize,
    pub live_files: usize,
    pub read_throttled_ms: u64,
    pub write_throttled_ms: u64,
    pub levels: Vec<LevelStat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MergeMetrics::new();
        metrics.task_started();
        metrics.task_started();
        metrics.task_committed(Duration::from_millis(20), 4096, 100);
        metrics.task_failed();
        metrics.record_read(1000);
        metrics.record_chunks(2, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_started, 2);
        assert_eq!(snapshot.tasks_committed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.bytes_written, 4096);
        assert_eq!(snapshot.last_merge_ms, 20);
        assert_eq!(snapshot.chunks_rewritten, 3);
    }
}
