//! In-process metrics accumulator.
//!
//! An optional collaborator: attach one to a worker via
//! [`Worker::with_metrics`](crate::worker::Worker::with_metrics) and read it
//! with [`QueueMetrics::snapshot`]. No exporter is provided.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct QueueMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub completed: u64,
    pub failed: u64,
    /// Mean processor wall time of completed jobs, in milliseconds.
    pub mean_duration_ms: u64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_job_completed(&self, duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            mean_duration_ms: if completed == 0 { 0 } else { total / completed },
        }
    }
}
