//! Point-in-time queue metrics.

use serde::Serialize;

use modelgate_common::BackendStatus;

use crate::queue::ModelQueue;

/// Queue counters and backend status for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub model: String,
    pub status: BackendStatus,
    pub processing: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_waiting: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    /// `processing / max_concurrent`.
    pub utilization: f64,
}

impl QueueMetrics {
    /// Read-only snapshot; the counters are read under one lock acquisition.
    pub async fn snapshot(queue: &ModelQueue) -> Self {
        let counts = queue.counts().await;
        let limits = queue.limits();
        let utilization = if limits.max_concurrent == 0 {
            0.0
        } else {
            counts.processing as f64 / limits.max_concurrent as f64
        };

        Self {
            model: queue.model().to_string(),
            status: queue.backend_status(),
            processing: counts.processing,
            waiting: counts.waiting,
            max_concurrent: limits.max_concurrent,
            max_waiting: limits.max_waiting,
            total_processed: counts.total_processed,
            total_failed: counts.total_failed,
            total_timed_out: counts.total_timed_out,
            utilization,
        }
    }
}
