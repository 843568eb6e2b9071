//! Crash and usage history recorder.
//!
//! Every failure-class event from the queue and the lifecycle manager is
//! appended here. A periodic prune removes history older than the retention
//! window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use modelgate_common::{CrashRecord, UsageRecord};

use crate::error::StoreError;
use crate::store::Store;

/// Rows removed by one prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub usage_records: usize,
    pub crash_records: usize,
    pub queue_items: usize,
}

pub struct Recorder {
    store: Arc<dyn Store>,
    retention: Duration,
}

impl Recorder {
    pub fn new(store: Arc<dyn Store>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn record_crash(&self, record: CrashRecord) -> Result<(), StoreError> {
        tracing::error!(
            model = %record.model,
            request_id = ?record.request_id,
            error_kind = %record.error_kind,
            attempt = ?record.attempt,
            "{}",
            record.detail
        );
        self.store.append_crash(&record)
    }

    /// Like [`Recorder::record_crash`] for paths where the triggering state
    /// change is already durable; a failed append is logged, not returned.
    pub fn record_crash_logged(&self, record: CrashRecord) {
        if let Err(e) = self.record_crash(record) {
            tracing::error!("Failed to append crash record: {}", e);
        }
    }

    pub fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        tracing::debug!(
            model = %record.model,
            client_id = %record.client_id,
            known_model = record.known_model,
            "Usage recorded"
        );
        self.store.append_usage(record)
    }

    pub fn list_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>, StoreError> {
        self.store.list_crashes(limit)
    }

    pub fn list_crashes_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CrashRecord>, StoreError> {
        self.store.list_crashes_between(from, to)
    }

    pub fn usage_gaps(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        self.store.list_usage_gaps(limit)
    }

    /// Delete usage, crash and terminal item history older than the
    /// retention window.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport, StoreError> {
        let cutoff = now - self.retention;
        let report = PruneReport {
            usage_records: self.store.delete_usage_before(cutoff)?,
            crash_records: self.store.delete_crashes_before(cutoff)?,
            queue_items: self.store.delete_terminal_items_before(cutoff)?,
        };

        tracing::info!(
            cutoff = %cutoff,
            usage_records = report.usage_records,
            crash_records = report.crash_records,
            queue_items = report.queue_items,
            "Pruned history"
        );
        Ok(report)
    }
}
