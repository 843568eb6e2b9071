//! Durable store: recovery log, crash log and usage history.
//!
//! The queue, lifecycle manager and recorder only see the [`Store`] trait, so
//! the recovery algorithm does not depend on the storage technology.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use modelgate_common::{BackendState, CrashRecord, QueueItem, UsageRecord};

use crate::error::StoreError;

/// Narrow persistence interface over the four collections.
///
/// Calls are synchronous and short; callers hold at most a per-model queue
/// lock while writing, never across a backend call.
pub trait Store: Send + Sync {
    /// Insert or overwrite an item by id.
    fn upsert_item(&self, item: &QueueItem) -> Result<(), StoreError>;

    fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// Every `PENDING` or `PROCESSING` item, oldest submission first.
    fn list_active_items(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Delete terminal items completed before `cutoff`.
    fn delete_terminal_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Usage records for `model` with `timestamp >= since`.
    fn count_usage_since(&self, model: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Usage records for unregistered models, most recent first.
    fn list_usage_gaps(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError>;

    fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn append_crash(&self, record: &CrashRecord) -> Result<(), StoreError>;

    /// Most recent first.
    fn list_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>, StoreError>;

    /// Crash records with `from <= timestamp < to`, most recent first.
    fn list_crashes_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CrashRecord>, StoreError>;

    fn delete_crashes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Replace the snapshot for `state.model`.
    fn save_backend_state(&self, state: &BackendState) -> Result<(), StoreError>;

    fn load_backend_states(&self) -> Result<Vec<BackendState>, StoreError>;
}
