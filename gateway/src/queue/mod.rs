//! Per-model admission queue.
//!
//! Two tiers per model: a primary tier of at most `max_concurrent` items that
//! hold a dispatch slot, and a secondary (waiting) tier of at most
//! `max_waiting` items ordered by priority, FIFO within a priority class.
//! Every mutation happens under one per-model lock; backend calls never do.

mod admission;
mod dispatcher;
mod recovery;

pub use admission::FailOutcome;
pub use dispatcher::Dispatcher;
pub use recovery::{recover_items, RecoveryReport};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex, Notify};

use modelgate_common::{BackendStatus, QueueItem};

use crate::config::{ModelConfig, QueueConfig};
use crate::recorder::Recorder;
use crate::store::Store;

/// Limits and policies for one model's queue.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_concurrent: usize,
    pub max_waiting: usize,
    pub timeout: chrono::Duration,
    pub max_retries: u32,
}

impl QueueLimits {
    pub fn from_config(queue: &QueueConfig, model: &ModelConfig) -> Self {
        Self {
            max_concurrent: model.max_concurrent(queue),
            max_waiting: queue.max_waiting,
            timeout: queue.timeout(),
            max_retries: queue.max_retries,
        }
    }
}

/// Point-in-time counters of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub processing: usize,
    pub waiting: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
}

#[derive(Default)]
struct QueueState {
    /// Primary tier: items holding a slot, keyed by id.
    processing: HashMap<String, QueueItem>,
    /// Primary items not yet handed to the dispatcher.
    ready: VecDeque<String>,
    /// Secondary tier, one deque per priority rank.
    waiting: [VecDeque<QueueItem>; 3],
    /// Completion signals, fired once the item reaches a terminal state.
    waiters: HashMap<String, Vec<oneshot::Sender<QueueItem>>>,
    total_processed: u64,
    total_failed: u64,
    total_timed_out: u64,
}

impl QueueState {
    fn waiting_len(&self) -> usize {
        self.waiting.iter().map(VecDeque::len).sum()
    }

    /// Highest priority class first, then earliest submission.
    fn pop_waiting(&mut self) -> Option<QueueItem> {
        self.waiting.iter_mut().find_map(VecDeque::pop_front)
    }

    fn find_waiting(&self, id: &str) -> Option<&QueueItem> {
        self.waiting.iter().flatten().find(|i| i.id == id)
    }

    /// Remove an item from whichever tier holds it.
    fn detach(&mut self, id: &str) -> Option<QueueItem> {
        self.ready.retain(|r| r != id);
        if let Some(item) = self.processing.remove(id) {
            return Some(item);
        }
        self.waiting.iter_mut().find_map(|tier| {
            let pos = tier.iter().position(|i| i.id == id)?;
            tier.remove(pos)
        })
    }

    fn signal(&mut self, item: &QueueItem) {
        if let Some(waiters) = self.waiters.remove(&item.id) {
            for tx in waiters {
                let _ = tx.send(item.clone());
            }
        }
    }
}

/// Admission queue for a single model.
pub struct ModelQueue {
    model: String,
    limits: QueueLimits,
    state: Mutex<QueueState>,
    store: Arc<dyn Store>,
    recorder: Arc<Recorder>,
    /// Backend status, owned by the lifecycle manager.
    status: watch::Receiver<BackendStatus>,
    /// Wakes the dispatcher when primary items are ready.
    ready_notify: Notify,
    /// Fired whenever the primary tier drains to zero.
    idle_notify: Notify,
}

impl ModelQueue {
    pub fn new(
        model: String,
        limits: QueueLimits,
        store: Arc<dyn Store>,
        recorder: Arc<Recorder>,
        status: watch::Receiver<BackendStatus>,
    ) -> Self {
        Self {
            model,
            limits,
            state: Mutex::new(QueueState::default()),
            store,
            recorder,
            status,
            ready_notify: Notify::new(),
            idle_notify: Notify::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn backend_status(&self) -> BackendStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<BackendStatus> {
        self.status.clone()
    }

    /// Wait until primary items are ready for dispatch.
    pub async fn notified(&self) {
        self.ready_notify.notified().await
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.state.lock().await;
        QueueCounts {
            processing: state.processing.len(),
            waiting: state.waiting_len(),
            total_processed: state.total_processed,
            total_failed: state.total_failed,
            total_timed_out: state.total_timed_out,
        }
    }

    pub async fn processing_count(&self) -> usize {
        self.state.lock().await.processing.len()
    }

    /// True while any item is processing or waiting.
    pub async fn has_work(&self) -> bool {
        let state = self.state.lock().await;
        !state.processing.is_empty() || state.waiting_len() > 0
    }

    /// Current in-memory copy of an active item.
    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        let state = self.state.lock().await;
        state
            .processing
            .get(id)
            .or_else(|| state.find_waiting(id))
            .cloned()
    }

    /// Register for the terminal state of an active item. `None` when the
    /// item is not active in this queue.
    pub async fn subscribe(&self, id: &str) -> Option<oneshot::Receiver<QueueItem>> {
        let mut state = self.state.lock().await;
        if !state.processing.contains_key(id) && state.find_waiting(id).is_none() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(id.to_string()).or_default().push(tx);
        Some(rx)
    }

    /// Ids in the waiting tier in promotion order.
    pub async fn waiting_order(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.waiting.iter().flatten().map(|i| i.id.clone()).collect()
    }

    /// Wait until no item holds a primary slot, up to `grace`.
    /// Returns false if the grace period elapsed first.
    pub async fn wait_idle(&self, grace: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle_notify.notified();
            if self.processing_count().await == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.processing_count().await == 0;
            }
        }
    }
}
