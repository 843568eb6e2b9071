//! Dispatcher for one model's admission queue.
//!
//! Runs an async loop that hands primary-tier items to the backend. Each call
//! runs in its own task, outside the queue lock; only the outcome is recorded
//! under it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use modelgate_common::{BackendStatus, QueueItem};

use super::{FailOutcome, ModelQueue};
use crate::backend::BackendHandle;

/// Dispatcher that drains one model's primary tier.
pub struct Dispatcher {
    queue: Arc<ModelQueue>,
    backend: Arc<dyn BackendHandle>,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<ModelQueue>,
        backend: Arc<dyn BackendHandle>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            queue,
            backend,
            retry_backoff,
        }
    }

    /// Run the dispatcher loop.
    ///
    /// This method runs indefinitely, dispatching items as slots fill.
    pub async fn run(&self) {
        let mut status = self.queue.status_receiver();
        let check_interval = Duration::from_millis(500);

        loop {
            self.dispatch_ready().await;

            tokio::select! {
                _ = self.queue.notified() => {
                    // New items admitted to the primary tier
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        tracing::debug!(model = %self.queue.model(), "Status channel closed, dispatcher exiting");
                        return;
                    }
                }
                _ = tokio::time::sleep(check_interval) => {
                    // Periodic check
                }
            }
        }
    }

    /// Dispatch every primary item not yet in flight. Returns how many calls
    /// were started.
    pub async fn dispatch_ready(&self) -> usize {
        let status = self.queue.backend_status();

        if status == BackendStatus::Running {
            if let Err(e) = self.queue.fill().await {
                tracing::error!(model = %self.queue.model(), "Failed to promote waiting items: {}", e);
            }
        }

        // Admitted items still run while a graceful stop drains.
        if !matches!(status, BackendStatus::Running | BackendStatus::Stopping) {
            return 0;
        }

        let items = self.queue.take_dispatchable().await;
        let count = items.len();
        for item in items {
            let queue = self.queue.clone();
            let backend = self.backend.clone();
            let backoff = self.retry_backoff;
            tokio::spawn(async move {
                dispatch_one(queue, backend, item, backoff).await;
            });
        }
        count
    }
}

/// Perform one backend call, bounded by the item's remaining deadline.
pub(crate) async fn dispatch_one(
    queue: Arc<ModelQueue>,
    backend: Arc<dyn BackendHandle>,
    item: QueueItem,
    retry_backoff: Duration,
) {
    let model = queue.model().to_string();
    let remaining = (item.deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);

    tracing::debug!(model = %model, item_id = %item.id, attempt = item.attempt, "Dispatching to backend");

    match tokio::time::timeout(remaining, backend.call(&model, &item.payload)).await {
        Ok(Ok(result)) => {
            if let Err(e) = queue.complete(&item.id, item.attempt, result).await {
                tracing::error!(model = %model, item_id = %item.id, "Failed to record completion: {}", e);
            }
        }
        Ok(Err(error)) => {
            if error.is_transient() && !retry_backoff.is_zero() {
                tokio::time::sleep(retry_backoff).await;
            }
            match queue.fail(&item.id, item.attempt, &error).await {
                Ok(FailOutcome::Requeued) => {
                    tracing::warn!(model = %model, item_id = %item.id, "Backend call failed, will retry: {}", error);
                }
                Ok(FailOutcome::Failed) => {
                    tracing::error!(model = %model, item_id = %item.id, "Backend call failed: {}", error);
                }
                Ok(FailOutcome::Ignored) => {}
                Err(e) => {
                    tracing::error!(model = %model, item_id = %item.id, "Failed to record failure: {}", e);
                }
            }
        }
        Err(_elapsed) => {
            tracing::warn!(model = %model, item_id = %item.id, "Backend call exceeded the item deadline");
            if let Err(e) = queue.sweep_timeouts(Utc::now()).await {
                tracing::error!(model = %model, "Timeout sweep failed: {}", e);
            }
        }
    }
}
