//! Admission, promotion, completion, retry and timeout paths.
//!
//! Each public operation takes the queue lock once, writes the durable copy of
//! every transition before committing it in memory, and releases the lock
//! before returning.

use chrono::{DateTime, Utc};
use tokio::sync::MutexGuard;

use modelgate_common::{CrashRecord, ErrorKind, ItemEvent, ItemState, Priority, QueueItem};

use super::{ModelQueue, QueueState};
use crate::error::{BackendError, QueueError};

/// What happened to an item reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the waiting tier at the front of its priority class.
    Requeued,
    /// Terminal `FAILED`.
    Failed,
    /// The report was stale (item expired, aborted, or already retried).
    Ignored,
}

impl ModelQueue {
    /// Admit a new item. Never waits on a backend: the item either takes a
    /// primary slot, takes a waiting slot, or is rejected.
    pub async fn enqueue(
        &self,
        client_id: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<QueueItem, QueueError> {
        let mut item = QueueItem::new(
            self.model.clone(),
            client_id.to_string(),
            payload,
            priority,
            self.limits.timeout,
        );
        let now = item.submitted_at;

        let mut state = self.state.lock().await;

        let status = self.backend_status();
        if !status.accepts_work() {
            return Err(QueueError::ModelUnavailable {
                model: self.model.clone(),
                status,
            });
        }

        // Older waiting items go first.
        self.fill_locked(&mut state, now)?;

        if state.processing.len() < self.limits.max_concurrent {
            item.apply(ItemEvent::Admit, now)?;
            self.store.upsert_item(&item)?;
            state.ready.push_back(item.id.clone());
            state.processing.insert(item.id.clone(), item.clone());
            drop(state);
            self.ready_notify.notify_one();

            tracing::debug!(model = %self.model, item_id = %item.id, priority = %priority, "Admitted to primary tier");
        } else if state.waiting_len() < self.limits.max_waiting {
            self.store.upsert_item(&item)?;
            state.waiting[priority.rank()].push_back(item.clone());

            tracing::debug!(
                model = %self.model,
                item_id = %item.id,
                priority = %priority,
                waiting = state.waiting_len(),
                "Admitted to waiting tier"
            );
        } else {
            tracing::warn!(
                model = %self.model,
                processing = state.processing.len(),
                waiting = state.waiting_len(),
                "Queue full, rejecting request"
            );
            return Err(QueueError::QueueFull {
                model: self.model.clone(),
            });
        }

        Ok(item)
    }

    /// Promote the next waiting item into a free primary slot, if the backend
    /// accepts work and a slot is free.
    pub async fn dequeue_next(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state.lock().await;
        let promoted = self.promote_one_locked(&mut state, Utc::now())?;
        drop(state);
        if promoted.is_some() {
            self.ready_notify.notify_one();
        }
        Ok(promoted)
    }

    /// Promote waiting items until the primary tier is saturated.
    pub async fn fill(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        self.fill_locked(&mut state, Utc::now())
    }

    /// Hand primary items that are not yet in flight to the dispatcher.
    pub async fn take_dispatchable(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.ready.drain(..).collect();
        ids.iter()
            .filter_map(|id| state.processing.get(id).cloned())
            .collect()
    }

    /// Record a successful backend call for the given attempt.
    /// Returns false when the report is stale.
    pub async fn complete(
        &self,
        id: &str,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(mut item) = self.in_flight(&state, id, attempt) else {
            return Ok(false);
        };

        item.result = Some(result);
        item.error = None;
        self.finalize_locked(&mut state, item, ItemEvent::Succeed, now, None)?;
        self.release_locked(&mut state, now)?;
        Ok(true)
    }

    /// Record a failed backend call for the given attempt and apply the retry
    /// policy.
    pub async fn fail(
        &self,
        id: &str,
        attempt: u32,
        error: &BackendError,
    ) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(mut item) = self.in_flight(&state, id, attempt) else {
            return Ok(FailOutcome::Ignored);
        };

        item.attempt += 1;
        let outcome = if error.is_transient() {
            self.retry_or_fail_locked(&mut state, item, now, error.to_string())?
        } else {
            let detail = error.to_string();
            self.finalize_locked(
                &mut state,
                item,
                ItemEvent::Fail,
                now,
                Some((ErrorKind::FatalBackend, detail)),
            )?;
            FailOutcome::Failed
        };

        self.release_locked(&mut state, now)?;
        Ok(outcome)
    }

    /// Fail every primary item as an aborted attempt and apply the retry
    /// policy to each. Used by forced stops and crashes.
    ///
    /// Items whose durable write fails stay in the primary tier; the first
    /// such error is returned once every other item has been handled.
    pub async fn abort_in_flight(&self, reason: &str) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        // Newest first, so pushing each to the front keeps submission order.
        let mut items: Vec<QueueItem> = state.processing.values().cloned().collect();
        items.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));

        let mut aborted = 0;
        let mut first_error = None;
        for mut item in items {
            let id = item.id.clone();
            item.attempt += 1;
            match self.retry_or_fail_locked(&mut state, item, now, reason.to_string()) {
                Ok(_) => aborted += 1,
                Err(e) => {
                    tracing::error!(model = %self.model, item_id = %id, "Failed to abort in-flight item: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(model = %self.model, aborted, reason = %reason, "Aborted in-flight items");
        }

        self.release_locked(&mut state, now)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(aborted),
        }
    }

    /// Expire every item past its deadline, in any tier. Returns the number
    /// of items timed out.
    ///
    /// Items whose durable write fails stay where they are and are picked up
    /// again by the next sweep.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;

        let expired: Vec<QueueItem> = state
            .processing
            .values()
            .chain(state.waiting.iter().flatten())
            .filter(|item| item.is_expired(now))
            .cloned()
            .collect();

        let mut count = 0;
        let mut first_error = None;
        for item in expired {
            let id = item.id.clone();
            let detail = format!(
                "deadline elapsed while {} (attempt {})",
                item.state, item.attempt
            );
            match self.finalize_locked(
                &mut state,
                item,
                ItemEvent::Expire,
                now,
                Some((ErrorKind::Timeout, detail)),
            ) {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::error!(model = %self.model, item_id = %id, "Failed to time out item: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if count > 0 {
            tracing::warn!(model = %self.model, count, "Timed out items past their deadline");
        }

        self.release_locked(&mut state, now)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Copy of the primary item for `id` if `attempt` is its current one.
    fn in_flight(&self, state: &QueueState, id: &str, attempt: u32) -> Option<QueueItem> {
        match state.processing.get(id) {
            Some(item) if item.attempt == attempt => Some(item.clone()),
            Some(item) => {
                tracing::warn!(
                    model = %self.model,
                    item_id = %id,
                    attempt,
                    current_attempt = item.attempt,
                    "Ignoring result for a superseded attempt"
                );
                None
            }
            None => {
                tracing::warn!(model = %self.model, item_id = %id, "Ignoring late result for inactive item");
                None
            }
        }
    }

    /// Requeue at the front of the item's class if the retry budget allows
    /// and there is waiting capacity, otherwise fail it. `item` is a copy;
    /// the original leaves the primary tier only once the write succeeds.
    fn retry_or_fail_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        mut item: QueueItem,
        now: DateTime<Utc>,
        reason: String,
    ) -> Result<FailOutcome, QueueError> {
        if item.attempt > self.limits.max_retries {
            let detail = format!("{} attempts failed, last error: {}", item.attempt, reason);
            self.finalize_locked(
                state,
                item,
                ItemEvent::Fail,
                now,
                Some((ErrorKind::RetriesExhausted, detail)),
            )?;
            return Ok(FailOutcome::Failed);
        }

        // A running backend takes the next waiting item into the slot this
        // one releases, so the waiting bound holds after the release.
        let others = state
            .processing
            .len()
            .saturating_sub(usize::from(state.processing.contains_key(&item.id)));
        let has_room = state.waiting_len() < self.limits.max_waiting
            || (self.backend_status().accepts_work() && others < self.limits.max_concurrent);
        if !has_room {
            let detail = format!("no waiting capacity to retry: {}", reason);
            self.finalize_locked(
                state,
                item,
                ItemEvent::Fail,
                now,
                Some((ErrorKind::RequeueRejected, detail)),
            )?;
            return Ok(FailOutcome::Failed);
        }

        item.apply(ItemEvent::Requeue, now)?;
        item.error = Some(reason);
        self.store.upsert_item(&item)?;
        state.detach(&item.id);

        tracing::warn!(
            model = %self.model,
            item_id = %item.id,
            attempt = item.attempt,
            max_retries = self.limits.max_retries,
            "Requeued after transient failure"
        );
        state.waiting[item.priority.rank()].push_front(item);
        Ok(FailOutcome::Requeued)
    }

    /// Move an item to a terminal state. The durable write comes first; the
    /// item leaves its tier and its waiters fire only once it succeeds.
    pub(super) fn finalize_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        mut item: QueueItem,
        event: ItemEvent,
        now: DateTime<Utc>,
        crash: Option<(ErrorKind, String)>,
    ) -> Result<(), QueueError> {
        item.apply(event, now)?;
        if let Some((_, ref detail)) = crash {
            item.error = Some(detail.clone());
        }
        self.store.upsert_item(&item)?;
        state.detach(&item.id);

        match item.state {
            ItemState::Succeeded => state.total_processed += 1,
            ItemState::Failed => state.total_failed += 1,
            ItemState::TimedOut => state.total_timed_out += 1,
            ItemState::Pending | ItemState::Processing => {}
        }

        tracing::debug!(model = %self.model, item_id = %item.id, state = %item.state, "Item finished");

        if let Some((kind, detail)) = crash {
            self.recorder.record_crash_logged(CrashRecord::for_item(
                &self.model,
                &item.id,
                item.attempt,
                kind,
                detail,
            ));
        }

        state.signal(&item);
        Ok(())
    }

    /// Take the highest priority waiting item into the primary tier.
    /// Expired items met on the way are timed out instead.
    fn promote_one_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        if !self.backend_status().accepts_work() {
            return Ok(None);
        }

        while state.processing.len() < self.limits.max_concurrent {
            let Some(item) = state.pop_waiting() else {
                return Ok(None);
            };

            if item.is_expired(now) {
                let detail = format!("deadline elapsed while pending (attempt {})", item.attempt);
                if let Err(e) = self.finalize_locked(
                    state,
                    item.clone(),
                    ItemEvent::Expire,
                    now,
                    Some((ErrorKind::Timeout, detail)),
                ) {
                    state.waiting[item.priority.rank()].push_front(item);
                    return Err(e);
                }
                continue;
            }

            let mut admitted = item.clone();
            if let Err(e) = admitted.apply(ItemEvent::Admit, now) {
                state.waiting[item.priority.rank()].push_front(item);
                return Err(e.into());
            }
            if let Err(e) = self.store.upsert_item(&admitted) {
                state.waiting[item.priority.rank()].push_front(item);
                return Err(e.into());
            }

            tracing::debug!(model = %self.model, item_id = %admitted.id, "Promoted to primary tier");
            state.ready.push_back(admitted.id.clone());
            state
                .processing
                .insert(admitted.id.clone(), admitted.clone());
            return Ok(Some(admitted));
        }
        Ok(None)
    }

    fn fill_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let mut promoted = 0;
        while self.promote_one_locked(state, now)?.is_some() {
            promoted += 1;
        }
        if promoted > 0 {
            self.ready_notify.notify_one();
        }
        Ok(promoted)
    }

    /// Refill freed slots and wake stop waiters once the primary tier is empty.
    fn release_locked(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.fill_locked(state, now)?;
        if state.processing.is_empty() {
            self.idle_notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    use super::*;
    use std::sync::Arc;

    use crate::queue::tests::{fixture, fixture_with_store, limits, FlakyStore};
    use modelgate_common::BackendStatus;

    async fn submit(fx: &crate::queue::tests::Fixture, priority: Priority) -> QueueItem {
        fx.queue
            .enqueue("client", json!({"prompt": "x"}), priority)
            .await
            .unwrap()
    }

    fn transient() -> BackendError {
        BackendError::Transient("connection reset".to_string())
    }

    #[tokio::test]
    async fn test_admits_primary_then_waiting_then_rejects() {
        let fx = fixture(limits(1, 1));

        let a = submit(&fx, Priority::Normal).await;
        assert_eq!(a.state, ItemState::Processing);

        let b = submit(&fx, Priority::Normal).await;
        assert_eq!(b.state, ItemState::Pending);

        let err = fx
            .queue
            .enqueue("client", json!({}), Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { .. }));

        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn test_enqueue_requires_running_backend() {
        let fx = fixture(limits(1, 1));
        for status in [
            BackendStatus::Stopped,
            BackendStatus::Starting,
            BackendStatus::Stopping,
            BackendStatus::Crashed,
        ] {
            fx.status.send_replace(status);
            let err = fx
                .queue
                .enqueue("client", json!({}), Priority::Normal)
                .await
                .unwrap_err();
            assert!(matches!(err, QueueError::ModelUnavailable { .. }));
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_admit() {
        let fx = fixture(limits(1, 1));
        let a = submit(&fx, Priority::Low).await;
        let stored = fx.store.get_item(&a.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Processing);
        assert_eq!(stored.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_priority_promotion_order() {
        let fx = fixture(limits(1, 10));
        let blocker = submit(&fx, Priority::Normal).await;

        let a = submit(&fx, Priority::Low).await;
        let b = submit(&fx, Priority::High).await;
        let c = submit(&fx, Priority::Normal).await;

        let mut order = Vec::new();
        let mut current = blocker;
        for _ in 0..3 {
            fx.queue
                .complete(&current.id, current.attempt, json!({}))
                .await
                .unwrap();
            let next = fx.queue.take_dispatchable().await;
            assert_eq!(next.len(), 1);
            current = next.into_iter().next().unwrap();
            order.push(current.id.clone());
        }

        assert_eq!(order, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn test_fifo_within_class() {
        let fx = fixture(limits(1, 10));
        let blocker = submit(&fx, Priority::Normal).await;

        let first = submit(&fx, Priority::High).await;
        let second = submit(&fx, Priority::High).await;
        assert_eq!(
            fx.queue.waiting_order().await,
            vec![first.id.clone(), second.id.clone()]
        );

        fx.queue.complete(&blocker.id, 0, json!({})).await.unwrap();
        let promoted = fx.queue.take_dispatchable().await;
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, first.id);
        assert_eq!(promoted[0].submitted_at, first.submitted_at);
    }

    #[tokio::test]
    async fn test_dequeue_next_respects_slot_limit() {
        let fx = fixture(limits(1, 5));
        fx.status.send_replace(BackendStatus::Stopped);
        assert!(fx.queue.dequeue_next().await.unwrap().is_none());

        fx.status.send_replace(BackendStatus::Running);
        let a = submit(&fx, Priority::Normal).await;
        let _b = submit(&fx, Priority::Normal).await;
        // Slot held by `a`.
        assert!(fx.queue.dequeue_next().await.unwrap().is_none());

        fx.queue.complete(&a.id, 0, json!({})).await.unwrap();
        // `complete` already promoted `b`.
        assert_eq!(fx.queue.counts().await.processing, 1);
        assert!(fx.queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let fx = fixture(limits(1, 1));
        let item = submit(&fx, Priority::Normal).await;

        let mut outcomes = Vec::new();
        for attempt in 0..=3 {
            let dispatched = fx.queue.take_dispatchable().await;
            assert_eq!(dispatched.len(), 1);
            assert_eq!(dispatched[0].attempt, attempt);
            outcomes.push(fx.queue.fail(&item.id, attempt, &transient()).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                FailOutcome::Requeued,
                FailOutcome::Requeued,
                FailOutcome::Requeued,
                FailOutcome::Failed
            ]
        );

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Failed);
        assert_eq!(stored.attempt, 4);

        let crashes = fx.store.list_crashes(10).unwrap();
        let for_item: Vec<_> = crashes
            .iter()
            .filter(|c| c.request_id.as_deref() == Some(item.id.as_str()))
            .collect();
        assert_eq!(for_item.len(), 1);
        assert_eq!(for_item[0].attempt, Some(4));
        assert_eq!(for_item[0].error_kind, ErrorKind::RetriesExhausted);

        let counts = fx.queue.counts().await;
        assert_eq!(counts.total_failed, 1);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test]
    async fn test_retry_goes_to_front_of_class() {
        let fx = fixture(limits(1, 5));
        let a = submit(&fx, Priority::Normal).await;
        let b = submit(&fx, Priority::Normal).await;
        fx.queue.take_dispatchable().await;

        // Backend stops accepting work: the retried item must wait, ahead of `b`.
        fx.status.send_replace(BackendStatus::Stopping);
        let outcome = fx.queue.fail(&a.id, 0, &transient()).await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);
        assert_eq!(fx.queue.waiting_order().await, vec![a.id.clone(), b.id.clone()]);
    }

    #[tokio::test]
    async fn test_requeue_rejected_without_capacity() {
        let fx = fixture(limits(1, 1));
        let a = submit(&fx, Priority::Normal).await;
        let _b = submit(&fx, Priority::Normal).await;
        fx.queue.take_dispatchable().await;

        fx.status.send_replace(BackendStatus::Crashed);
        let outcome = fx.queue.fail(&a.id, 0, &transient()).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let crashes = fx.store.list_crashes(10).unwrap();
        assert_eq!(crashes[0].error_kind, ErrorKind::RequeueRejected);
        assert_eq!(fx.queue.counts().await.waiting, 1);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_immediately() {
        let fx = fixture(limits(2, 2));
        let item = submit(&fx, Priority::Normal).await;
        let outcome = fx
            .queue
            .fail(&item.id, 0, &BackendError::Fatal("payload rejected".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Failed);
        assert_eq!(fx.store.list_crashes(1).unwrap()[0].error_kind, ErrorKind::FatalBackend);
    }

    #[tokio::test]
    async fn test_stale_attempt_is_ignored() {
        let fx = fixture(limits(1, 1));
        let item = submit(&fx, Priority::Normal).await;
        fx.queue.fail(&item.id, 0, &transient()).await.unwrap();

        // Attempt 0 was already retried; its late success must not count.
        assert!(!fx.queue.complete(&item.id, 0, json!({})).await.unwrap());
        assert!(fx.queue.complete(&item.id, 1, json!({"ok": true})).await.unwrap());
        assert_eq!(fx.queue.counts().await.total_processed, 1);
    }

    #[tokio::test]
    async fn test_sweep_times_out_processing_item() {
        let fx = fixture(limits(1, 1));
        let stuck = submit(&fx, Priority::Normal).await;
        let waiting = submit(&fx, Priority::Normal).await;

        // Not yet expired.
        assert_eq!(fx.queue.sweep_timeouts(Utc::now()).await.unwrap(), 0);

        let later = stuck.deadline + Duration::seconds(1);
        assert_eq!(fx.queue.sweep_timeouts(later).await.unwrap(), 2);

        let stored = fx.store.get_item(&stuck.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::TimedOut);
        assert_eq!(
            fx.store.get_item(&waiting.id).unwrap().unwrap().state,
            ItemState::TimedOut
        );

        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.total_timed_out, 2);

        // The backend call finally returns: ignored.
        assert!(!fx.queue.complete(&stuck.id, 0, json!({})).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_signal() {
        let fx = fixture(limits(1, 1));
        let item = submit(&fx, Priority::Normal).await;
        let rx = fx.queue.subscribe(&item.id).await.unwrap();

        fx.queue.complete(&item.id, 0, json!({"text": "done"})).await.unwrap();

        let finished = rx.await.unwrap();
        assert_eq!(finished.state, ItemState::Succeeded);
        assert_eq!(finished.result, Some(json!({"text": "done"})));
    }

    #[tokio::test]
    async fn test_abort_in_flight_requeues() {
        let fx = fixture(limits(2, 5));
        let a = submit(&fx, Priority::Normal).await;
        let b = submit(&fx, Priority::Normal).await;

        fx.status.send_replace(BackendStatus::Stopping);
        assert_eq!(fx.queue.abort_in_flight("forced stop").await.unwrap(), 2);

        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.waiting, 2);
        assert_eq!(fx.queue.waiting_order().await, vec![a.id.clone(), b.id.clone()]);
        assert_eq!(fx.queue.get(&a.id).await.unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_metrics_counters() {
        let fx = fixture(limits(10, 10));
        let mut items = Vec::new();
        for _ in 0..5 {
            items.push(submit(&fx, Priority::Normal).await);
        }
        for item in &items[..3] {
            fx.queue.complete(&item.id, 0, json!({})).await.unwrap();
        }
        fx.queue
            .fail(&items[3].id, 0, &BackendError::Fatal("no".to_string()))
            .await
            .unwrap();

        let counts = fx.queue.counts().await;
        assert_eq!(counts.total_processed, 3);
        assert_eq!(counts.total_failed, 1);
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn test_bounds_hold_under_concurrent_load() {
        let fx = fixture(limits(3, 4));
        let queue = fx.queue.clone();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut rng = rand::rngs::StdRng::seed_from_u64(worker);
                for _ in 0..50 {
                    match rng.gen_range(0..4) {
                        0 | 1 => {
                            let priority = Priority::ALL[rng.gen_range(0..3)];
                            let _ = queue.enqueue("fuzz", json!({}), priority).await;
                        }
                        2 => {
                            for item in queue.take_dispatchable().await {
                                let _ = queue.complete(&item.id, item.attempt, json!({})).await;
                            }
                        }
                        _ => {
                            for item in queue.take_dispatchable().await {
                                let _ = queue.fail(&item.id, item.attempt, &transient()).await;
                            }
                        }
                    }

                    let counts = queue.counts().await;
                    assert!(counts.processing <= 3, "processing {}", counts.processing);
                    assert!(counts.waiting <= 4, "waiting {}", counts.waiting);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_completion_write_keeps_item_in_flight() {
        let store = Arc::new(FlakyStore::new());
        let fx = fixture_with_store(limits(1, 1), store.clone());
        let item = submit(&fx, Priority::Normal).await;
        let rx = fx.queue.subscribe(&item.id).await.unwrap();

        store.fail_item_writes(true);
        assert!(fx.queue.complete(&item.id, 0, json!({})).await.is_err());

        // Memory still agrees with the store.
        let active = fx.queue.get(&item.id).await.unwrap();
        assert_eq!(active.state, ItemState::Processing);
        assert_eq!(active.result, None);
        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total_processed, 0);
        assert_eq!(
            fx.store.get_item(&item.id).unwrap().unwrap().state,
            ItemState::Processing
        );

        // The deadline still applies once the store recovers.
        store.fail_item_writes(false);
        let later = item.deadline + Duration::seconds(1);
        assert_eq!(fx.queue.sweep_timeouts(later).await.unwrap(), 1);
        assert_eq!(rx.await.unwrap().state, ItemState::TimedOut);
        assert_eq!(
            fx.store.get_item(&item.id).unwrap().unwrap().state,
            ItemState::TimedOut
        );
    }

    #[tokio::test]
    async fn test_failed_retry_write_keeps_attempt() {
        let store = Arc::new(FlakyStore::new());
        let fx = fixture_with_store(limits(1, 1), store.clone());
        let item = submit(&fx, Priority::Normal).await;

        store.fail_item_writes(true);
        assert!(fx.queue.fail(&item.id, 0, &transient()).await.is_err());
        assert_eq!(fx.queue.get(&item.id).await.unwrap().attempt, 0);

        store.fail_item_writes(false);
        assert_eq!(
            fx.queue.fail(&item.id, 0, &transient()).await.unwrap(),
            FailOutcome::Requeued
        );
        assert_eq!(fx.store.get_item(&item.id).unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_failed_sweep_write_retried_next_sweep() {
        let store = Arc::new(FlakyStore::new());
        let fx = fixture_with_store(limits(1, 1), store.clone());
        let stuck = submit(&fx, Priority::Normal).await;
        let waiting = submit(&fx, Priority::Normal).await;
        let later = stuck.deadline + Duration::seconds(1);

        store.fail_item_writes(true);
        assert!(fx.queue.sweep_timeouts(later).await.is_err());
        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.total_timed_out, 0);

        store.fail_item_writes(false);
        assert_eq!(fx.queue.sweep_timeouts(later).await.unwrap(), 2);
        for id in [&stuck.id, &waiting.id] {
            assert_eq!(fx.store.get_item(id).unwrap().unwrap().state, ItemState::TimedOut);
        }
    }

    #[tokio::test]
    async fn test_failed_abort_write_leaves_items_in_primary_tier() {
        let store = Arc::new(FlakyStore::new());
        let fx = fixture_with_store(limits(2, 5), store.clone());
        let a = submit(&fx, Priority::Normal).await;
        let _b = submit(&fx, Priority::Normal).await;
        fx.status.send_replace(BackendStatus::Stopping);

        store.fail_item_writes(true);
        assert!(fx.queue.abort_in_flight("forced stop").await.is_err());
        let counts = fx.queue.counts().await;
        assert_eq!(counts.processing, 2);
        assert_eq!(counts.waiting, 0);

        store.fail_item_writes(false);
        assert_eq!(fx.queue.abort_in_flight("forced stop").await.unwrap(), 2);
        assert_eq!(fx.queue.counts().await.waiting, 2);
        assert_eq!(fx.queue.get(&a.id).await.unwrap().attempt, 1);
    }
}
