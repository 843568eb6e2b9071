//! Crash recovery: rebuild in-memory queues from the durable store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use modelgate_common::{CrashRecord, ErrorKind, ItemEvent, ItemState, QueueItem};

use super::ModelQueue;
use crate::error::QueueError;
use crate::recorder::Recorder;
use crate::store::Store;

/// Outcome of reloading active items after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Items placed back into the primary tier.
    pub admitted: usize,
    /// Items placed back into the waiting tier.
    pub waiting: usize,
    /// Items that were in flight when the process died.
    pub interrupted: usize,
    pub timed_out: usize,
    pub failed: usize,
    /// Items referencing a model this gateway does not serve.
    pub inconsistent: usize,
}

impl RecoveryReport {
    fn merge(&mut self, other: RecoveryReport) {
        self.admitted += other.admitted;
        self.waiting += other.waiting;
        self.interrupted += other.interrupted;
        self.timed_out += other.timed_out;
        self.failed += other.failed;
        self.inconsistent += other.inconsistent;
    }
}

/// Reload every non-terminal item from the store into its model's queue.
pub async fn recover_items(
    store: &dyn Store,
    recorder: &Recorder,
    queues: &HashMap<String, Arc<ModelQueue>>,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, QueueError> {
    let items = store.list_active_items()?;
    let mut report = RecoveryReport::default();

    let mut by_model: HashMap<String, Vec<QueueItem>> = HashMap::new();
    for mut item in items {
        if queues.contains_key(&item.model) {
            by_model.entry(item.model.clone()).or_default().push(item);
            continue;
        }

        tracing::warn!(
            model = %item.model,
            item_id = %item.id,
            "Recovered item references an unknown model"
        );
        let detail = format!("recovered item references unknown model '{}'", item.model);
        item.apply(ItemEvent::Fail, now)?;
        item.error = Some(detail.clone());
        store.upsert_item(&item)?;
        recorder.record_crash_logged(CrashRecord::for_item(
            &item.model,
            &item.id,
            item.attempt,
            ErrorKind::RecoveryInconsistency,
            detail,
        ));
        report.inconsistent += 1;
    }

    for (model, items) in by_model {
        if let Some(queue) = queues.get(&model) {
            report.merge(queue.restore(items, now).await?);
        }
    }

    tracing::info!(
        admitted = report.admitted,
        waiting = report.waiting,
        interrupted = report.interrupted,
        timed_out = report.timed_out,
        failed = report.failed,
        inconsistent = report.inconsistent,
        "Queue recovery complete"
    );
    Ok(report)
}

impl ModelQueue {
    /// Re-admit items reloaded from the store.
    ///
    /// Expired items time out. Items that were in flight count as a failed
    /// attempt. Survivors keep their priority and submission time and, in
    /// promotion order, fill the primary tier (only while the backend takes
    /// work), then the waiting tier. The rest fail as requeue-rejected.
    pub async fn restore(
        &self,
        items: Vec<QueueItem>,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport, QueueError> {
        let mut report = RecoveryReport::default();
        let mut state = self.state.lock().await;

        let mut survivors = Vec::new();
        for mut item in items {
            if state.processing.contains_key(&item.id) || state.find_waiting(&item.id).is_some() {
                continue;
            }

            if item.is_expired(now) {
                let detail = format!("deadline elapsed before recovery (was {})", item.state);
                self.finalize_locked(
                    &mut state,
                    item,
                    ItemEvent::Expire,
                    now,
                    Some((ErrorKind::Timeout, detail)),
                )?;
                report.timed_out += 1;
                continue;
            }

            if item.state == ItemState::Processing {
                report.interrupted += 1;
                item.attempt += 1;
                if item.attempt > self.limits.max_retries {
                    let detail = format!(
                        "{} attempts failed, last attempt interrupted by restart",
                        item.attempt
                    );
                    self.finalize_locked(
                        &mut state,
                        item,
                        ItemEvent::Fail,
                        now,
                        Some((ErrorKind::RetriesExhausted, detail)),
                    )?;
                    report.failed += 1;
                    continue;
                }
                item.apply(ItemEvent::Requeue, now)?;
                item.error = Some("interrupted by restart".to_string());
            }

            survivors.push(item);
        }

        survivors.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.submitted_at.cmp(&b.submitted_at))
        });

        // Only a backend that takes work gets primary items; otherwise they
        // wait as PENDING so a later restart does not charge them an attempt.
        let accepts_work = self.backend_status().accepts_work();
        for mut item in survivors {
            if accepts_work && state.processing.len() < self.limits.max_concurrent {
                item.apply(ItemEvent::Admit, now)?;
                self.store.upsert_item(&item)?;
                state.ready.push_back(item.id.clone());
                state.processing.insert(item.id.clone(), item);
                report.admitted += 1;
            } else if state.waiting_len() < self.limits.max_waiting {
                self.store.upsert_item(&item)?;
                state.waiting[item.priority.rank()].push_back(item);
                report.waiting += 1;
            } else {
                self.finalize_locked(
                    &mut state,
                    item,
                    ItemEvent::Fail,
                    now,
                    Some((
                        ErrorKind::RequeueRejected,
                        "no queue capacity after restart".to_string(),
                    )),
                )?;
                report.failed += 1;
            }
        }

        drop(state);
        if report.admitted > 0 {
            self.ready_notify.notify_one();
        }

        tracing::info!(
            model = %self.model,
            admitted = report.admitted,
            waiting = report.waiting,
            interrupted = report.interrupted,
            "Restored queue"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::queue::tests::{fixture, fixture_with_store, limits};
    use modelgate_common::{BackendStatus, Priority};

    fn stored_item(model: &str, priority: Priority, age_secs: i64) -> QueueItem {
        let mut item = QueueItem::new(
            model.to_string(),
            "client".to_string(),
            json!({"prompt": "recover me"}),
            priority,
            Duration::seconds(300),
        );
        item.submitted_at = item.submitted_at - Duration::seconds(age_secs);
        item.deadline = item.submitted_at + Duration::seconds(300);
        item
    }

    fn queues(fx: &crate::queue::tests::Fixture) -> HashMap<String, Arc<ModelQueue>> {
        let mut map = HashMap::new();
        map.insert("chat".to_string(), fx.queue.clone());
        map
    }

    fn recorder(fx: &crate::queue::tests::Fixture) -> Recorder {
        Recorder::new(fx.store.clone(), Duration::days(15))
    }

    #[tokio::test]
    async fn test_processing_item_is_readmitted_with_attempt_incremented() {
        let fx = fixture(limits(2, 2));

        let mut item = stored_item("chat", Priority::High, 30);
        item.apply(ItemEvent::Admit, item.submitted_at).unwrap();
        item.attempt = 1;
        fx.store.upsert_item(&item).unwrap();

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.admitted, 1);

        let restored = fx.queue.get(&item.id).await.unwrap();
        assert_eq!(restored.state, ItemState::Processing);
        assert_eq!(restored.attempt, 2);
        assert_eq!(restored.priority, Priority::High);
        assert_eq!(restored.submitted_at, item.submitted_at);
        assert_eq!(restored.deadline, item.deadline);

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let fx = fixture(limits(2, 2));
        let item = stored_item("chat", Priority::Normal, 5);
        fx.store.upsert_item(&item).unwrap();

        let now = Utc::now();
        recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), now)
            .await
            .unwrap();
        let again = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), now)
            .await
            .unwrap();

        assert_eq!(again.admitted, 0);
        assert_eq!(fx.queue.counts().await.processing, 1);
        assert_eq!(fx.queue.get(&item.id).await.unwrap().attempt, 0);
    }

    #[tokio::test]
    async fn test_expired_items_time_out() {
        let fx = fixture(limits(2, 2));
        let item = stored_item("chat", Priority::Normal, 400);
        fx.store.upsert_item(&item).unwrap();

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.timed_out, 1);

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::TimedOut);
        assert_eq!(fx.store.list_crashes(1).unwrap()[0].error_kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_model_becomes_crash_record() {
        let fx = fixture(limits(2, 2));
        let item = stored_item("retired-model", Priority::Normal, 5);
        fx.store.upsert_item(&item).unwrap();

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.inconsistent, 1);

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Failed);
        let crash = &fx.store.list_crashes(1).unwrap()[0];
        assert_eq!(crash.error_kind, ErrorKind::RecoveryInconsistency);
        assert_eq!(crash.request_id.as_deref(), Some(item.id.as_str()));
    }

    #[tokio::test]
    async fn test_overflow_fails_lowest_priority_last() {
        let fx = fixture(limits(1, 1));
        let low = stored_item("chat", Priority::Low, 30);
        let high = stored_item("chat", Priority::High, 10);
        let normal = stored_item("chat", Priority::Normal, 20);
        for item in [&low, &high, &normal] {
            fx.store.upsert_item(item).unwrap();
        }

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(report.waiting, 1);
        assert_eq!(report.failed, 1);

        assert_eq!(
            fx.queue.get(&high.id).await.unwrap().state,
            ItemState::Processing
        );
        assert_eq!(fx.queue.waiting_order().await, vec![normal.id.clone()]);
        assert_eq!(
            fx.store.get_item(&low.id).unwrap().unwrap().state,
            ItemState::Failed
        );
    }

    #[tokio::test]
    async fn test_interrupted_item_past_retry_budget_fails() {
        let fx = fixture(limits(2, 2));
        let mut item = stored_item("chat", Priority::Normal, 5);
        item.apply(ItemEvent::Admit, item.submitted_at).unwrap();
        item.attempt = 3;
        fx.store.upsert_item(&item).unwrap();

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let stored = fx.store.get_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Failed);
        assert_eq!(stored.attempt, 4);
    }

    #[tokio::test]
    async fn test_stopped_backend_keeps_recovered_items_pending() {
        let fx = fixture(limits(2, 2));
        fx.status.send_replace(BackendStatus::Stopped);

        let mut interrupted = stored_item("chat", Priority::High, 30);
        interrupted.apply(ItemEvent::Admit, interrupted.submitted_at).unwrap();
        let pending = stored_item("chat", Priority::Normal, 20);
        for item in [&interrupted, &pending] {
            fx.store.upsert_item(item).unwrap();
        }

        let report = recover_items(fx.store.as_ref(), &recorder(&fx), &queues(&fx), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.admitted, 0);
        assert_eq!(report.waiting, 2);
        assert_eq!(
            fx.queue.waiting_order().await,
            vec![interrupted.id.clone(), pending.id.clone()]
        );

        let stored = fx.store.get_item(&interrupted.id).unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Pending);
        assert_eq!(stored.attempt, 1);

        // Once the backend runs, the items are promoted and dispatched.
        fx.status.send_replace(BackendStatus::Running);
        assert_eq!(fx.queue.fill().await.unwrap(), 2);
        assert_eq!(fx.queue.take_dispatchable().await.len(), 2);
    }

    #[tokio::test]
    async fn test_restarts_with_stopped_backend_do_not_consume_attempts() {
        let fx = fixture(limits(2, 2));
        let item = stored_item("chat", Priority::Normal, 5);
        fx.store.upsert_item(&item).unwrap();

        // Each generation gets a fresh queue over the same store.
        for generation in 0..2 {
            let next = fixture_with_store(limits(2, 2), fx.store.clone());
            next.status.send_replace(BackendStatus::Stopped);
            let report = recover_items(
                next.store.as_ref(),
                &recorder(&next),
                &queues(&next),
                Utc::now(),
            )
            .await
            .unwrap();
            assert_eq!(report.interrupted, 0, "generation {}", generation);
            assert_eq!(report.waiting, 1, "generation {}", generation);

            let stored = fx.store.get_item(&item.id).unwrap().unwrap();
            assert_eq!(stored.state, ItemState::Pending);
            assert_eq!(stored.attempt, 0);
        }
    }
}
