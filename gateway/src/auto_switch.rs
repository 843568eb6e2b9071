//! Demand-driven backend starts and stops.
//!
//! On every evaluation the switcher counts usage records in the rolling window
//! per model. Stopped (or crashed) models above the start threshold are
//! started; with `auto_stop` enabled, running models that are idle and below
//! the stop threshold are stopped gracefully. All actions go through the
//! lifecycle manager.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;

use modelgate_common::BackendStatus;

use crate::backend::StartOptions;
use crate::config::AutoSwitchConfig;
use crate::error::StoreError;
use crate::lifecycle::LifecycleManager;
use crate::store::Store;

const RECENT_DECISIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchAction {
    Start,
    Stop,
}

/// One start/stop decision, kept for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchDecision {
    pub model: String,
    pub action: SwitchAction,
    pub reason: String,
    pub usage_count: u64,
    pub threshold: u64,
    pub decided_at: DateTime<Utc>,
    /// Set once the decision has been applied.
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub status: BackendStatus,
    pub window_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoSwitchStatus {
    pub enabled: bool,
    pub auto_stop: bool,
    pub window_days: i64,
    pub start_threshold: u64,
    pub stop_threshold: u64,
    pub models: Vec<ModelUsage>,
    pub recent_decisions: Vec<SwitchDecision>,
}

pub struct AutoSwitcher {
    config: AutoSwitchConfig,
    lifecycle: Arc<LifecycleManager>,
    store: Arc<dyn Store>,
    last_action: Mutex<HashMap<String, DateTime<Utc>>>,
    recent: Mutex<VecDeque<SwitchDecision>>,
}

impl AutoSwitcher {
    pub fn new(
        config: AutoSwitchConfig,
        lifecycle: Arc<LifecycleManager>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            store,
            last_action: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn in_cooldown(&self, model: &str, now: DateTime<Utc>) -> bool {
        let last_action = match self.last_action.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last_action
            .get(model)
            .is_some_and(|at| now - *at < self.config.cooldown())
    }

    /// Decide which models to start or stop. Pure read: nothing is applied.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<SwitchDecision>, StoreError> {
        let since = now - self.config.window();
        let mut decisions = Vec::new();

        for model in self.lifecycle.models() {
            let Some(status) = self.lifecycle.status(&model) else {
                continue;
            };
            if self.in_cooldown(&model, now) {
                continue;
            }

            let count = self.store.count_usage_since(&model, since)?;
            match status {
                BackendStatus::Stopped | BackendStatus::Crashed
                    if count > self.config.start_threshold =>
                {
                    decisions.push(SwitchDecision {
                        model: model.clone(),
                        action: SwitchAction::Start,
                        reason: format!(
                            "{} requests in the last {} days while {}",
                            count, self.config.window_days, status
                        ),
                        usage_count: count,
                        threshold: self.config.start_threshold,
                        decided_at: now,
                        outcome: None,
                    });
                }
                BackendStatus::Running
                    if self.config.auto_stop && count < self.config.stop_threshold =>
                {
                    let idle = match self.lifecycle.queue(&model) {
                        Some(queue) => !queue.has_work().await,
                        None => false,
                    };
                    if idle {
                        decisions.push(SwitchDecision {
                            model: model.clone(),
                            action: SwitchAction::Stop,
                            reason: format!(
                                "{} requests in the last {} days and no queued work",
                                count, self.config.window_days
                            ),
                            usage_count: count,
                            threshold: self.config.stop_threshold,
                            decided_at: now,
                            outcome: None,
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(decisions)
    }

    /// Evaluate and apply. Starts run concurrently; stops are graceful.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<SwitchDecision>, StoreError> {
        let decisions = self.evaluate(now).await?;
        if decisions.is_empty() {
            return Ok(decisions);
        }

        for decision in &decisions {
            tracing::info!(
                model = %decision.model,
                action = ?decision.action,
                usage_count = decision.usage_count,
                threshold = decision.threshold,
                reason = %decision.reason,
                "Auto-switch decision"
            );
            match self.last_action.lock() {
                Ok(mut guard) => guard.insert(decision.model.clone(), now),
                Err(poisoned) => poisoned.into_inner().insert(decision.model.clone(), now),
            };
        }

        let applied = join_all(decisions.into_iter().map(|decision| self.apply(decision))).await;

        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for decision in &applied {
            if recent.len() == RECENT_DECISIONS {
                recent.pop_front();
            }
            recent.push_back(decision.clone());
        }
        Ok(applied)
    }

    async fn apply(&self, mut decision: SwitchDecision) -> SwitchDecision {
        let result = match decision.action {
            SwitchAction::Start => {
                self.lifecycle
                    .start(&decision.model, StartOptions::default())
                    .await
            }
            SwitchAction::Stop => self.lifecycle.stop(&decision.model, true).await,
        };

        let outcome = match result {
            Ok(state) => state.status.to_string(),
            Err(e) => {
                tracing::warn!(model = %decision.model, action = ?decision.action, "Auto-switch action failed: {}", e);
                format!("error: {}", e)
            }
        };
        decision.outcome = Some(outcome);
        decision
    }

    /// Run the evaluation loop forever.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("Auto-switch disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                tracing::error!("Auto-switch evaluation failed: {}", e);
            }
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<AutoSwitchStatus, StoreError> {
        let since = now - self.config.window();
        let mut models = Vec::new();
        for model in self.lifecycle.models() {
            let Some(status) = self.lifecycle.status(&model) else {
                continue;
            };
            let window_count = self.store.count_usage_since(&model, since)?;
            models.push(ModelUsage {
                model,
                status,
                window_count,
            });
        }

        let recent_decisions = match self.recent.lock() {
            Ok(guard) => guard.iter().rev().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().rev().cloned().collect(),
        };

        Ok(AutoSwitchStatus {
            enabled: self.config.enabled,
            auto_stop: self.config.auto_stop,
            window_days: self.config.window_days,
            start_threshold: self.config.start_threshold,
            stop_threshold: self.config.stop_threshold,
            models,
            recent_decisions,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use modelgate_common::UsageRecord;

    use super::*;
    use crate::config::Config;
    use crate::recorder::Recorder;
    use crate::test_util::{memory_store, test_config, MockBackend};

    struct Harness {
        switcher: AutoSwitcher,
        lifecycle: Arc<LifecycleManager>,
        backend: Arc<MockBackend>,
        store: Arc<dyn Store>,
    }

    fn harness(config: Config) -> Harness {
        let store = memory_store();
        let recorder = Arc::new(Recorder::new(store.clone(), Duration::days(15)));
        let backend = Arc::new(MockBackend::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            &config,
            backend.clone(),
            store.clone(),
            recorder,
        ));
        let switcher = AutoSwitcher::new(config.auto_switch.clone(), lifecycle.clone(), store.clone());
        Harness {
            switcher,
            lifecycle,
            backend,
            store,
        }
    }

    fn record_usage(store: &dyn Store, model: &str, count: usize, at: DateTime<Utc>) {
        for _ in 0..count {
            let mut record = UsageRecord::new(model.to_string(), "client".to_string(), true);
            record.timestamp = at;
            store.append_usage(&record).unwrap();
        }
    }

    #[tokio::test]
    async fn test_usage_above_threshold_starts_stopped_model() {
        let h = harness(test_config(&["chat", "ocr"]));
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 11, now - Duration::days(2));

        let decisions = h.switcher.run_once(now).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].model, "ocr");
        assert_eq!(decisions[0].action, SwitchAction::Start);
        assert_eq!(decisions[0].usage_count, 11);
        assert_eq!(decisions[0].outcome.as_deref(), Some("running"));

        assert_eq!(h.backend.starts().len(), 1);
        assert_eq!(h.backend.starts()[0].0, "ocr");
        assert_eq!(h.lifecycle.status("ocr"), Some(BackendStatus::Running));
        assert_eq!(h.lifecycle.status("chat"), Some(BackendStatus::Stopped));
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let h = harness(test_config(&["ocr"]));
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 10, now - Duration::hours(1));

        assert!(h.switcher.evaluate(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_outside_window_is_ignored() {
        let h = harness(test_config(&["ocr"]));
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 20, now - Duration::days(8));

        assert!(h.switcher.evaluate(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_model_is_not_restarted() {
        let h = harness(test_config(&["ocr"]));
        h.lifecycle.start("ocr", StartOptions::default()).await.unwrap();
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 50, now);

        assert!(h.switcher.run_once(now).await.unwrap().is_empty());
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_stop_idle_model() {
        let mut config = test_config(&["ocr"]);
        config.auto_switch.auto_stop = true;
        config.auto_switch.stop_threshold = 1;
        let h = harness(config);
        h.lifecycle.start("ocr", StartOptions::default()).await.unwrap();

        let decisions = h.switcher.run_once(Utc::now()).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, SwitchAction::Stop);
        assert_eq!(h.lifecycle.status("ocr"), Some(BackendStatus::Stopped));
    }

    #[tokio::test]
    async fn test_auto_stop_disabled_by_default() {
        let h = harness(test_config(&["ocr"]));
        h.lifecycle.start("ocr", StartOptions::default()).await.unwrap();

        assert!(h.switcher.evaluate(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_decisions() {
        let mut config = test_config(&["ocr"]);
        config.auto_switch.cooldown_secs = 600;
        let h = harness(config);
        h.backend
            .fail_start(Some(crate::error::BackendError::Launch("boom".to_string())));
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 11, now);

        assert_eq!(h.switcher.run_once(now).await.unwrap().len(), 1);
        assert_eq!(h.lifecycle.status("ocr"), Some(BackendStatus::Crashed));

        assert!(h.switcher.run_once(now + Duration::seconds(60)).await.unwrap().is_empty());
        assert_eq!(
            h.switcher
                .run_once(now + Duration::seconds(601))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_status_reports_counts_and_decisions() {
        let h = harness(test_config(&["chat", "ocr"]));
        let now = Utc::now();
        record_usage(h.store.as_ref(), "ocr", 11, now);
        record_usage(h.store.as_ref(), "chat", 3, now);
        h.switcher.run_once(now).await.unwrap();

        let status = h.switcher.status(now).unwrap();
        assert!(status.enabled);
        assert_eq!(status.start_threshold, 10);
        assert_eq!(status.models.len(), 2);
        assert_eq!(status.models[0].model, "chat");
        assert_eq!(status.models[0].window_count, 3);
        assert_eq!(status.models[1].window_count, 11);
        assert_eq!(status.recent_decisions.len(), 1);
    }
}
