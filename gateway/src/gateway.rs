//! Gateway facade.
//!
//! Owns every component and exposes the operations the HTTP adapter maps onto:
//! submission, item status, admin lifecycle control, metrics, and the crash
//! and usage logs. Also spawns the background loops (dispatch, deadline sweep,
//! health probes, auto-switch, history pruning).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use modelgate_common::{
    BackendState, BackendStatus, CrashRecord, ItemState, Priority, QueueItem, UsageRecord,
};

use crate::auto_switch::{AutoSwitchStatus, AutoSwitcher};
use crate::backend::{BackendHandle, StartOptions};
use crate::config::Config;
use crate::error::{GatewayError, LifecycleError, Result};
use crate::lifecycle::LifecycleManager;
use crate::metrics::QueueMetrics;
use crate::queue::{recover_items, Dispatcher, ModelQueue, RecoveryReport};
use crate::recorder::Recorder;
use crate::store::Store;

/// How long a submit that triggered a resolution switch waits for the
/// backend to leave `RUNNING`.
const SWITCH_SETTLE: Duration = Duration::from_secs(1);

/// Wait up to `timeout` for a backend to leave `RUNNING`. Returns false when
/// it is still running at the timeout.
async fn settle_switch(mut status: watch::Receiver<BackendStatus>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, status.wait_for(|s| *s != BackendStatus::Running)).await,
        Ok(Ok(_))
    )
}

/// One client submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub model: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub client_id: String,
    /// Requested backend variant, for models that have several.
    pub resolution: Option<String>,
}

impl SubmitRequest {
    pub fn new(model: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            payload,
            priority: Priority::Normal,
            client_id: "anonymous".to_string(),
            resolution: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn resolution(mut self, resolution: Option<String>) -> Self {
        self.resolution = resolution;
        self
    }
}

/// Client-facing view of an item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemStatus {
    pub id: String,
    pub model: String,
    pub state: ItemState,
    pub priority: Priority,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<QueueItem> for ItemStatus {
    fn from(item: QueueItem) -> Self {
        Self {
            id: item.id,
            model: item.model,
            state: item.state,
            priority: item.priority,
            attempt: item.attempt,
            submitted_at: item.submitted_at,
            deadline: item.deadline,
            completed_at: item.completed_at,
            result: item.result,
            error: item.error,
        }
    }
}

pub struct Gateway {
    config: Config,
    store: Arc<dyn Store>,
    recorder: Arc<Recorder>,
    backend: Arc<dyn BackendHandle>,
    lifecycle: Arc<LifecycleManager>,
    auto_switch: Arc<AutoSwitcher>,
}

impl Gateway {
    pub fn new(config: Config, store: Arc<dyn Store>, backend: Arc<dyn BackendHandle>) -> Self {
        let recorder = Arc::new(Recorder::new(store.clone(), config.history.retention()));
        let lifecycle = Arc::new(LifecycleManager::new(
            &config,
            backend.clone(),
            store.clone(),
            recorder.clone(),
        ));
        let auto_switch = Arc::new(AutoSwitcher::new(
            config.auto_switch.clone(),
            lifecycle.clone(),
            store.clone(),
        ));

        Self {
            config,
            store,
            recorder,
            backend,
            lifecycle,
            auto_switch,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn auto_switcher(&self) -> &Arc<AutoSwitcher> {
        &self.auto_switch
    }

    fn queue(&self, model: &str) -> Result<Arc<ModelQueue>> {
        self.lifecycle
            .queue(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))
    }

    /// Admit a request.
    ///
    /// Usage is recorded first, for unknown models too, so demand drives
    /// auto-start and gaps stay visible. Fails fast with `QueueFull` or
    /// `ModelUnavailable`; never waits on the backend.
    pub async fn submit(&self, request: SubmitRequest) -> Result<QueueItem> {
        let known = self.lifecycle.is_known(&request.model);
        let usage = UsageRecord::new(request.model.clone(), request.client_id.clone(), known);
        if let Err(e) = self.recorder.record_usage(&usage) {
            tracing::error!(model = %request.model, "Failed to record usage: {}", e);
        }

        if !known {
            tracing::warn!(model = %request.model, client_id = %request.client_id, "Request for unknown model");
            return Err(GatewayError::UnknownModel(request.model));
        }
        let queue = self.queue(&request.model)?;

        if let Some(mode) = request.resolution.as_deref() {
            self.prepare_resolution(&queue, mode).await?;
        }

        let item = queue
            .enqueue(&request.client_id, request.payload, request.priority)
            .await?;
        Ok(item)
    }

    /// Bring the backend to the requested resolution before admission.
    ///
    /// A stopped backend just records the mode for its next start. A running
    /// one with no work is switched in the background; the submit then sees
    /// the backend unavailable. With work in flight the request is admitted on
    /// the current mode.
    async fn prepare_resolution(&self, queue: &Arc<ModelQueue>, mode: &str) -> Result<()> {
        let model = queue.model().to_string();
        let state = self.lifecycle.state(&model).await?;
        if state.resolution_mode.as_deref() == Some(mode) {
            return Ok(());
        }
        let supported = self
            .lifecycle
            .model_config(&model)
            .is_some_and(|c| c.supports_resolution(mode));
        if !supported {
            return Err(LifecycleError::UnsupportedResolution {
                model,
                mode: mode.to_string(),
            }
            .into());
        }

        match state.status {
            BackendStatus::Running | BackendStatus::Starting => {
                if queue.has_work().await {
                    tracing::debug!(model = %model, requested = %mode, "Resolution differs but work is in flight");
                    return Ok(());
                }

                let status = queue.status_receiver();
                let lifecycle = self.lifecycle.clone();
                let target = mode.to_string();
                tokio::spawn(async move {
                    if let Err(e) = lifecycle.switch_resolution(&model, &target, true).await {
                        tracing::error!(model = %model, mode = %target, "Resolution switch failed: {}", e);
                    }
                });

                if !settle_switch(status, SWITCH_SETTLE).await {
                    tracing::debug!(
                        model = %queue.model(),
                        requested = %mode,
                        settle_ms = SWITCH_SETTLE.as_millis() as u64,
                        "Resolution switch still running, admitting on the current mode"
                    );
                }
                Ok(())
            }
            _ => {
                self.lifecycle.switch_resolution(&model, mode, true).await?;
                Ok(())
            }
        }
    }

    pub fn get_status(&self, id: &str) -> Result<ItemStatus> {
        self.store
            .get_item(id)?
            .map(ItemStatus::from)
            .ok_or_else(|| GatewayError::ItemNotFound(id.to_string()))
    }

    /// Wait for an item to reach a terminal state, up to `timeout`. Returns
    /// the current status when the timeout elapses first.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<ItemStatus> {
        let current = self.get_status(id)?;
        if current.state.is_terminal() {
            return Ok(current);
        }

        if let Some(queue) = self.lifecycle.queue(&current.model) {
            if let Some(rx) = queue.subscribe(id).await {
                if let Ok(Ok(item)) = tokio::time::timeout(timeout, rx).await {
                    return Ok(item.into());
                }
            }
        }

        self.get_status(id)
    }

    pub async fn admin_start(&self, model: &str, options: StartOptions) -> Result<BackendState> {
        Ok(self.lifecycle.start(model, options).await?)
    }

    pub async fn admin_stop(&self, model: &str, graceful: bool) -> Result<BackendState> {
        Ok(self.lifecycle.stop(model, graceful).await?)
    }

    pub async fn admin_switch_resolution(
        &self,
        model: &str,
        mode: &str,
        graceful: bool,
    ) -> Result<BackendState> {
        Ok(self
            .lifecycle
            .switch_resolution(model, mode, graceful)
            .await?)
    }

    pub async fn queue_metrics(&self, model: &str) -> Result<QueueMetrics> {
        let queue = self.queue(model)?;
        Ok(QueueMetrics::snapshot(&queue).await)
    }

    pub fn crash_log(&self, limit: usize) -> Result<Vec<CrashRecord>> {
        Ok(self.recorder.list_crashes(limit)?)
    }

    /// Crash records with `from <= timestamp < to`, most recent first.
    pub fn crash_log_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CrashRecord>> {
        if from > to {
            return Err(GatewayError::InvalidRequest(format!(
                "crash window starts after it ends ({} > {})",
                from, to
            )));
        }
        let mut records = self.recorder.list_crashes_between(from, to)?;
        records.truncate(limit);
        Ok(records)
    }

    pub fn usage_gaps(&self, limit: usize) -> Result<Vec<UsageRecord>> {
        Ok(self.recorder.usage_gaps(limit)?)
    }

    pub async fn backend_states(&self) -> Vec<BackendState> {
        self.lifecycle.states().await
    }

    pub fn auto_switch_status(&self) -> Result<AutoSwitchStatus> {
        Ok(self.auto_switch.status(Utc::now())?)
    }

    /// Rebuild state after a restart: restore backend snapshots, re-admit
    /// active items, then start backends that were up before.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let to_start = self.lifecycle.restore().await?;
        let report = recover_items(
            self.store.as_ref(),
            &self.recorder,
            &self.lifecycle.queues(),
            Utc::now(),
        )
        .await?;

        let starts = to_start.iter().map(|model| async move {
            tracing::info!(model = %model, "Restarting backend that was up before restart");
            if let Err(e) = self.lifecycle.start(model, StartOptions::default()).await {
                tracing::error!(model = %model, "Failed to restart backend: {}", e);
            }
        });
        join_all(starts).await;

        Ok(report)
    }

    /// Spawn every background loop. The handles are returned so the caller
    /// can abort them on shutdown.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for queue in self.lifecycle.queues().into_values() {
            let dispatcher = Dispatcher::new(
                queue,
                self.backend.clone(),
                self.config.queue.retry_backoff(),
            );
            handles.push(tokio::spawn(async move { dispatcher.run().await }));
        }

        let gateway = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.config.queue.sweep_interval());
            loop {
                interval.tick().await;
                gateway.sweep_timeouts().await;
            }
        }));

        let lifecycle = self.lifecycle.clone();
        let health_interval = self.config.lifecycle.health_interval();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(health_interval);
            loop {
                interval.tick().await;
                lifecycle.probe_all().await;
            }
        }));

        handles.push(tokio::spawn(self.auto_switch.clone().run()));

        let recorder = self.recorder.clone();
        let prune_interval = self.config.history.prune_interval();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(prune_interval);
            loop {
                interval.tick().await;
                if let Err(e) = recorder.prune(Utc::now()) {
                    tracing::error!("History prune failed: {}", e);
                }
            }
        }));

        tracing::info!(tasks = handles.len(), "Background tasks started");
        handles
    }

    /// Run one deadline sweep over every queue.
    pub async fn sweep_timeouts(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;
        for queue in self.lifecycle.queues().into_values() {
            match queue.sweep_timeouts(now).await {
                Ok(n) => expired += n,
                Err(e) => {
                    tracing::error!(model = %queue.model(), "Timeout sweep failed: {}", e);
                }
            }
        }
        expired
    }

    /// Stop every running backend gracefully.
    pub async fn shutdown(&self) {
        tracing::info!("Stopping backends");
        self.lifecycle.stop_all(true).await;
    }
}
