//! Backend lifecycle manager.
//!
//! Drives each model's backend through
//! `STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED`, with `CRASHED`
//! reachable from anywhere and left only by `start`. The manager is the sole
//! owner of [`BackendState`]; queues observe the status through a watch
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};

use modelgate_common::{BackendState, BackendStatus, CrashRecord, ErrorKind, LifecycleEvent};

use crate::backend::{BackendHandle, StartOptions};
use crate::config::{Config, LifecycleConfig, ModelConfig};
use crate::error::LifecycleError;
use crate::queue::{ModelQueue, QueueLimits};
use crate::recorder::Recorder;
use crate::store::Store;

/// Per-model lifecycle state.
struct ModelEntry {
    model: String,
    config: ModelConfig,
    state: RwLock<BackendState>,
    status_tx: watch::Sender<BackendStatus>,
    queue: Arc<ModelQueue>,
    probe_failures: AtomicU32,
    /// Serializes start and stop.
    op_lock: Mutex<()>,
    /// Serializes resolution switches (each one a stop plus a start).
    switch_lock: Mutex<()>,
}

pub struct LifecycleManager {
    entries: HashMap<String, Arc<ModelEntry>>,
    backend: Arc<dyn BackendHandle>,
    store: Arc<dyn Store>,
    recorder: Arc<Recorder>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    /// Register every enabled model, each with its own queue, in `STOPPED`.
    pub fn new(
        config: &Config,
        backend: Arc<dyn BackendHandle>,
        store: Arc<dyn Store>,
        recorder: Arc<Recorder>,
    ) -> Self {
        let mut entries = HashMap::new();
        for (name, model) in config.enabled_models() {
            let (status_tx, status_rx) = watch::channel(BackendStatus::Stopped);
            let queue = Arc::new(ModelQueue::new(
                name.clone(),
                QueueLimits::from_config(&config.queue, model),
                store.clone(),
                recorder.clone(),
                status_rx,
            ));
            let entry = ModelEntry {
                model: name.clone(),
                config: model.clone(),
                state: RwLock::new(BackendState::stopped(
                    name.clone(),
                    model.default_resolution.clone(),
                )),
                status_tx,
                queue,
                probe_failures: AtomicU32::new(0),
                op_lock: Mutex::new(()),
                switch_lock: Mutex::new(()),
            };
            entries.insert(name.clone(), Arc::new(entry));
        }

        Self {
            entries,
            backend,
            store,
            recorder,
            config: config.lifecycle.clone(),
        }
    }

    /// Registered model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.entries.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn is_known(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }

    pub fn queue(&self, model: &str) -> Option<Arc<ModelQueue>> {
        self.entries.get(model).map(|e| e.queue.clone())
    }

    pub fn queues(&self) -> HashMap<String, Arc<ModelQueue>> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.queue.clone()))
            .collect()
    }

    pub fn model_config(&self, model: &str) -> Option<&ModelConfig> {
        self.entries.get(model).map(|e| &e.config)
    }

    pub fn status(&self, model: &str) -> Option<BackendStatus> {
        self.entries.get(model).map(|e| *e.status_tx.borrow())
    }

    pub async fn state(&self, model: &str) -> Result<BackendState, LifecycleError> {
        Ok(self.entry(model)?.state.read().await.clone())
    }

    /// Every model's state, sorted by model name.
    pub async fn states(&self) -> Vec<BackendState> {
        let mut states = Vec::with_capacity(self.entries.len());
        for model in self.models() {
            if let Some(entry) = self.entries.get(&model) {
                states.push(entry.state.read().await.clone());
            }
        }
        states
    }

    fn entry(&self, model: &str) -> Result<Arc<ModelEntry>, LifecycleError> {
        self.entries
            .get(model)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownModel(model.to_string()))
    }

    fn validate_resolution(&self, entry: &ModelEntry, mode: Option<&str>) -> Result<(), LifecycleError> {
        match mode {
            Some(mode) if !entry.config.supports_resolution(mode) => {
                Err(LifecycleError::UnsupportedResolution {
                    model: entry.model.clone(),
                    mode: mode.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Apply one state machine event and persist the resulting snapshot.
    async fn transition(
        &self,
        entry: &ModelEntry,
        event: LifecycleEvent,
    ) -> Result<BackendState, LifecycleError> {
        let now = Utc::now();
        let snapshot = {
            let mut state = entry.state.write().await;
            let from = state.status;
            let next = from.transition(event)?;

            state.status = next;
            state.updated_at = now;
            match next {
                BackendStatus::Running => {
                    state.started_at = Some(now);
                    state.last_health_check = Some(now);
                }
                BackendStatus::Stopped | BackendStatus::Crashed => state.started_at = None,
                BackendStatus::Starting | BackendStatus::Stopping => {}
            }
            entry.status_tx.send_replace(next);

            tracing::info!(model = %entry.model, from = %from, to = %next, "Backend state transition");
            state.clone()
        };

        if let Err(e) = self.store.save_backend_state(&snapshot) {
            tracing::error!(model = %entry.model, "Failed to persist backend state: {}", e);
        }
        Ok(snapshot)
    }

    /// Start a backend and wait until it is healthy.
    ///
    /// Idempotent while `RUNNING` or `STARTING`. A launch that fails or never
    /// becomes healthy leaves the backend `CRASHED` with a crash record; that
    /// state is returned rather than an error.
    pub async fn start(
        &self,
        model: &str,
        options: StartOptions,
    ) -> Result<BackendState, LifecycleError> {
        let entry = self.entry(model)?;
        self.validate_resolution(&entry, options.resolution.as_deref())?;

        {
            let state = entry.state.read().await;
            if matches!(state.status, BackendStatus::Running | BackendStatus::Starting) {
                return Ok(state.clone());
            }
        }

        let _op = entry.op_lock.lock().await;

        let launch = {
            let mut state = entry.state.write().await;
            if matches!(state.status, BackendStatus::Running | BackendStatus::Starting) {
                return Ok(state.clone());
            }
            if options.resolution.is_some() {
                state.resolution_mode = options.resolution.clone();
            }
            StartOptions::with_resolution(state.resolution_mode.clone())
        };

        self.transition(&entry, LifecycleEvent::Start).await?;
        entry.probe_failures.store(0, Ordering::SeqCst);

        if let Err(e) = self.backend.start(model, &launch).await {
            return self.fail_start(&entry, format!("launch failed: {}", e)).await;
        }

        if !self.wait_for_ready(model).await {
            if let Err(e) = self.backend.stop(model, true).await {
                tracing::warn!(model = %model, "Failed to stop unready backend: {}", e);
            }
            let detail = format!(
                "backend not healthy within {}s",
                self.config.startup_timeout_secs
            );
            return self.fail_start(&entry, detail).await;
        }

        let state = self.transition(&entry, LifecycleEvent::HealthOk).await?;
        tracing::info!(model = %model, resolution = ?state.resolution_mode, "Backend is ready");
        Ok(state)
    }

    async fn fail_start(
        &self,
        entry: &ModelEntry,
        detail: String,
    ) -> Result<BackendState, LifecycleError> {
        self.recorder
            .record_crash_logged(CrashRecord::new(&entry.model, ErrorKind::StartFailed, detail));
        self.transition(entry, LifecycleEvent::Crash).await
    }

    async fn wait_for_ready(&self, model: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout();
        loop {
            if self.backend.health_check(model).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.startup_poll()).await;
        }
    }

    /// Stop a backend.
    ///
    /// Graceful: new admissions are refused at once, in-flight work gets up to
    /// the stop grace period to finish. Forced: in-flight items are aborted
    /// through the retry policy and the process is killed. Returns the current
    /// state when already `STOPPED`.
    pub async fn stop(&self, model: &str, graceful: bool) -> Result<BackendState, LifecycleError> {
        let entry = self.entry(model)?;
        let _op = entry.op_lock.lock().await;

        {
            let state = entry.state.read().await;
            if state.status == BackendStatus::Stopped {
                return Ok(state.clone());
            }
        }

        self.transition(&entry, LifecycleEvent::Stop).await?;

        if graceful {
            if !entry.queue.wait_idle(self.config.stop_grace()).await {
                tracing::warn!(
                    model = %model,
                    grace_secs = self.config.stop_grace_secs,
                    "Stop grace period elapsed with work in flight"
                );
                self.abort_in_flight(&entry, "graceful stop grace period elapsed").await;
            }
        } else {
            self.abort_in_flight(&entry, "forced stop").await;
        }

        if let Err(e) = self.backend.stop(model, !graceful).await {
            self.recorder.record_crash_logged(CrashRecord::new(
                model,
                ErrorKind::StopFailed,
                e.to_string(),
            ));
        }

        self.transition(&entry, LifecycleEvent::Drained).await
    }

    async fn abort_in_flight(&self, entry: &ModelEntry, reason: &str) {
        if let Err(e) = entry.queue.abort_in_flight(reason).await {
            tracing::error!(model = %entry.model, "Failed to abort in-flight items: {}", e);
        }
    }

    /// Change a backend's resolution variant.
    ///
    /// A running (or starting) backend is stopped and started again with the
    /// new mode. Otherwise only the stored mode changes and the next start
    /// uses it. No-op when the mode is already active.
    pub async fn switch_resolution(
        &self,
        model: &str,
        mode: &str,
        graceful: bool,
    ) -> Result<BackendState, LifecycleError> {
        let entry = self.entry(model)?;
        self.validate_resolution(&entry, Some(mode))?;

        let _switch = entry.switch_lock.lock().await;

        let current = entry.state.read().await.clone();
        if current.resolution_mode.as_deref() == Some(mode) {
            return Ok(current);
        }

        tracing::info!(
            model = %model,
            from = ?current.resolution_mode,
            to = %mode,
            graceful,
            "Switching resolution"
        );

        if matches!(current.status, BackendStatus::Running | BackendStatus::Starting) {
            self.stop(model, graceful).await?;
            return self
                .start(model, StartOptions::with_resolution(Some(mode.to_string())))
                .await;
        }

        let _op = entry.op_lock.lock().await;
        let snapshot = {
            let mut state = entry.state.write().await;
            state.resolution_mode = Some(mode.to_string());
            state.updated_at = Utc::now();
            state.clone()
        };
        self.store.save_backend_state(&snapshot)?;
        Ok(snapshot)
    }

    /// Probe every running backend once.
    pub async fn probe_all(&self) {
        for model in self.models() {
            if let Err(e) = self.probe(&model).await {
                tracing::warn!(model = %model, "Health probe error: {}", e);
            }
        }
    }

    /// Probe one backend if it is running. Consecutive failures reaching the
    /// threshold mark it `CRASHED`.
    pub async fn probe(&self, model: &str) -> Result<BackendStatus, LifecycleError> {
        let entry = self.entry(model)?;
        if *entry.status_tx.borrow() != BackendStatus::Running {
            return Ok(*entry.status_tx.borrow());
        }

        // A start or stop in progress owns the backend.
        let Ok(_op) = entry.op_lock.try_lock() else {
            return Ok(*entry.status_tx.borrow());
        };

        if self.backend.health_check(model).await {
            entry.probe_failures.store(0, Ordering::SeqCst);
            entry.state.write().await.last_health_check = Some(Utc::now());
            return Ok(BackendStatus::Running);
        }

        let failures = entry.probe_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            model = %model,
            failures,
            threshold = self.config.failure_threshold,
            "Health probe failed"
        );

        if failures < self.config.failure_threshold {
            return Ok(BackendStatus::Running);
        }

        let state = self.transition(&entry, LifecycleEvent::Crash).await?;
        self.recorder.record_crash_logged(CrashRecord::new(
            model,
            ErrorKind::BackendCrash,
            format!("{} consecutive health probe failures", failures),
        ));
        self.abort_in_flight(&entry, "backend crashed").await;
        if let Err(e) = self.backend.stop(model, true).await {
            tracing::warn!(model = %model, "Failed to stop crashed backend: {}", e);
        }
        Ok(state.status)
    }

    /// Reload persisted snapshots: restore each model's resolution mode and
    /// return the models that were up before the restart.
    pub async fn restore(&self) -> Result<Vec<String>, LifecycleError> {
        let snapshots = self.store.load_backend_states()?;
        let mut to_start = Vec::new();

        for snapshot in snapshots {
            let Some(entry) = self.entries.get(&snapshot.model) else {
                tracing::debug!(model = %snapshot.model, "Ignoring snapshot for unregistered model");
                continue;
            };

            if let Some(mode) = snapshot.resolution_mode {
                if entry.config.supports_resolution(&mode) {
                    entry.state.write().await.resolution_mode = Some(mode);
                }
            }

            if self.config.restore_running
                && matches!(snapshot.status, BackendStatus::Running | BackendStatus::Starting)
            {
                to_start.push(snapshot.model.clone());
            }
        }

        for model in self.models() {
            if let Some(entry) = self.entries.get(&model) {
                let state = entry.state.read().await.clone();
                self.store.save_backend_state(&state)?;
            }
        }

        to_start.sort();
        Ok(to_start)
    }

    /// Stop every backend that is up. Used on shutdown.
    pub async fn stop_all(&self, graceful: bool) {
        for model in self.models() {
            if matches!(
                self.status(&model),
                Some(BackendStatus::Running | BackendStatus::Starting)
            ) {
                if let Err(e) = self.stop(&model, graceful).await {
                    tracing::warn!(model = %model, "Failed to stop backend: {}", e);
                }
            }
        }
    }
}
