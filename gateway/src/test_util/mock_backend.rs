//! Scripted in-process backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::backend::{BackendHandle, StartOptions};
use crate::error::BackendError;

/// Programmed result of one `call`.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Succeed(serde_json::Value),
    Fail(BackendError),
    /// Never returns.
    Hang,
    /// Succeeds once [`MockBackend::release`] hands out a permit.
    Gated,
}

/// Backend whose health, launches and call outcomes are set by the test.
///
/// Scripted outcomes are consumed in order; once exhausted every call gets the
/// default outcome.
pub struct MockBackend {
    healthy: AtomicBool,
    start_error: Mutex<Option<BackendError>>,
    script: Mutex<VecDeque<CallOutcome>>,
    default_outcome: Mutex<CallOutcome>,
    gate: Semaphore,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    starts: Mutex<Vec<(String, StartOptions)>>,
    stops: Mutex<Vec<(String, bool)>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            start_error: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(CallOutcome::Succeed(json!({"ok": true}))),
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the next launches fail with `error`.
    pub fn fail_start(&self, error: Option<BackendError>) {
        *self.start_error.lock().unwrap() = error;
    }

    pub fn push_outcome(&self, outcome: CallOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn set_default_outcome(&self, outcome: CallOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// Let `n` gated calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls started and not yet returned.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<(String, StartOptions)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<(String, bool)> {
        self.stops.lock().unwrap().clone()
    }

    fn next_outcome(&self) -> CallOutcome {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_outcome.lock().unwrap().clone())
    }
}

#[async_trait]
impl BackendHandle for MockBackend {
    async fn health_check(&self, _model: &str) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn start(&self, model: &str, options: &StartOptions) -> Result<(), BackendError> {
        self.starts
            .lock()
            .unwrap()
            .push((model.to_string(), options.clone()));
        match self.start_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&self, model: &str, forced: bool) -> Result<(), BackendError> {
        self.stops.lock().unwrap().push((model.to_string(), forced));
        Ok(())
    }

    async fn call(
        &self,
        _model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = match outcome {
            CallOutcome::Succeed(value) => Ok(value),
            CallOutcome::Fail(e) => Err(e),
            CallOutcome::Hang => std::future::pending().await,
            CallOutcome::Gated => match self.gate.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(json!({"echo": payload}))
                }
                Err(e) => Err(BackendError::Transient(e.to_string())),
            },
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
