//! Backend lifecycle state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::IllegalTransition;

/// Process status of one model's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    HealthOk,
    Stop,
    Drained,
    /// Probe failure threshold reached, process exit, or failed launch.
    Crash,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Stopped => "stopped",
            BackendStatus::Starting => "starting",
            BackendStatus::Running => "running",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Crashed => "crashed",
        }
    }

    /// Dispatch is permitted only in this state.
    pub fn accepts_work(self) -> bool {
        self == BackendStatus::Running
    }

    /// Exhaustive transition table.
    ///
    /// `CRASHED` is reachable from every state and can only be left by `Start`.
    pub fn transition(self, event: LifecycleEvent) -> Result<BackendStatus, IllegalTransition> {
        use BackendStatus::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Stopped | Crashed, Start) => Starting,
            (Starting, HealthOk) => Running,
            (Starting | Running, Stop) => Stopping,
            (Stopping, Drained) => Stopped,
            (_, Crash) => Crashed,
            (from, event) => {
                return Err(IllegalTransition {
                    from: from.as_str().to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(BackendStatus::Stopped),
            "starting" => Ok(BackendStatus::Starting),
            "running" => Ok(BackendStatus::Running),
            "stopping" => Ok(BackendStatus::Stopping),
            "crashed" => Ok(BackendStatus::Crashed),
            other => Err(format!("unknown backend status: {}", other)),
        }
    }
}

/// Point-in-time view of one backend, owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub model: String,
    pub status: BackendStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Backend-specific variant tag (e.g. OCR resolution).
    #[serde(default)]
    pub resolution_mode: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BackendState {
    pub fn stopped(model: String, resolution_mode: Option<String>) -> Self {
        Self {
            model,
            status: BackendStatus::Stopped,
            started_at: None,
            last_health_check: None,
            resolution_mode,
            updated_at: Utc::now(),
        }
    }

    /// Seconds since the backend reached `RUNNING`, zero otherwise.
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        match (self.status, self.started_at) {
            (BackendStatus::Running, Some(started)) => (now - started).num_seconds().max(0),
            _ => 0,
        }
    }
}
