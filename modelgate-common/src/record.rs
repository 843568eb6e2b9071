//! Durable history records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One submission, appended whether or not the model is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub model: String,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    /// False when no backend is registered under `model`.
    pub known_model: bool,
}

impl UsageRecord {
    pub fn new(model: String, client_id: String, known_model: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model,
            client_id,
            timestamp: Utc::now(),
            known_model,
        }
    }
}

/// Classification of a failure-class event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient backend errors outlasted the retry budget.
    RetriesExhausted,
    /// Backend rejected the payload.
    FatalBackend,
    /// Item deadline elapsed.
    Timeout,
    /// Stored item referenced a model this gateway does not serve.
    RecoveryInconsistency,
    /// Requeue found no waiting capacity.
    RequeueRejected,
    /// Health probes failed past the threshold, or the process exited.
    BackendCrash,
    StartFailed,
    StopFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::FatalBackend => "fatal_backend",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RecoveryInconsistency => "recovery_inconsistency",
            ErrorKind::RequeueRejected => "requeue_rejected",
            ErrorKind::BackendCrash => "backend_crash",
            ErrorKind::StartFailed => "start_failed",
            ErrorKind::StopFailed => "stop_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retries_exhausted" => Ok(ErrorKind::RetriesExhausted),
            "fatal_backend" => Ok(ErrorKind::FatalBackend),
            "timeout" => Ok(ErrorKind::Timeout),
            "recovery_inconsistency" => Ok(ErrorKind::RecoveryInconsistency),
            "requeue_rejected" => Ok(ErrorKind::RequeueRejected),
            "backend_crash" => Ok(ErrorKind::BackendCrash),
            "start_failed" => Ok(ErrorKind::StartFailed),
            "stop_failed" => Ok(ErrorKind::StopFailed),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// Append-only failure log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub error_kind: ErrorKind,
    pub detail: String,
    /// Attempt count of the item at the time of failure, if item-related.
    #[serde(default)]
    pub attempt: Option<u32>,
}

impl CrashRecord {
    pub fn new(model: &str, error_kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            model: model.to_string(),
            request_id: None,
            error_kind,
            detail: detail.into(),
            attempt: None,
        }
    }

    pub fn for_item(
        model: &str,
        request_id: &str,
        attempt: u32,
        error_kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            attempt: Some(attempt),
            ..Self::new(model, error_kind, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_round_trips_through_str() {
        for kind in [
            ErrorKind::RetriesExhausted,
            ErrorKind::FatalBackend,
            ErrorKind::Timeout,
            ErrorKind::RecoveryInconsistency,
            ErrorKind::RequeueRejected,
            ErrorKind::BackendCrash,
            ErrorKind::StartFailed,
            ErrorKind::StopFailed,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_crash_record_for_item() {
        let record = CrashRecord::for_item("ocr", "req-1", 4, ErrorKind::RetriesExhausted, "boom");
        assert_eq!(record.request_id.as_deref(), Some("req-1"));
        assert_eq!(record.attempt, Some(4));
        assert_eq!(record.model, "ocr");
    }
}
