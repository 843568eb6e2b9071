//! Queue item types.
//!
//! A [`QueueItem`] is one unit of admitted-or-pending work. Its id is generated
//! at submission and stays stable across retries and gateway restarts.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::IllegalTransition;

/// Request priority. Affects queue order only, never preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Position in drain order (0 is drained first).
    pub fn rank(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority: {0}")]
pub struct ParsePriorityError(pub String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ParsePriorityError(other.to_string())),
        }
    }
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting in the secondary tier.
    Pending,
    /// Holding a primary slot, in flight at a backend.
    Processing,
    Succeeded,
    Failed,
    TimedOut,
}

/// Events that move an item between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    /// Acquire a primary slot.
    Admit,
    Succeed,
    Fail,
    /// Give the slot back and wait again (retry or recovery).
    Requeue,
    Expire,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Processing => "processing",
            ItemState::Succeeded => "succeeded",
            ItemState::Failed => "failed",
            ItemState::TimedOut => "timed_out",
        }
    }

    /// The only way an item changes state.
    pub fn transition(self, event: ItemEvent) -> Result<ItemState, IllegalTransition> {
        use ItemEvent::*;
        use ItemState::*;

        let next = match (self, event) {
            (Pending, Admit) => Processing,
            (Processing, Succeed) => Succeeded,
            (Pending | Processing, Fail) => Failed,
            (Processing, Requeue) => Pending,
            (Pending | Processing, Expire) => TimedOut,
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

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemState::Pending),
            "processing" => Ok(ItemState::Processing),
            "succeeded" => Ok(ItemState::Succeeded),
            "failed" => Ok(ItemState::Failed),
            "timed_out" => Ok(ItemState::TimedOut),
            other => Err(format!("unknown item state: {}", other)),
        }
    }
}

/// One unit of work owned by a model's admission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub model: String,
    pub client_id: String,
    /// Opaque request body, forwarded to the backend untouched.
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub state: ItemState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(
        model: String,
        client_id: String,
        payload: serde_json::Value,
        priority: Priority,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model,
            client_id,
            payload,
            priority,
            submitted_at: now,
            attempt: 0,
            deadline: now + timeout,
            state: ItemState::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Apply a state event, stamping timestamps that go with it.
    pub fn apply(&mut self, event: ItemEvent, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        let next = self.state.transition(event)?;
        match next {
            ItemState::Processing => self.started_at = Some(now),
            ItemState::Pending => self.started_at = None,
            _ => self.completed_at = Some(now),
        }
        self.state = next;
        Ok(())
    }
}
