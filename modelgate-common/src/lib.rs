//! modelgate Common Types
//!
//! Shared types used by the gateway core and the backends it supervises.

pub mod backend;
pub mod item;
pub mod protocol;
pub mod record;

pub use backend::{BackendState, BackendStatus, LifecycleEvent};
pub use item::{ItemEvent, ItemState, ParsePriorityError, Priority, QueueItem};
pub use protocol::{ErrorBody, HealthResponse};
pub use record::{CrashRecord, ErrorKind, UsageRecord};

/// A state machine was asked to take an edge it does not have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from {from} on {event}")]
pub struct IllegalTransition {
    pub from: String,
    pub event: String,
}
