pub mod auto_switch;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod recorder;
pub mod routes;
pub mod store;
pub mod test_util;

pub use auto_switch::{AutoSwitchStatus, AutoSwitcher, SwitchAction, SwitchDecision};
pub use backend::{BackendHandle, HttpBackend, StartOptions};
pub use config::Config;
pub use error::{BackendError, GatewayError, LifecycleError, QueueError, StoreError};
pub use gateway::{Gateway, ItemStatus, SubmitRequest};
pub use lifecycle::LifecycleManager;
pub use metrics::QueueMetrics;
pub use queue::{Dispatcher, ModelQueue, QueueLimits, RecoveryReport};
pub use recorder::Recorder;
pub use store::{SqliteStore, Store};
