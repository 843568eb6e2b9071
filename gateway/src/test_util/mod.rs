//! Helpers shared by unit and integration tests.

pub mod mock_backend;

pub use mock_backend::{CallOutcome, MockBackend};

use std::sync::Arc;

use crate::config::{Config, LifecycleConfig, ModelConfig};
use crate::store::{SqliteStore, Store};

/// Configuration with fast lifecycle timings and the given models, all
/// externally managed.
pub fn test_config(models: &[&str]) -> Config {
    let mut config = Config::default();
    config.database.url = ":memory:".to_string();
    config.logging.level = "debug".to_string();
    config.lifecycle = LifecycleConfig {
        health_interval_secs: 1,
        failure_threshold: 2,
        startup_timeout_secs: 1,
        startup_poll_ms: 10,
        shutdown_timeout_secs: 1,
        stop_grace_secs: 5,
        restore_running: true,
    };
    config.auto_switch.cooldown_secs = 0;

    for (i, name) in models.iter().enumerate() {
        config.models.insert(
            name.to_string(),
            ModelConfig::new(format!("http://127.0.0.1:{}", 18000 + i)),
        );
    }
    config
}

pub fn memory_store() -> Arc<dyn Store> {
    // An in-memory SQLite store cannot fail to open.
    Arc::new(SqliteStore::new(":memory:").expect("in-memory store"))
}
