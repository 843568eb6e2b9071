//! Backend handle: supervision of and calls into one inference backend.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Options for launching a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Variant tag passed to the backend, for models that support one.
    #[serde(default)]
    pub resolution: Option<String>,
}

impl StartOptions {
    pub fn with_resolution(resolution: Option<String>) -> Self {
        Self { resolution }
    }
}

/// Contract the lifecycle manager and dispatcher depend on.
///
/// Implementations must be cheap to share (`Arc<dyn BackendHandle>`) and must
/// not hold internal locks across `call`.
#[async_trait]
pub trait BackendHandle: Send + Sync {
    /// True when the backend is up and answering.
    async fn health_check(&self, model: &str) -> bool;

    /// Launch the backend. Returns once the launch was issued, readiness is
    /// decided by polling `health_check`.
    async fn start(&self, model: &str, options: &StartOptions) -> Result<(), BackendError>;

    async fn stop(&self, model: &str, forced: bool) -> Result<(), BackendError>;

    /// Submit a payload and await its result.
    async fn call(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, BackendError>;
}
