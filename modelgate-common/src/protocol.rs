//! Wire types shared by the gateway and the HTTP backends it fronts.
//!
//! A backend exposes two endpoints:
//! - `GET <health_path>` answering 200 with [`HealthResponse`] when ready
//! - `POST <completion_path>` taking the opaque payload as its JSON body
//!
//! Failures come back as non-2xx with an [`ErrorBody`]. The gateway decides
//! whether to retry from the status code alone.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Active variant tag, for backends that have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthResponse {
    pub fn ok(resolution: Option<String>) -> Self {
        Self {
            status: "ok".to_string(),
            resolution,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
