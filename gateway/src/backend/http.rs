use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{BackendHandle, StartOptions};
use crate::config::ModelConfig;
use crate::error::BackendError;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend handle for HTTP inference services.
///
/// Models with a `command` are spawned and supervised as child processes;
/// models without one are managed externally and only probed and called.
pub struct HttpBackend {
    client: Client,
    models: HashMap<String, ModelConfig>,
    shutdown_timeout: Duration,
    /// model -> running child process
    processes: Mutex<HashMap<String, Child>>,
}

impl HttpBackend {
    pub fn new(models: HashMap<String, ModelConfig>, shutdown_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            models,
            shutdown_timeout,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn model(&self, model: &str) -> Result<&ModelConfig, BackendError> {
        self.models
            .get(model)
            .ok_or_else(|| BackendError::Fatal(format!("no backend configured for {}", model)))
    }

    fn url(config: &ModelConfig, path: &str) -> String {
        format!("{}{}", config.base_url.trim_end_matches('/'), path)
    }

    /// Check the supervised process, if any. Reaps it when it has exited.
    async fn is_process_alive(&self, model: &str) -> Option<bool> {
        let mut processes = self.processes.lock().await;
        let child = processes.get_mut(model)?;
        let alive = match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(model = %model, "Backend process exited with {}", status);
                false
            }
            Err(_) => false,
        };
        if !alive {
            processes.remove(model);
        }
        Some(alive)
    }
}

/// Substitute `{port}` and `{resolution}` in launch arguments.
pub(crate) fn render_args(config: &ModelConfig, options: &StartOptions) -> Vec<String> {
    let port = reqwest::Url::parse(&config.base_url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .map(|p| p.to_string())
        .unwrap_or_default();
    let resolution = options
        .resolution
        .clone()
        .or_else(|| config.default_resolution.clone())
        .unwrap_or_default();

    config
        .args
        .iter()
        .map(|arg| {
            arg.replace("{port}", &port)
                .replace("{resolution}", &resolution)
        })
        .collect()
}

/// Map a non-success status to a retry class.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = format!("{}: {}", status, body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        BackendError::Transient(message)
    } else {
        BackendError::Fatal(message)
    }
}

fn classify_request_error(e: reqwest::Error) -> BackendError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        BackendError::Transient(e.to_string())
    } else if e.is_decode() {
        BackendError::Fatal(e.to_string())
    } else {
        BackendError::Transient(e.to_string())
    }
}

async fn terminate(model: &str, mut child: Child, timeout: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(model = %model, "Backend process exited with {}", status);
        }
        Ok(Err(e)) => {
            tracing::warn!(model = %model, "Error waiting for backend process: {}", e);
        }
        Err(_timeout) => {
            tracing::warn!(model = %model, "Backend process didn't stop gracefully, killing");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl BackendHandle for HttpBackend {
    async fn health_check(&self, model: &str) -> bool {
        let Ok(config) = self.model(model) else {
            return false;
        };

        // Supervised backends are down once their process is gone.
        if config.command.is_some() && self.is_process_alive(model).await != Some(true) {
            return false;
        }

        let url = Self::url(config, &config.health_path);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(model = %model, "Health probe failed: {}", e);
                false
            }
        }
    }

    async fn start(&self, model: &str, options: &StartOptions) -> Result<(), BackendError> {
        let config = self.model(model)?;
        let Some(ref program) = config.command else {
            tracing::debug!(model = %model, "Backend is externally managed, nothing to launch");
            return Ok(());
        };

        let mut processes = self.processes.lock().await;
        if let Some(child) = processes.get_mut(model) {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
            processes.remove(model);
        }

        let args = render_args(config, options);
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            BackendError::Launch(format!("failed to spawn {} for {}: {}", program, model, e))
        })?;

        tracing::info!(
            model = %model,
            pid = ?child.id(),
            resolution = ?options.resolution,
            "Spawned backend process"
        );
        processes.insert(model.to_string(), child);
        Ok(())
    }

    async fn stop(&self, model: &str, forced: bool) -> Result<(), BackendError> {
        self.model(model)?;
        let child = self.processes.lock().await.remove(model);
        let Some(mut child) = child else {
            return Ok(());
        };

        if forced {
            tracing::info!(model = %model, "Killing backend process");
            child
                .kill()
                .await
                .map_err(|e| BackendError::Launch(format!("failed to kill {}: {}", model, e)))?;
        } else {
            tracing::info!(model = %model, "Terminating backend process");
            terminate(model, child, self.shutdown_timeout).await;
        }
        Ok(())
    }

    async fn call(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let config = self.model(model)?;
        let url = Self::url(config, &config.completion_path);

        tracing::debug!(model = %model, "Sending request to backend: {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(config.request_timeout())
            .json(payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| BackendError::Fatal(format!("undecodable response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let mut config = ModelConfig::new("http://127.0.0.1:8011");
        config.args = vec![
            "--port".to_string(),
            "{port}".to_string(),
            "--resolution={resolution}".to_string(),
        ];
        config.default_resolution = Some("base".to_string());

        let args = render_args(&config, &StartOptions::default());
        assert_eq!(args, vec!["--port", "8011", "--resolution=base"]);

        let args = render_args(&config, &StartOptions::with_resolution(Some("gundam".to_string())));
        assert_eq!(args[2], "--resolution=gundam");
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad image"),
            BackendError::Fatal("422 Unprocessable Entity: bad image".to_string())
        );
    }

    #[tokio::test]
    async fn test_externally_managed_start_stop_are_noops() {
        let mut models = HashMap::new();
        models.insert("chat".to_string(), ModelConfig::new("http://127.0.0.1:1"));
        let backend = HttpBackend::new(models, Duration::from_secs(1));

        backend.start("chat", &StartOptions::default()).await.unwrap();
        backend.stop("chat", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_model_is_fatal() {
        let backend = HttpBackend::new(HashMap::new(), Duration::from_secs(1));
        let err = backend.call("nope", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
        assert!(!backend.health_check("nope").await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let mut models = HashMap::new();
        models.insert("chat".to_string(), ModelConfig::new("http://127.0.0.1:1"));
        let backend = HttpBackend::new(models, Duration::from_secs(1));

        let err = backend.call("chat", &serde_json::json!({})).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let mut config = ModelConfig::new("http://127.0.0.1:1");
        config.command = Some("/nonexistent/modelgate-backend".to_string());
        let mut models = HashMap::new();
        models.insert("ocr".to_string(), config);
        let backend = HttpBackend::new(models, Duration::from_secs(1));

        let err = backend.start("ocr", &StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Launch(_)));
    }
}
