//! Mock backend - a stand-in inference service for local runs of modelgate.
//!
//! Echoes every completion payload back with the active resolution. Failures
//! and latency can be injected through the environment:
//! - `MOCK_BACKEND_FAIL_EVERY=N` answers every Nth completion with a 503
//! - `MOCK_BACKEND_LATENCY_MS=N` delays every completion by N milliseconds

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modelgate_common::{ErrorBody, HealthResponse};

#[derive(Debug, thiserror::Error)]
enum ArgsError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown argument: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Options {
    port: u16,
    resolution: Option<String>,
    fail_every: u64,
    latency: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: 9000,
            resolution: None,
            fail_every: 0,
            latency: Duration::ZERO,
        }
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ArgsError> {
    value.parse().map_err(|_| ArgsError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

impl Options {
    /// `--port N`, `--resolution MODE`, plus the injection variables.
    fn parse<I>(args: I, env: impl Fn(&str) -> Option<String>) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Options::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
                None => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| ArgsError::MissingValue(flag.clone()))
            };
            match flag.as_str() {
                "--port" => options.port = parse_number(&flag, &value()?)?,
                "--resolution" => options.resolution = Some(value()?),
                _ => return Err(ArgsError::Unknown(arg)),
            }
        }

        if let Some(v) = env("MOCK_BACKEND_FAIL_EVERY") {
            options.fail_every = parse_number("MOCK_BACKEND_FAIL_EVERY", &v)?;
        }
        if let Some(v) = env("MOCK_BACKEND_LATENCY_MS") {
            options.latency = Duration::from_millis(parse_number("MOCK_BACKEND_LATENCY_MS", &v)?);
        }
        Ok(options)
    }
}

struct MockState {
    options: Options,
    completions: AtomicU64,
}

async fn health(State(state): State<Arc<MockState>>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.options.resolution.clone()))
}

async fn completions(
    State(state): State<Arc<MockState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorBody>)> {
    let n = state.completions.fetch_add(1, Ordering::SeqCst) + 1;

    if !state.options.latency.is_zero() {
        tokio::time::sleep(state.options.latency).await;
    }

    if state.options.fail_every > 0 && n % state.options.fail_every == 0 {
        tracing::warn!(request = n, "Injected failure");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody::new(format!("injected failure on request {}", n))),
        ));
    }

    tracing::debug!(request = n, "Completion");
    Ok(Json(json!({
        "request": n,
        "resolution": state.options.resolution,
        "echo": payload,
    })))
}

fn router(options: Options) -> Router {
    let state = Arc::new(MockState {
        options,
        completions: AtomicU64::new(0),
    });
    Router::new()
        .route("/health", get(health))
        .route("/v1/completions", post(completions))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = Options::parse(env::args().skip(1), |key| env::var(key).ok())?;
    tracing::info!(
        port = options.port,
        resolution = ?options.resolution,
        fail_every = options.fail_every,
        latency_ms = options.latency.as_millis() as u64,
        "Starting mock backend"
    );

    let listener = TcpListener::bind(("127.0.0.1", options.port)).await?;
    axum::serve(listener, router(options)).await?;
    Ok(())
}
