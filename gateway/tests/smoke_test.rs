use std::sync::Arc;

use axum::body::Body;
use http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use modelgate::test_util::{memory_store, test_config, CallOutcome, MockBackend};
use modelgate::{routes, Gateway};

fn create_app() -> (axum::Router, Arc<Gateway>, Arc<MockBackend>) {
    let mut config = test_config(&["chat", "ocr"]);
    if let Some(ocr) = config.models.get_mut("ocr") {
        ocr.resolution_modes = vec!["base".to_string(), "large".to_string()];
        ocr.default_resolution = Some("base".to_string());
    }
    let backend = Arc::new(MockBackend::new());
    let gateway = Arc::new(Gateway::new(config, memory_store(), backend.clone()));
    (routes::app(gateway.clone()), gateway, backend)
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let req = builder
        .body(match body {
            Some(b) => Body::from(b.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _) = create_app();
    let (status, body) = send(&app, Method::GET, "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let health: modelgate_common::HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.resolution, None);
}

#[tokio::test]
async fn test_submit_to_stopped_model_returns_503() {
    let (app, _, _) = create_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/models/chat/submit",
        &[],
        Some(json!({"prompt": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "model_unavailable");
}

#[tokio::test]
async fn test_submit_unknown_model_returns_404_and_shows_in_gaps() {
    let (app, _, _) = create_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/models/whisper/submit",
        &[("X-Client-ID", "bob")],
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "unknown_model");

    let (status, gaps) = send(&app, Method::GET, "/admin/usage-gaps?limit=5", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gaps[0]["model"], "whisper");
    assert_eq!(gaps[0]["client_id"], "bob");
}

#[tokio::test]
async fn test_invalid_priority_header_returns_400() {
    let (app, _, _) = create_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/models/chat/submit",
        &[("X-Priority", "urgent")],
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_start_submit_wait_and_metrics() {
    let (app, gateway, backend) = create_app();
    backend.set_default_outcome(CallOutcome::Succeed(json!({"text": "pong"})));
    let tasks = gateway.spawn_background();

    let (status, state) = send(&app, Method::POST, "/admin/models/chat/start", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["status"], "running");

    let (status, item) = send(
        &app,
        Method::POST,
        "/v1/models/chat/submit",
        &[("X-Priority", "high"), ("X-Client-ID", "alice")],
        Some(json!({"prompt": "ping"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(item["priority"], "high");
    let id = item["id"].as_str().unwrap().to_string();

    let (status, done) = send(
        &app,
        Method::GET,
        &format!("/v1/items/{}/wait?timeout_secs=5", id),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["state"], "succeeded");
    assert_eq!(done["result"]["text"], "pong");

    let (status, metrics) =
        send(&app, Method::GET, "/admin/models/chat/metrics", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["total_processed"], 1);
    assert_eq!(metrics["processing"], 0);
    assert_eq!(metrics["utilization"], 0.0);

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_item_not_found() {
    let (app, _, _) = create_app();
    let (status, body) = send(&app, Method::GET, "/v1/items/missing", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "item_not_found");
}

#[tokio::test]
async fn test_admin_lifecycle_errors() {
    let (app, _, backend) = create_app();

    let (status, _) = send(&app, Method::POST, "/admin/models/whisper/start", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/admin/models/ocr/resolution",
        &[],
        Some(json!({"mode": "gigantic"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "unsupported_resolution");

    // A crashed backend cannot be stopped, only started.
    backend.fail_start(Some(modelgate::BackendError::Launch("missing binary".to_string())));
    let (_, state) = send(&app, Method::POST, "/admin/models/chat/start", &[], None).await;
    assert_eq!(state["status"], "crashed");
    let (status, body) =
        send(&app, Method::POST, "/admin/models/chat/stop?graceful=false", &[], None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "illegal_transition");

    let (status, crashes) = send(&app, Method::GET, "/admin/crashes?limit=10", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(crashes[0]["error_kind"], "start_failed");
}

#[tokio::test]
async fn test_models_overview_and_resolution_switch() {
    let (app, _, _) = create_app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/admin/models/ocr/start",
        &[],
        Some(json!({"resolution": "large"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolution_mode"], "large");

    let (status, body) = send(
        &app,
        Method::POST,
        "/admin/models/ocr/resolution",
        &[],
        Some(json!({"mode": "base", "graceful": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["resolution_mode"], "base");

    let (status, body) = send(&app, Method::GET, "/admin/models", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["models"][0]["model"], "chat");
    assert_eq!(body["models"][0]["uptime_secs"], 0);
    assert_eq!(body["models"][1]["status"], "running");
    assert_eq!(body["models"][1]["resolution_mode"], "base");
    assert!(body["models"][1]["uptime_secs"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn test_crash_log_time_window() {
    let (app, _, backend) = create_app();
    backend.fail_start(Some(modelgate::BackendError::Launch("missing binary".to_string())));
    send(&app, Method::POST, "/admin/models/chat/start", &[], None).await;

    let (status, crashes) = send(
        &app,
        Method::GET,
        "/admin/crashes?since=2000-01-01T00:00:00Z",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(crashes.as_array().unwrap().len(), 1);
    assert_eq!(crashes[0]["error_kind"], "start_failed");

    let (status, crashes) = send(
        &app,
        Method::GET,
        "/admin/crashes?since=2000-01-01T00:00:00Z&until=2000-01-02T00:00:00Z",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(crashes.as_array().unwrap().is_empty());

    let (status, body) = send(
        &app,
        Method::GET,
        "/admin/crashes?until=2000-01-02T00:00:00Z",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");

    let (status, _) = send(
        &app,
        Method::GET,
        "/admin/crashes?since=2000-01-02T00:00:00Z&until=2000-01-01T00:00:00Z",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_auto_switch_status_endpoint() {
    let (app, _, _) = create_app();
    let (status, body) = send(&app, Method::GET, "/admin/auto-switch", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["start_threshold"], 10);
    assert_eq!(body["models"].as_array().unwrap().len(), 2);
}
