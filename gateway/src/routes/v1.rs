//! Client routes: submit, item status, wait for completion.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use modelgate_common::Priority;

use crate::error::{GatewayError, Result};
use crate::gateway::{ItemStatus, SubmitRequest};
use crate::Gateway;

const MAX_WAIT_SECS: u64 = 300;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST /v1/models/:model/submit - Admit a request. The body is the opaque
/// payload forwarded to the backend.
async fn submit(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ItemStatus>)> {
    let priority = match header(&headers, "x-priority") {
        Some(value) => value
            .parse::<Priority>()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?,
        None => Priority::Normal,
    };
    let client_id = header(&headers, "x-client-id").unwrap_or("anonymous");
    let resolution = header(&headers, "x-resolution").map(str::to_string);

    let request = SubmitRequest::new(model, payload)
        .priority(priority)
        .client_id(client_id)
        .resolution(resolution);

    let item = gateway.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(item.into())))
}

/// GET /v1/items/:id - Current state of an item, with its result once done.
async fn get_item(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Json<ItemStatus>> {
    Ok(Json(gateway.get_status(&id)?))
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_secs: Option<u64>,
}

/// GET /v1/items/:id/wait - Block until the item finishes or the timeout
/// elapses.
async fn wait_item(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<ItemStatus>> {
    let secs = query.timeout_secs.unwrap_or(30).min(MAX_WAIT_SECS);
    Ok(Json(gateway.wait_for(&id, Duration::from_secs(secs)).await?))
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/models/:model/submit", post(submit))
        .route("/items/:id", get(get_item))
        .route("/items/:id/wait", get(wait_item))
        .with_state(gateway)
}
