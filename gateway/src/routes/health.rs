use axum::{routing::get, Json, Router};

use modelgate_common::HealthResponse;

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok(None).with_version(env!("CARGO_PKG_VERSION")))
}

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}
