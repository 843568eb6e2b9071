//! Thin HTTP adapter over [`Gateway`](crate::Gateway).

pub mod admin;
pub mod health;
pub mod v1;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::logging::request_logger;
use crate::Gateway;

/// Full router with CORS, tracing and request logging.
pub fn app(gateway: Arc<Gateway>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router(gateway.clone()))
        .nest("/admin", admin::router(gateway))
        .layer(middleware::from_fn(request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
