//! Admin API routes.
//!
//! Provides:
//! - Backend overview and lifecycle control (`/admin/models`, `/admin/models/:model/{start,stop,resolution}`)
//! - Per-model queue metrics (`/admin/models/:model/metrics`)
//! - Crash log and usage gaps (`/admin/crashes`, `/admin/usage-gaps`)
//! - Auto-switch status (`/admin/auto-switch`)

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use modelgate_common::{BackendState, CrashRecord, UsageRecord};

use crate::auto_switch::AutoSwitchStatus;
use crate::backend::StartOptions;
use crate::error::{GatewayError, Result};
use crate::metrics::QueueMetrics;
use crate::Gateway;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

fn default_graceful() -> bool {
    true
}

/// One backend in the /admin/models overview.
#[derive(Debug, Serialize)]
pub struct ModelOverview {
    #[serde(flatten)]
    pub state: BackendState,
    pub uptime_secs: i64,
}

/// Response for /admin/models endpoint.
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelOverview>,
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

#[derive(Debug, Deserialize)]
pub struct SwitchResolutionRequest {
    pub mode: String,
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        clamp_limit(self.limit)
    }
}

/// Crash log query. `since`/`until` select a time window (RFC 3339);
/// `until` defaults to now.
#[derive(Debug, Deserialize)]
pub struct CrashQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

/// GET /admin/models - Every registered model's backend state and uptime
async fn list_models(State(gateway): State<Arc<Gateway>>) -> Json<ModelsResponse> {
    let now = Utc::now();
    let models: Vec<ModelOverview> = gateway
        .backend_states()
        .await
        .into_iter()
        .map(|state| ModelOverview {
            uptime_secs: state.uptime_secs(now),
            state,
        })
        .collect();
    let total = models.len();
    Json(ModelsResponse { models, total })
}

/// POST /admin/models/:model/start - Start a backend, optionally with a resolution
async fn start_model(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<BackendState>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let options = StartOptions::with_resolution(request.resolution);
    Ok(Json(gateway.admin_start(&model, options).await?))
}

/// POST /admin/models/:model/stop?graceful= - Stop a backend
async fn stop_model(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<Json<BackendState>> {
    Ok(Json(gateway.admin_stop(&model, query.graceful).await?))
}

/// POST /admin/models/:model/resolution - Switch resolution mode
async fn switch_resolution(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
    Json(request): Json<SwitchResolutionRequest>,
) -> Result<Json<BackendState>> {
    Ok(Json(
        gateway
            .admin_switch_resolution(&model, &request.mode, request.graceful)
            .await?,
    ))
}

/// GET /admin/models/:model/metrics - Queue metrics snapshot
async fn model_metrics(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
) -> Result<Json<QueueMetrics>> {
    Ok(Json(gateway.queue_metrics(&model).await?))
}

/// GET /admin/crashes?limit=&since=&until= - Crash log, most recent first
async fn crashes(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CrashQuery>,
) -> Result<Json<Vec<CrashRecord>>> {
    let limit = clamp_limit(query.limit);
    let records = match (query.since, query.until) {
        (None, None) => gateway.crash_log(limit)?,
        (Some(since), until) => {
            gateway.crash_log_between(since, until.unwrap_or_else(Utc::now), limit)?
        }
        (None, Some(_)) => {
            return Err(GatewayError::InvalidRequest(
                "'until' requires 'since'".to_string(),
            ))
        }
    };
    Ok(Json(records))
}

/// GET /admin/usage-gaps?limit= - Requests for models with no backend
async fn usage_gaps(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<UsageRecord>>> {
    Ok(Json(gateway.usage_gaps(query.limit())?))
}

/// GET /admin/auto-switch - Auto-switch configuration, usage and decisions
async fn auto_switch(State(gateway): State<Arc<Gateway>>) -> Result<Json<AutoSwitchStatus>> {
    Ok(Json(gateway.auto_switch_status()?))
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/:model/start", post(start_model))
        .route("/models/:model/stop", post(stop_model))
        .route("/models/:model/resolution", post(switch_resolution))
        .route("/models/:model/metrics", get(model_metrics))
        .route("/crashes", get(crashes))
        .route("/usage-gaps", get(usage_gaps))
        .route("/auto-switch", get(auto_switch))
        .with_state(gateway)
}
