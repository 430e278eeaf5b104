//! 本地服务 API
//!
//! 包含 /services/resolve, /services/:name/* 端点。
//! 业务失败返回 200 + `{success:false, error}`，只有未授权走 HTTP 错误码。

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::constants::DEFAULT_LOG_TAIL;
use crate::domain::container::StartOptions;
use crate::domain::service::DeploymentMode;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 服务解析请求，缺省字段取自环境配置
#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub features: Option<Vec<String>>,
    pub preferred_mode: Option<DeploymentMode>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/services/resolve", post(resolve_services))
        .route("/services/:name/start", post(start_service))
        .route("/services/:name/stop", post(stop_service))
        .route("/services/:name/restart", post(restart_service))
        .route("/services/:name/status", get(service_status))
        .route("/services/:name/logs", get(service_logs))
        .route("/services/:name", delete(remove_service))
}

/// POST /services/resolve
async fn resolve_services(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<ResolveRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let features = request
        .features
        .unwrap_or_else(|| state.config.features.clone());
    let mode = request.preferred_mode.or(state.config.preferred_mode);

    Json(state.orchestrator.resolve_compatible_services(&features, mode))
}

/// POST /services/:name/start
///
/// 请求体可选：`{"gpu_type": "cuda"}`，也接受 `gpuType`
async fn start_service(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<StartOptions>>,
) -> impl IntoResponse {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    Json(state.orchestrator.start_local_service(&name, &options).await)
}

/// POST /services/:name/stop
async fn stop_service(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.orchestrator.stop_local_service(&name).await)
}

/// POST /services/:name/restart
async fn restart_service(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.orchestrator.restart_local_service(&name).await)
}

/// DELETE /services/:name
async fn remove_service(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.orchestrator.remove_local_service(&name).await)
}

/// GET /services/:name/status
async fn service_status(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.orchestrator.get_service_status(&name).await)
}

/// GET /services/:name/logs?tail=N
async fn service_logs(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);
    Json(state.orchestrator.get_service_logs(&name, tail).await)
}
