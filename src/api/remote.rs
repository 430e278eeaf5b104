//! 远程部署 API
//!
//! 包含 /remote/test, /remote/deploy, /remote/monitor, /remote/deployments/* 端点

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::remote::RemoteConfig;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::remote::DeployLog;
use crate::state::{AppState, DeploymentRecord};

/// 部署已受理
#[derive(Debug, Serialize)]
pub struct DeployAccepted {
    pub deployment_id: String,
    pub status_url: String,
    pub stream_url: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/remote/test", post(test_remote))
        .route("/remote/deploy", post(deploy_remote))
        .route("/remote/monitor", post(monitor_remote))
        .route("/remote/deployments", get(recent_deployments))
        .route("/remote/deployments/:id", get(get_deployment))
        .route("/remote/deployments/:id/stream", get(stream_deployment))
}

/// POST /remote/test
async fn test_remote(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(config): Json<RemoteConfig>,
) -> impl IntoResponse {
    Json(state.orchestrator.test_remote_setup(&config).await)
}

/// POST /remote/deploy
///
/// 后台执行，立即返回 202 和部署 ID；日志通过 SSE 订阅
async fn deploy_remote(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(config): Json<RemoteConfig>,
) -> ApiResult<impl IntoResponse> {
    if config.host.trim().is_empty() || config.username.trim().is_empty() {
        return Err(ApiError::bad_request("host and username are required"));
    }

    let record = DeploymentRecord::new(config.target(), config.hardware_type);
    let id = state.deployments.create(record).await;
    let sender = state.log_hub.create(&id).await;
    info!(deployment_id = %id, target = %config.target(), "Remote deployment accepted");

    let task_state = state.clone();
    let task_id = id.clone();
    tokio::spawn(async move {
        let result = task_state
            .orchestrator
            .deploy_remote(&config, DeployLog::new(sender))
            .await;
        task_state.deployments.finish(&task_id, result).await;
        // 发送端随 DeployLog 一起释放，订阅者收到 Closed
        task_state.log_hub.finish(&task_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployAccepted {
            status_url: format!("/remote/deployments/{}", id),
            stream_url: format!("/remote/deployments/{}/stream", id),
            deployment_id: id,
        }),
    ))
}

/// POST /remote/monitor
async fn monitor_remote(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(config): Json<RemoteConfig>,
) -> impl IntoResponse {
    Json(state.orchestrator.monitor_remote(&config).await)
}

/// GET /remote/deployments
async fn recent_deployments(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.deployments.recent(20).await)
}

/// GET /remote/deployments/:id
async fn get_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .deployments
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", id)))
}

/// GET /remote/deployments/:id/stream
///
/// 每行日志一个 `data:` 事件，结束时发送 `complete` 事件（部署记录 JSON）
async fn stream_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut rx = state
        .log_hub
        .subscribe(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", id)))?;

    let stream = async_stream::stream! {
        // 订阅之前就已结束的部署直接给结果
        if !state.log_hub.is_finished(&id).await {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        let json = serde_json::to_string(&line).unwrap_or_default();
                        yield Ok(Event::default().data(json));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(deployment_id = %id, lagged = n, "Deploy log subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        // finish 在发送端释放之后才写入记录，稍等一下
        let mut record = state.deployments.get(&id).await;
        for _ in 0..20 {
            if record.as_ref().map(|r| r.result.is_some()).unwrap_or(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            record = state.deployments.get(&id).await;
        }
        if let Some(record) = record {
            let json = serde_json::to_string(&record).unwrap_or_default();
            yield Ok(Event::default().event("complete").data(json));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::domain::service::Platform;
    use crate::state::DeploymentStatus;
    use crate::testing::{fake_orchestrator, FakeEngine, FakeHost};

    fn state(host: FakeHost) -> Arc<AppState> {
        let orchestrator = fake_orchestrator(Platform::Linux, Arc::new(FakeEngine::new()), host);
        Arc::new(AppState::new(EnvConfig::default(), Arc::new(orchestrator)))
    }

    async fn wait_finished(state: &AppState, id: &str) -> DeploymentRecord {
        for _ in 0..200 {
            if let Some(record) = state.deployments.get(id).await {
                if record.status != DeploymentStatus::Running {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {} did not finish", id);
    }

    #[tokio::test]
    async fn test_deploy_runs_in_background() {
        let host = FakeHost::new("s3cr3t-pw").configure(|s| {
            s.docker_installed = true;
            s.docker_group = true;
        });
        let state = state(host);

        let response = deploy_remote(
            RequireApiKey,
            State(state.clone()),
            Json(RemoteConfig::new("10.0.0.5", "ubuntu", "s3cr3t-pw")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let ids = state.deployments.recent(1).await;
        let record = wait_finished(&state, &ids[0].id).await;
        assert_eq!(record.status, DeploymentStatus::Succeeded);
        assert!(record.result.unwrap().success);
        assert!(state.log_hub.is_finished(&record.id).await);
    }

    #[tokio::test]
    async fn test_deploy_rejects_empty_host() {
        let state = state(FakeHost::new("x"));
        let response = deploy_remote(
            RequireApiKey,
            State(state),
            Json(RemoteConfig::new(" ", "ubuntu", "x")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_deployment_not_found() {
        let state = state(FakeHost::new("x"));
        let response = get_deployment(RequireApiKey, State(state.clone()), Path("nope".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let stream = stream_deployment(RequireApiKey, State(state), Path("nope".into())).await;
        assert!(stream.is_err());
    }
}
