//! Clara Agent - AI 服务编排代理
//!
//! 本地容器服务的生命周期管理、远程主机的一键部署与巡检，
//! 通过 HTTP API（含 SSE 日志流）对外提供。

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::constants::{DOCKER_COMMAND_TIMEOUT_SECS, LOCAL_COMMAND_TIMEOUT_SECS, VERSION};
use crate::config::EnvConfig;
use crate::infra::{DockerCli, HttpHealthProbe, LocalExecutor, SshConnector};
use crate::services::orchestrator::{Backends, OrchestratorSettings};
use crate::services::{ServiceOrchestrator, ServiceRegistry};
use crate::state::AppState;

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub port_override: Option<u16>,
}

/// 初始化日志（`RUST_LOG` 覆盖，默认 info）
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 用真实后端组装编排器
pub fn build_orchestrator(config: &EnvConfig) -> anyhow::Result<ServiceOrchestrator> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")?;

    let backends = Backends {
        engine: Arc::new(DockerCli::new(
            config.docker_bin.clone(),
            Duration::from_secs(DOCKER_COMMAND_TIMEOUT_SECS),
        )),
        probe: Arc::new(HttpHealthProbe::new(http)),
        executor: Arc::new(LocalExecutor::new(Duration::from_secs(
            LOCAL_COMMAND_TIMEOUT_SECS,
        ))),
        connector: Arc::new(SshConnector::new(
            config.ssh_connect_timeout,
            config.ssh_command_timeout,
        )),
    };

    Ok(ServiceOrchestrator::new(
        ServiceRegistry::builtin(),
        backends,
        OrchestratorSettings {
            lifecycle: config.lifecycle_settings(),
            remote: config.remote_settings(),
            preemption: config.port_preemption,
        },
    ))
}

/// 启动 HTTP 服务，直到收到 Ctrl-C
pub async fn run_agent(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }

    let orchestrator = Arc::new(build_orchestrator(&config)?);
    info!(
        version = VERSION,
        platform = orchestrator.platform().as_str(),
        services = orchestrator.registry().all().len(),
        "Clara agent starting"
    );

    let state = Arc::new(AppState::new(config.clone(), orchestrator));
    spawn_log_cleanup(state.clone());

    let app = api::router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// 定期清理已结束的部署日志通道
fn spawn_log_cleanup(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            let removed = state.log_hub.cleanup_expired(chrono::Duration::hours(1)).await;
            if removed > 0 {
                tracing::debug!(removed, "Expired deploy log channels removed");
            }
        }
    });
}
