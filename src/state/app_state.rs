//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::EnvConfig;
use crate::services::ServiceOrchestrator;

use super::deployments::DeploymentStore;
use super::log_hub::LogHub;

/// 应用状态
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    pub config: EnvConfig,
    pub started_at: DateTime<Utc>,
    pub orchestrator: Arc<ServiceOrchestrator>,
    /// 远程部署记录
    pub deployments: DeploymentStore,
    /// 远程部署日志
    pub log_hub: LogHub,
}

impl AppState {
    pub fn new(config: EnvConfig, orchestrator: Arc<ServiceOrchestrator>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            orchestrator,
            deployments: DeploymentStore::new(),
            log_hub: LogHub::new(),
        }
    }
}
