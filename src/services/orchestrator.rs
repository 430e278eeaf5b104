//! 服务编排门面
//!
//! 对外暴露的所有操作都在这里：本地容器服务的启停、远程部署与巡检、
//! 平台兼容性查询。预期内的失败以 `{success:false, error}` 返回。

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::container::{ContainerState, StartOptions, StartOutcome};
use crate::domain::remote::{
    ConnectionTestResult, DeploymentResult, ErrorInfo, FleetReport, RemoteConfig,
};
use crate::domain::service::{DeploymentMode, Platform, ResolvedService};
use crate::domain::system::PlatformCompatibility;
use crate::error::ErrorCode;
use crate::infra::command::CommandExecutor;
use crate::infra::docker::ContainerEngine;
use crate::infra::health::HealthProbe;
use crate::infra::port::{PortPreemptor, PreemptionPolicy};
use crate::infra::ssh::RemoteConnector;
use crate::services::lifecycle::{ContainerLifecycleManager, LifecycleError, LifecycleSettings};
use crate::services::platform::collect_host_info;
use crate::services::registry::{RegistryError, ServiceRegistry};
use crate::services::remote::{DeployLog, RemoteDeploymentEngine, RemoteFleetMonitor, RemoteSettings};

/// 编排层错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service {service} does not support docker mode on {platform}")]
    ModeUnsupported { service: String, platform: Platform },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ErrorCode for OrchestratorError {
    fn code(&self) -> &'static str {
        match self {
            OrchestratorError::UnknownService(_) => "unknown_service",
            OrchestratorError::ModeUnsupported { .. } => "mode_unsupported",
            OrchestratorError::Registry(e) => e.code(),
            OrchestratorError::Lifecycle(e) => e.code(),
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            OrchestratorError::Registry(e) => e.details(),
            OrchestratorError::Lifecycle(e) => e.details(),
            _ => None,
        }
    }
}

/// 操作结果：成功时展开结果字段，失败时带结构化错误
#[derive(Debug, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    #[serde(flatten)]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl<T> OperationResult<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }

    fn from_result<E: ErrorCode>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::failed(e.to_error_info()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub service: String,
    /// 之前是否在运行
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLogs {
    pub service: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedServices {
    pub platform: Platform,
    pub services: Vec<ResolvedService>,
}

/// 外部依赖
pub struct Backends {
    pub engine: Arc<dyn ContainerEngine>,
    pub probe: Arc<dyn HealthProbe>,
    /// 本机命令执行（硬件探测、端口抢占）
    pub executor: Arc<dyn CommandExecutor>,
    pub connector: Arc<dyn RemoteConnector>,
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub lifecycle: LifecycleSettings,
    pub remote: RemoteSettings,
    pub preemption: PreemptionPolicy,
}

/// 服务编排器
pub struct ServiceOrchestrator {
    registry: ServiceRegistry,
    engine: Arc<dyn ContainerEngine>,
    probe: Arc<dyn HealthProbe>,
    executor: Arc<dyn CommandExecutor>,
    preemptor: Arc<PortPreemptor>,
    lifecycle: LifecycleSettings,
    remote: RemoteDeploymentEngine,
    monitor: RemoteFleetMonitor,
    /// 同名服务的操作串行执行
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceOrchestrator {
    pub fn new(registry: ServiceRegistry, backends: Backends, settings: OrchestratorSettings) -> Self {
        let preemptor = Arc::new(PortPreemptor::new(
            backends.executor.clone(),
            settings.lifecycle.platform,
            settings.preemption,
        ));
        Self {
            registry,
            engine: backends.engine,
            probe: backends.probe,
            executor: backends.executor,
            preemptor,
            lifecycle: settings.lifecycle,
            remote: RemoteDeploymentEngine::new(backends.connector.clone(), settings.remote.clone()),
            monitor: RemoteFleetMonitor::new(backends.connector, settings.remote),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn platform(&self) -> Platform {
        self.lifecycle.platform
    }

    /// 每个已注册服务一把锁，未知名字不占表项
    fn lock_for(&self, service: &str) -> Result<Arc<Mutex<()>>, OrchestratorError> {
        if self.registry.get(service).is_none() {
            return Err(OrchestratorError::UnknownService(service.to_string()));
        }
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn manager(&self, service: &str) -> Result<ContainerLifecycleManager, OrchestratorError> {
        let definition = self
            .registry
            .get(service)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownService(service.to_string()))?;
        Ok(ContainerLifecycleManager::new(
            definition,
            self.engine.clone(),
            self.probe.clone(),
            self.executor.clone(),
            Some(self.preemptor.clone()),
            self.lifecycle.clone(),
        )?)
    }

    fn ensure_docker_mode(&self, service: &str) -> Result<(), OrchestratorError> {
        if self.registry.get(service).is_none() {
            return Err(OrchestratorError::UnknownService(service.to_string()));
        }
        if !self
            .registry
            .is_mode_supported(service, DeploymentMode::Docker, self.lifecycle.platform)
        {
            return Err(OrchestratorError::ModeUnsupported {
                service: service.to_string(),
                platform: self.lifecycle.platform,
            });
        }
        Ok(())
    }

    // ========== 远程 ==========

    pub async fn test_remote_setup(&self, config: &RemoteConfig) -> ConnectionTestResult {
        self.remote.test_connection(config).await
    }

    pub async fn deploy_remote(&self, config: &RemoteConfig, log: DeployLog) -> DeploymentResult {
        info!(target = %config.target(), hardware = ?config.hardware_type, "Remote deployment requested");
        self.remote.deploy(config, log).await
    }

    pub async fn monitor_remote(&self, config: &RemoteConfig) -> FleetReport {
        self.monitor.monitor(config).await
    }

    // ========== 本地容器服务 ==========

    pub async fn start_local_service(
        &self,
        service: &str,
        options: &StartOptions,
    ) -> OperationResult<StartOutcome> {
        let result = async {
            let lock = self.lock_for(service)?;
            let _serial = lock.lock().await;
            self.ensure_docker_mode(service)?;
            Ok::<_, OrchestratorError>(self.manager(service)?.start(options).await?)
        }
        .await;
        if let Err(ref e) = result {
            warn!(service = %service, error = %e, "Start failed");
        }
        OperationResult::from_result(result)
    }

    pub async fn stop_local_service(&self, service: &str) -> OperationResult<StopOutcome> {
        let result = async {
            let lock = self.lock_for(service)?;
            let _serial = lock.lock().await;
            let stopped = self.manager(service)?.stop().await?;
            Ok::<_, OrchestratorError>(StopOutcome {
                service: service.to_string(),
                stopped,
            })
        }
        .await;
        OperationResult::from_result(result)
    }

    pub async fn restart_local_service(&self, service: &str) -> OperationResult<StartOutcome> {
        let result = async {
            let lock = self.lock_for(service)?;
            let _serial = lock.lock().await;
            self.ensure_docker_mode(service)?;
            Ok::<_, OrchestratorError>(
                self.manager(service)?
                    .restart(&StartOptions::default())
                    .await?,
            )
        }
        .await;
        OperationResult::from_result(result)
    }

    /// 停止并删除容器
    pub async fn remove_local_service(&self, service: &str) -> OperationResult<StopOutcome> {
        let result = async {
            let lock = self.lock_for(service)?;
            let _serial = lock.lock().await;
            let stopped = self.manager(service)?.remove().await?;
            Ok::<_, OrchestratorError>(StopOutcome {
                service: service.to_string(),
                stopped,
            })
        }
        .await;
        OperationResult::from_result(result)
    }

    pub async fn get_service_status(&self, service: &str) -> OperationResult<ContainerState> {
        let result = match self.manager(service) {
            Ok(manager) => Ok(manager.status().await),
            Err(e) => Err(e),
        };
        OperationResult::from_result(result)
    }

    pub async fn get_service_logs(&self, service: &str, tail: usize) -> OperationResult<ServiceLogs> {
        let result = async {
            let lines = self.manager(service)?.logs(tail).await?;
            Ok::<_, OrchestratorError>(ServiceLogs {
                service: service.to_string(),
                lines,
            })
        }
        .await;
        OperationResult::from_result(result)
    }

    // ========== 注册表 ==========

    pub fn get_platform_compatibility(&self) -> OperationResult<PlatformCompatibility> {
        OperationResult::ok(self.registry.compatibility_report(collect_host_info()))
    }

    pub fn resolve_compatible_services(
        &self,
        features: &[String],
        preferred_mode: Option<DeploymentMode>,
    ) -> OperationResult<ResolvedServices> {
        let platform = self.lifecycle.platform;
        let result = self
            .registry
            .resolve_compatible_services(features, preferred_mode, platform)
            .map(|services| ResolvedServices { platform, services });
        OperationResult::from_result(result)
    }
}
