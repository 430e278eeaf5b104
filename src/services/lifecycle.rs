//! 容器生命周期管理
//!
//! 一个实例管理一个具名容器：
//! absent -> created -> running <-> stopped，任意状态可 remove 回到 absent。
//!
//! 同名容器的并发操作由调用方串行化（见 orchestrator）。

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::container::{ContainerState, PullStatus, StartOptions, StartOutcome};
use crate::domain::hardware::HardwareVariant;
use crate::domain::service::{ContainerLaunchSpec, Platform, ServiceDefinition};
use crate::error::ErrorCode;
use crate::infra::command::CommandExecutor;
use crate::infra::docker::{ContainerEngine, CreateRequest, EngineError, PullStream};
use crate::infra::health::HealthProbe;
use crate::infra::port::PortPreemptor;
use crate::services::hardware::HardwareDetector;

/// 生命周期错误
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("port {port} is still in use: {remediation}")]
    PortInUse { port: u16, remediation: String },

    #[error("failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("container {name} exited immediately after start (status: {status})")]
    ExitedImmediately {
        name: String,
        status: String,
        logs: Vec<String>,
        inspect: String,
    },

    #[error("service {0} has no container launch spec")]
    NotContainerized(String),
}

impl ErrorCode for LifecycleError {
    fn code(&self) -> &'static str {
        match self {
            LifecycleError::Engine(e) => e.code(),
            LifecycleError::PortInUse { .. } => "port_in_use",
            LifecycleError::PullFailed { .. } => "image_pull_failed",
            LifecycleError::ExitedImmediately { .. } => "container_exited",
            LifecycleError::NotContainerized(_) => "not_containerized",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            LifecycleError::ExitedImmediately { logs, inspect, .. } => Some(format!(
                "--- logs ---\n{}\n--- inspect ---\n{}",
                logs.join("\n"),
                inspect
            )),
            _ => None,
        }
    }
}

/// 生命周期参数
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub platform: Platform,
    /// 健康检查轮询间隔
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub stop_grace: Duration,
    /// restart 时等待端口释放
    pub restart_delay: Duration,
    /// 启动失败时附带的日志行数
    pub diagnostic_tail: usize,
    /// 单次镜像拉取的总时长上限
    pub pull_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            poll_interval: Duration::from_secs(2),
            max_attempts: 30,
            stop_grace: Duration::from_secs(10),
            restart_delay: Duration::from_secs(2),
            diagnostic_tail: 50,
            pull_timeout: Duration::from_secs(1800),
        }
    }
}

/// 单个容器的生命周期管理器
pub struct ContainerLifecycleManager {
    definition: ServiceDefinition,
    spec: ContainerLaunchSpec,
    engine: Arc<dyn ContainerEngine>,
    probe: Arc<dyn HealthProbe>,
    /// 本机硬件探测
    executor: Arc<dyn CommandExecutor>,
    preemptor: Option<Arc<PortPreemptor>>,
    settings: LifecycleSettings,
}

impl ContainerLifecycleManager {
    pub fn new(
        definition: ServiceDefinition,
        engine: Arc<dyn ContainerEngine>,
        probe: Arc<dyn HealthProbe>,
        executor: Arc<dyn CommandExecutor>,
        preemptor: Option<Arc<PortPreemptor>>,
        settings: LifecycleSettings,
    ) -> Result<Self, LifecycleError> {
        let spec = definition
            .container
            .clone()
            .ok_or_else(|| LifecycleError::NotContainerized(definition.name.clone()))?;
        Ok(Self {
            definition,
            spec,
            engine,
            probe,
            executor,
            preemptor,
            settings,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.spec.container_name
    }

    /// 启动容器（幂等：已在运行时不重复创建）
    pub async fn start(&self, options: &StartOptions) -> Result<StartOutcome, LifecycleError> {
        let name = self.spec.container_name.clone();

        self.engine.ping().await?;

        let variant = self.select_variant(options).await;
        let image = self.spec.image_for(variant);
        info!(service = %self.definition.name, container = %name, image = %image, variant = %variant, "Starting container");

        let existing = self.engine.inspect(&name).await?;
        if let Some(ref state) = existing {
            if state.running {
                info!(container = %name, "Container already running");
                let healthy = self.wait_healthy(options).await;
                return Ok(StartOutcome {
                    container: name,
                    gpu_type: state.image_variant().unwrap_or(variant),
                    image: state.image.clone().unwrap_or(image),
                    created: false,
                    healthy,
                    message: health_message(healthy, "already running"),
                });
            }
        }

        self.preempt_port().await?;

        // 已有容器按原样启动，结果以容器实际的镜像为准
        let (gpu_type, image, created, note) = match existing {
            Some(state) => {
                let actual = state.image_variant().unwrap_or(variant);
                let note = match options.gpu_type {
                    Some(requested) if requested != actual => {
                        warn!(
                            container = %name,
                            requested = %requested,
                            existing = %actual,
                            "Existing container uses a different variant, remove it to switch"
                        );
                        Some(format!(
                            "existing container uses {} (requested {}); remove it to switch",
                            actual, requested
                        ))
                    }
                    _ => None,
                };
                info!(container = %name, variant = %actual, "Starting existing container");
                (actual, state.image.unwrap_or(image), false, note)
            }
            None => {
                self.ensure_image(&image).await?;
                let request = self.create_request(variant, image.clone());
                self.engine.create(&request).await?;
                (variant, image, true, None)
            }
        };

        self.engine.start(&name).await.map_err(|e| self.map_port_error(e))?;
        self.verify_running(&name).await?;

        let healthy = self.wait_healthy(options).await;
        let mut message = health_message(healthy, "started");
        if let Some(note) = note {
            message = format!("{}; {}", message, note);
        }
        Ok(StartOutcome {
            container: name,
            gpu_type,
            image,
            created,
            healthy,
            message,
        })
    }

    /// 停止容器；不存在或已停止时什么都不做
    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        let name = &self.spec.container_name;
        match self.engine.inspect(name).await? {
            Some(state) if state.running => {
                info!(container = %name, grace = ?self.settings.stop_grace, "Stopping container");
                self.engine.stop(name, self.settings.stop_grace).await?;
                Ok(true)
            }
            _ => {
                debug!(container = %name, "Container not running, nothing to stop");
                Ok(false)
            }
        }
    }

    pub async fn restart(&self, options: &StartOptions) -> Result<StartOutcome, LifecycleError> {
        self.stop().await?;
        tokio::time::sleep(self.settings.restart_delay).await;
        self.start(options).await
    }

    /// 删除容器；不存在时什么都不做
    pub async fn remove(&self) -> Result<bool, LifecycleError> {
        let name = &self.spec.container_name;
        let Some(state) = self.engine.inspect(name).await? else {
            return Ok(false);
        };
        if state.running {
            self.engine.stop(name, self.settings.stop_grace).await?;
        }
        self.engine.remove(name).await?;
        info!(container = %name, "Container removed");
        Ok(true)
    }

    /// 容器状态，不返回错误
    pub async fn status(&self) -> ContainerState {
        let name = &self.spec.container_name;
        match self.engine.inspect(name).await {
            Ok(Some(state)) => state,
            Ok(None) => ContainerState::absent(name),
            Err(e) => {
                warn!(container = %name, error = %e, "Container inspection failed");
                ContainerState::unknown(name, e.to_string())
            }
        }
    }

    pub async fn logs(&self, tail: usize) -> Result<Vec<String>, LifecycleError> {
        Ok(self.engine.logs(&self.spec.container_name, tail).await?)
    }

    async fn select_variant(&self, options: &StartOptions) -> HardwareVariant {
        if let Some(variant) = options.gpu_type {
            return variant;
        }
        if !self.spec.is_variant_aware() && self.spec.overlays.is_empty() {
            return HardwareVariant::Cpu;
        }
        match HardwareDetector::detect(self.executor.as_ref()).await {
            Ok(cap) => match cap.recommended() {
                Some(variant) => variant,
                None => {
                    warn!(reason = ?cap.unsupported_reason(), "Unsupported hardware, using cpu variant");
                    HardwareVariant::Cpu
                }
            },
            Err(e) => {
                warn!(error = %e, "Hardware detection failed, using cpu variant");
                HardwareVariant::Cpu
            }
        }
    }

    async fn preempt_port(&self) -> Result<(), LifecycleError> {
        let (Some(port), Some(preemptor)) = (self.spec.preempt_port, self.preemptor.as_ref()) else {
            return Ok(());
        };
        let report = preemptor.preempt(port, &self.spec.preempt_allowlist).await;
        if report.is_blocked() {
            return Err(LifecycleError::PortInUse {
                port,
                remediation: report.remediation(),
            });
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), LifecycleError> {
        if self.engine.image_exists(image).await? {
            debug!(image = %image, "Image already present");
            return Ok(());
        }

        let mut stream = self.engine.pull(image);
        let budget = self.settings.pull_timeout;
        match tokio::time::timeout(budget, drain_pull(&mut stream, image)).await {
            Ok(result) => result,
            Err(_) => {
                stream.cancel();
                warn!(image = %image, timeout = ?budget, "Image pull timed out");
                Err(LifecycleError::PullFailed {
                    image: image.to_string(),
                    reason: format!("timed out after {:?}", budget),
                })
            }
        }
    }

    fn create_request(&self, variant: HardwareVariant, image: String) -> CreateRequest {
        CreateRequest {
            name: self.spec.container_name.clone(),
            image,
            ports: self.spec.ports.clone(),
            volumes: self.spec.volumes.clone(),
            env: self.spec.env.clone(),
            host_network: self.spec.uses_host_network(self.settings.platform),
            network: None,
            overlay: self.spec.overlay_for(variant).cloned(),
            restart_policy: self
                .definition
                .auto_restart
                .then(|| "unless-stopped".to_string()),
        }
    }

    fn map_port_error(&self, error: EngineError) -> LifecycleError {
        match error {
            EngineError::PortAllocated(detail) => LifecycleError::PortInUse {
                port: self.spec.reachable_port(self.settings.platform).unwrap_or(0),
                remediation: format!("{}; stop the process using the port and retry", detail),
            },
            other => LifecycleError::Engine(other),
        }
    }

    async fn verify_running(&self, name: &str) -> Result<(), LifecycleError> {
        let state = self.engine.inspect(name).await?;
        if state.as_ref().map_or(false, |s| s.running) {
            return Ok(());
        }

        let status = state.map(|s| s.status).unwrap_or_else(|| "absent".to_string());
        let logs = self
            .engine
            .logs(name, self.settings.diagnostic_tail)
            .await
            .unwrap_or_else(|e| vec![format!("failed to fetch logs: {}", e)]);
        let inspect = self
            .engine
            .inspect_raw(name)
            .await
            .unwrap_or_else(|e| format!("failed to inspect: {}", e));
        warn!(container = %name, status = %status, "Container exited right after start");

        Err(LifecycleError::ExitedImmediately {
            name: name.to_string(),
            status,
            logs,
            inspect,
        })
    }

    /// 轮询健康检查，超出次数返回 false（不视为失败）
    async fn wait_healthy(&self, options: &StartOptions) -> bool {
        let Some(url) = self
            .definition
            .health_url(self.settings.platform, options.health_url.as_deref())
        else {
            return true;
        };
        let timeout = self.definition.health_timeout();

        for attempt in 1..=self.settings.max_attempts {
            if self.probe.check(&url, timeout).await {
                info!(url = %url, attempt = attempt, "Service healthy");
                return true;
            }
            if attempt < self.settings.max_attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
        warn!(url = %url, attempts = self.settings.max_attempts, "Service started but not yet healthy");
        false
    }
}

async fn drain_pull(stream: &mut PullStream, image: &str) -> Result<(), LifecycleError> {
    while let Some(event) = stream.next().await {
        match event.status {
            PullStatus::Progress => debug!(image = %image, detail = %event.detail, "Pull progress"),
            PullStatus::Complete => {
                info!(image = %image, "Image pulled");
                return Ok(());
            }
            PullStatus::Error => {
                return Err(LifecycleError::PullFailed {
                    image: image.to_string(),
                    reason: event.detail,
                })
            }
        }
    }
    Err(LifecycleError::PullFailed {
        image: image.to_string(),
        reason: "pull ended without completion".to_string(),
    })
}

fn health_message(healthy: bool, action: &str) -> String {
    if healthy {
        format!("Container {} and healthy", action)
    } else {
        format!("Container {} but not yet healthy", action)
    }
}
