//! 远程部署引擎

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::deploy::DeployStage;
use crate::domain::hardware::{HardwareCapability, HardwareVariant};
use crate::domain::remote::{ConnectionTestResult, DeploymentResult, RemoteConfig, RemoteStep};
use crate::error::ErrorCode;
use crate::infra::docker::overlay_flags;
use crate::infra::ssh::{RemoteConnector, RemoteSession};
use crate::services::hardware::HardwareDetector;
use crate::services::registry::claracore_overlays;

use super::secret::SecretSlot;
use super::setup::{self, RetryPolicy};
use super::shell::{shell_quote, CommandKind, DeployLog, RemoteCommand, RemoteShell};
use super::{
    close_session, within, RemoteError, RemoteSettings, CONTAINER_PREFIX, NETWORK_NAME, REMOTE_IMAGE_TEMPLATE,
    REMOTE_PORT,
};

/// 远程容器名
pub fn container_name(variant: HardwareVariant) -> String {
    format!("{}{}", CONTAINER_PREFIX, variant)
}

pub fn image_for(variant: HardwareVariant) -> String {
    REMOTE_IMAGE_TEMPLATE.replace("{variant}", variant.as_str())
}

/// `docker run` 参数（不含 `docker` 本身）
pub fn run_args(variant: HardwareVariant) -> String {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name(variant),
        "--network".to_string(),
        NETWORK_NAME.to_string(),
        "-p".to_string(),
        format!("{}:{}", REMOTE_PORT, REMOTE_PORT),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        "-v".to_string(),
        "claracore_models:/app/models".to_string(),
    ];
    if let Some(overlay) = claracore_overlays().get(&variant) {
        args.extend(overlay_flags(overlay));
        for (key, value) in &overlay.env {
            args.push("-e".to_string());
            args.push(shell_quote(&format!("{}={}", key, value)));
        }
    }
    args.push(image_for(variant));
    args.join(" ")
}

/// 部署阶段记录，同时输出 `[n/8]` 进度日志
struct StageTracker {
    stages: Vec<DeployStage>,
    current: Option<usize>,
    log: DeployLog,
}

impl StageTracker {
    fn new(log: DeployLog) -> Self {
        Self {
            stages: RemoteStep::ORDER.iter().map(RemoteStep::stage).collect(),
            current: None,
            log,
        }
    }

    fn begin(&mut self, step: RemoteStep) {
        let Some(index) = RemoteStep::ORDER.iter().position(|s| *s == step) else {
            return;
        };
        self.stages[index].start();
        self.current = Some(index);
        self.log.info(format!(
            "[{}/{}] {}",
            index + 1,
            RemoteStep::ORDER.len(),
            step.display_name()
        ));
    }

    fn complete(&mut self, message: Option<String>) {
        if let Some(index) = self.current.take() {
            self.stages[index].succeed(message);
        }
    }

    fn fail(&mut self, message: String) {
        if let Some(index) = self.current.take() {
            self.stages[index].fail(message);
        }
    }

    fn stages(&self) -> Vec<DeployStage> {
        self.stages.clone()
    }
}

/// 远程部署引擎
///
/// 提权密钥只在一次 [`deploy`](Self::deploy) 调用期间保存在实例中；
/// 同一实例上的部署互斥执行。
pub struct RemoteDeploymentEngine {
    connector: Arc<dyn RemoteConnector>,
    settings: RemoteSettings,
    secret: SecretSlot,
    deploy_lock: Mutex<()>,
}

impl RemoteDeploymentEngine {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: RemoteSettings) -> Self {
        Self {
            connector,
            settings,
            secret: SecretSlot::new(),
            deploy_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// 当前是否持有提权密钥
    pub fn secret_armed(&self) -> bool {
        self.secret.is_set()
    }

    /// 连接并检测硬件，不做任何修改
    pub async fn test_connection(&self, config: &RemoteConfig) -> ConnectionTestResult {
        let budget = self.settings.connect_timeout + self.settings.monitor_timeout;
        let deadline = Instant::now() + budget;

        let result = match within(deadline, budget, self.connect(config)).await {
            Ok(session) => {
                let slot = SecretSlot::new();
                let log = DeployLog::silent();
                let shell = RemoteShell::new(session.as_ref(), &slot, &log);
                let detected = within(deadline, budget, async {
                    HardwareDetector::detect(&shell)
                        .await
                        .map_err(RemoteError::from)
                })
                .await;
                close_session(session.as_ref()).await;
                detected
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(hardware) => {
                info!(target = %config.target(), variant = ?hardware.recommended(), "Remote connection test passed");
                ConnectionTestResult {
                    success: true,
                    hardware: Some(hardware),
                    error: None,
                }
            }
            Err(e) => {
                warn!(target = %config.target(), error = %e, "Remote connection test failed");
                ConnectionTestResult {
                    success: false,
                    hardware: None,
                    error: Some(e.to_error_info()),
                }
            }
        }
    }

    /// 执行一次完整部署，从不返回 Err
    pub async fn deploy(&self, config: &RemoteConfig, log: DeployLog) -> DeploymentResult {
        let _serial = self.deploy_lock.lock().await;
        let mut tracker = StageTracker::new(log.clone());

        let _guard = self.secret.arm(config.elevated_secret());
        let outcome = self.deploy_inner(config, &log, &mut tracker).await;

        match outcome {
            Ok(mut result) => {
                result.stages = tracker.stages();
                log.info(result.message.clone());
                result
            }
            Err(e) => {
                tracker.fail(e.to_string());
                log.warn(format!("Deployment failed: {}", e));
                warn!(target = %config.target(), code = e.code(), "Remote deployment failed");
                DeploymentResult::failure(e.to_error_info(), tracker.stages())
            }
        }
    }

    async fn deploy_inner(
        &self,
        config: &RemoteConfig,
        log: &DeployLog,
        tracker: &mut StageTracker,
    ) -> Result<DeploymentResult, RemoteError> {
        let budget = self.settings.deploy_timeout;
        let deadline = Instant::now() + budget;

        tracker.begin(RemoteStep::Connecting);
        let session = within(deadline, budget, self.connect(config)).await?;
        tracker.complete(Some(config.target()));

        // 超时也要断开会话
        let outcome = within(
            deadline,
            budget,
            self.run_steps(session.as_ref(), config, log, tracker),
        )
        .await;
        close_session(session.as_ref()).await;
        outcome
    }

    async fn connect(&self, config: &RemoteConfig) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(self.connector.connect(config).await?)
    }

    async fn run_steps(
        &self,
        session: &dyn RemoteSession,
        config: &RemoteConfig,
        log: &DeployLog,
        tracker: &mut StageTracker,
    ) -> Result<DeploymentResult, RemoteError> {
        let mut shell = RemoteShell::new(session, &self.secret, log);

        tracker.begin(RemoteStep::DetectingHardware);
        let capability = HardwareDetector::detect(&shell).await?;
        if let Some(reason) = capability.unsupported_reason() {
            return Err(RemoteError::UnsupportedArchitecture(reason.to_string()));
        }
        let requested = match (config.hardware_type, capability.recommended()) {
            (Some(variant), _) => variant,
            (None, Some(variant)) => variant,
            (None, None) => HardwareVariant::Cpu,
        };
        shell.detect_root().await?;
        tracker.complete(Some(format!("{} ({})", requested, capability.architecture)));

        tracker.begin(RemoteStep::InstallingPrerequisites);
        let (variant, fallback_to_cpu) = self
            .install_prerequisites(&mut shell, config, &capability, requested)
            .await?;
        tracker.complete(Some(format!("variant {}", variant)));

        tracker.begin(RemoteStep::ConfiguringNetwork);
        setup::ensure_network(&shell).await?;
        tracker.complete(None);

        tracker.begin(RemoteStep::CleaningPrevious);
        for previous in HardwareVariant::ALL {
            let out = shell
                .run(&shell.docker(
                    CommandKind::Probe,
                    &format!("rm -f {}", container_name(previous)),
                ))
                .await?;
            if out.success() {
                log.info(format!("Removed {}", container_name(previous)));
            }
        }
        tracker.complete(None);

        let image = image_for(variant);
        tracker.begin(RemoteStep::PullingImage);
        log.info(format!("Pulling {}", image));
        shell
            .run_streaming(&shell.docker(CommandKind::Mutating, &format!("pull {}", image)))
            .await?;
        tracker.complete(Some(image.clone()));

        let name = container_name(variant);
        tracker.begin(RemoteStep::StartingContainer);
        shell
            .run(&shell.docker(CommandKind::Mutating, &run_args(variant)))
            .await?;
        tokio::time::sleep(self.settings.settle).await;
        self.verify_running(&shell, &name).await?;
        tracker.complete(Some(name.clone()));

        tracker.begin(RemoteStep::VerifyingHealth);
        let healthy = self.probe_health(&shell).await?;
        if !healthy {
            log.warn("Health endpoint did not answer yet, the service may still be loading");
        }
        tracker.complete(Some(if healthy { "healthy" } else { "no response" }.to_string()));

        let url = format!("http://{}:{}", config.host, REMOTE_PORT);
        info!(
            target = %config.target(),
            variant = %variant,
            fallback = fallback_to_cpu,
            "Remote deployment finished"
        );

        Ok(DeploymentResult {
            success: true,
            gpu_type: Some(variant),
            requested_gpu_type: Some(requested),
            fallback_to_cpu,
            gpu_available: variant.is_gpu(),
            url: Some(url.clone()),
            container_name: Some(name),
            healthy,
            message: if fallback_to_cpu {
                format!("Deployed {} (CPU fallback) at {}", image, url)
            } else {
                format!("Deployed {} at {}", image, url)
            },
            error: None,
            hardware: Some(capability),
            stages: Vec::new(),
        })
    }

    /// 返回最终变体和是否降级
    async fn install_prerequisites(
        &self,
        shell: &mut RemoteShell<'_>,
        config: &RemoteConfig,
        capability: &HardwareCapability,
        requested: HardwareVariant,
    ) -> Result<(HardwareVariant, bool), RemoteError> {
        let distro = setup::detect_distro(shell).await?;
        shell.log().info(format!(
            "Distribution: {} ({:?})",
            distro.id, distro.package_manager
        ));

        setup::ensure_docker(shell, capability.docker_available).await?;

        if !requested.is_gpu() {
            return Ok((requested, false));
        }

        let retry = RetryPolicy {
            retries: self.settings.gpu_install_retries,
            backoff: self.settings.retry_backoff,
        };
        match setup::setup_gpu(shell, requested, &distro, &config.username, retry).await {
            Ok(()) => Ok((requested, false)),
            Err(e) if e.is_connection_level() => Err(e),
            Err(e) => {
                shell.log().warn(format!(
                    "{} setup failed: {}. Falling back to CPU",
                    requested, e
                ));
                Ok((HardwareVariant::Cpu, true))
            }
        }
    }

    async fn verify_running(&self, shell: &RemoteShell<'_>, name: &str) -> Result<(), RemoteError> {
        let ps = shell
            .run(&shell.docker(
                CommandKind::Probe,
                &format!("ps --filter name=^{}$ --format '{{{{.Names}}}}'", name),
            ))
            .await?;
        if ps.success() && ps.stdout.lines().any(|l| l.trim() == name) {
            return Ok(());
        }

        let logs = shell
            .run(&shell.docker(CommandKind::Probe, &format!("logs --tail 50 {}", name)))
            .await?;
        let inspect = shell
            .run(&shell.docker(CommandKind::Probe, &format!("inspect {}", name)))
            .await?;
        Err(RemoteError::ContainerNotRunning {
            name: name.to_string(),
            logs: format!("{}{}", logs.stdout, logs.stderr).trim().to_string(),
            inspect: inspect.stdout.trim().to_string(),
        })
    }

    async fn probe_health(&self, shell: &RemoteShell<'_>) -> Result<bool, RemoteError> {
        let out = shell
            .run(&RemoteCommand::probe(health_command(REMOTE_PORT)))
            .await?;
        Ok(out.success() && out.stdout.trim().starts_with('2'))
    }
}

/// 远端 curl 健康检查，输出 HTTP 状态码
pub(crate) fn health_command(port: u16) -> String {
    format!(
        "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 http://localhost:{}/health",
        port
    )
}
