//! 远程服务巡检
//!
//! 只读：列出命名约定下的所有容器，对运行中的容器做健康检查。

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::container::ContainerInfo;
use crate::domain::hardware::HardwareVariant;
use crate::domain::remote::{FleetReport, RemoteConfig, RemoteServiceStatus};
use crate::error::ErrorCode;
use crate::infra::ssh::RemoteConnector;

use super::engine::health_command;
use super::secret::SecretSlot;
use super::shell::{CommandKind, DeployLog, RemoteCommand, RemoteShell};
use super::{close_session, within, RemoteError, RemoteSettings, CONTAINER_PREFIX, REMOTE_PORT};

/// 远程服务巡检器
pub struct RemoteFleetMonitor {
    connector: Arc<dyn RemoteConnector>,
    settings: RemoteSettings,
}

impl RemoteFleetMonitor {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: RemoteSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// 巡检远程主机，从不返回 Err
    pub async fn monitor(&self, config: &RemoteConfig) -> FleetReport {
        let result = self.collect(config).await;

        match result {
            Ok(services) => {
                let report = FleetReport::from_services(services);
                info!(
                    target = %config.target(),
                    total = report.total,
                    running = report.running,
                    healthy = report.healthy,
                    "Remote fleet checked"
                );
                report
            }
            Err(e) => {
                warn!(target = %config.target(), error = %e, "Remote fleet check failed");
                FleetReport::failure(e.to_error_info())
            }
        }
    }

    async fn collect(&self, config: &RemoteConfig) -> Result<Vec<RemoteServiceStatus>, RemoteError> {
        let budget = self.settings.connect_timeout + self.settings.monitor_timeout;
        let deadline = Instant::now() + budget;

        let session = within(deadline, budget, async {
            Ok::<_, RemoteError>(self.connector.connect(config).await?)
        })
        .await?;
        // 巡检不持有提权密钥
        let slot = SecretSlot::new();
        let log = DeployLog::silent();
        let mut shell = RemoteShell::new(session.as_ref(), &slot, &log);

        let outcome = within(deadline, budget, list_services(&mut shell, &config.host)).await;
        close_session(session.as_ref()).await;
        outcome
    }
}

async fn list_services(
    shell: &mut RemoteShell<'_>,
    host: &str,
) -> Result<Vec<RemoteServiceStatus>, RemoteError> {
    let args = format!(
        "ps -a --filter name={} --format '{}'",
        CONTAINER_PREFIX,
        ContainerInfo::PS_FORMAT
    );

    let mut out = shell.run(&shell.docker(CommandKind::Probe, &args)).await?;
    if !out.success() && out.stderr.to_lowercase().contains("permission denied") {
        debug!("docker ps denied, retrying with non-interactive sudo");
        shell.set_docker_sudo(true);
        out = shell.run(&shell.docker(CommandKind::Probe, &args)).await?;
    }
    if !out.success() {
        return Err(RemoteError::CommandFailed {
            command: format!("docker {}", args),
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }

    let containers: Vec<ContainerInfo> = out
        .stdout
        .lines()
        .filter_map(ContainerInfo::parse_line)
        .filter(|c| c.name.starts_with(CONTAINER_PREFIX))
        .collect();

    let mut services = Vec::with_capacity(containers.len());
    for container in containers {
        let running = container.is_running();
        let port = container.first_host_port();
        let healthy = if running {
            let probe = shell
                .run(&RemoteCommand::probe(health_command(
                    port.unwrap_or(REMOTE_PORT),
                )))
                .await?;
            probe.success() && probe.stdout.trim().starts_with('2')
        } else {
            false
        };
        services.push(RemoteServiceStatus {
            variant: variant_from_name(&container.name),
            running,
            healthy,
            url: port.map(|p| format!("http://{}:{}", host, p)),
            port,
            status: container.status,
            image: container.image,
            name: container.name,
        });
    }
    Ok(services)
}

/// `claracore-cuda` -> Cuda
pub fn variant_from_name(name: &str) -> Option<HardwareVariant> {
    name.strip_prefix(CONTAINER_PREFIX)?.parse().ok()
}
