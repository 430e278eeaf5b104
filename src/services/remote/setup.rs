//! 远程主机准备：Docker、GPU 运行时、网络

use std::time::Duration;
use tracing::debug;

use crate::domain::hardware::HardwareVariant;

use super::shell::{CommandKind, RemoteCommand, RemoteShell};
use super::{RemoteError, NETWORK_NAME};

const DOCKER_INSTALL: &str =
    "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sh /tmp/get-docker.sh";

const TOOLKIT_APT: &str = "curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey \
| gpg --dearmor --yes -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg \
&& curl -fsSL https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list \
| sed 's#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g' \
> /etc/apt/sources.list.d/nvidia-container-toolkit.list \
&& apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y nvidia-container-toolkit";

const TOOLKIT_REPO_RPM: &str =
    "https://nvidia.github.io/libnvidia-container/stable/rpm/nvidia-container-toolkit.repo";

/// 包管理器
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
    Unknown,
}

/// Linux 发行版
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Distro {
    pub id: String,
    pub package_manager: PackageManager,
}

impl Distro {
    pub fn unknown() -> Self {
        Self {
            id: "unknown".to_string(),
            package_manager: PackageManager::Unknown,
        }
    }
}

fn os_release_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix(key)?.strip_prefix('=')?;
        Some(value.trim().trim_matches('"').trim_matches('\''))
    })
}

fn manager_for(id: &str) -> PackageManager {
    match id {
        "ubuntu" | "debian" | "linuxmint" | "pop" | "raspbian" => PackageManager::Apt,
        "fedora" | "rhel" | "rocky" | "almalinux" => PackageManager::Dnf,
        "centos" | "amzn" => PackageManager::Yum,
        "arch" | "manjaro" | "endeavouros" => PackageManager::Pacman,
        "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" | "suse" => {
            PackageManager::Zypper
        }
        _ => PackageManager::Unknown,
    }
}

/// 解析 `/etc/os-release`，先看 ID 再看 ID_LIKE
pub fn parse_os_release(content: &str) -> Distro {
    let Some(id) = os_release_value(content, "ID").map(str::to_lowercase) else {
        return Distro::unknown();
    };

    let mut package_manager = manager_for(&id);
    if package_manager == PackageManager::Unknown {
        if let Some(like) = os_release_value(content, "ID_LIKE") {
            package_manager = like
                .to_lowercase()
                .split_whitespace()
                .map(manager_for)
                .find(|m| *m != PackageManager::Unknown)
                .unwrap_or(PackageManager::Unknown);
        }
    }

    Distro {
        id,
        package_manager,
    }
}

pub async fn detect_distro(shell: &RemoteShell<'_>) -> Result<Distro, RemoteError> {
    let out = shell
        .run(&RemoteCommand::probe("cat /etc/os-release"))
        .await?;
    if !out.success() {
        return Ok(Distro::unknown());
    }
    Ok(parse_os_release(&out.stdout))
}

/// 确保 Docker 已安装并可用，并决定 docker 命令是否需要 sudo
pub async fn ensure_docker(
    shell: &mut RemoteShell<'_>,
    docker_available: bool,
) -> Result<(), RemoteError> {
    if !docker_available {
        shell
            .log()
            .info("Docker not found, installing via get.docker.com");
        shell
            .run_streaming(&RemoteCommand::mutating(DOCKER_INSTALL).sudo())
            .await?;

        let enable = shell
            .run(&RemoteCommand::probe("systemctl enable --now docker").sudo())
            .await?;
        if !enable.success() {
            shell.log().warn(format!(
                "systemctl enable docker failed: {}",
                enable.stderr.trim()
            ));
        }

        shell
            .run(&RemoteCommand::mutating("docker --version"))
            .await?;
        shell.log().info("Docker installed");
    }

    if shell
        .succeeds(&RemoteCommand::probe("docker info"))
        .await?
    {
        shell.set_docker_sudo(false);
        return Ok(());
    }

    debug!("docker info failed without sudo, retrying elevated");
    shell.set_docker_sudo(true);
    if shell
        .succeeds(&shell.docker(CommandKind::Probe, "info"))
        .await?
    {
        shell.log().info("Docker requires sudo for this user");
        return Ok(());
    }

    // daemon 未运行
    shell
        .run(&RemoteCommand::mutating("systemctl start docker").sudo())
        .await?;
    shell
        .run(&shell.docker(CommandKind::Mutating, "info"))
        .await?;
    Ok(())
}

/// 确保共享网络存在
pub async fn ensure_network(shell: &RemoteShell<'_>) -> Result<(), RemoteError> {
    let exists = shell
        .succeeds(&shell.docker(
            CommandKind::Probe,
            &format!("network inspect {}", NETWORK_NAME),
        ))
        .await?;
    if exists {
        shell
            .log()
            .info(format!("Network {} already exists", NETWORK_NAME));
        return Ok(());
    }

    match shell
        .run(&shell.docker(
            CommandKind::Mutating,
            &format!("network create {}", NETWORK_NAME),
        ))
        .await
    {
        Ok(_) => {
            shell.log().info(format!("Created network {}", NETWORK_NAME));
            Ok(())
        }
        Err(RemoteError::CommandFailed { ref stderr, .. }) if stderr.contains("already exists") => {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// GPU 前置依赖安装的重试参数
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

/// 按变体准备 GPU 运行时
pub async fn setup_gpu(
    shell: &RemoteShell<'_>,
    variant: HardwareVariant,
    distro: &Distro,
    username: &str,
    retry: RetryPolicy,
) -> Result<(), RemoteError> {
    match variant {
        HardwareVariant::Cuda => setup_nvidia(shell, distro, retry).await,
        HardwareVariant::Rocm => setup_rocm(shell, username).await,
        HardwareVariant::Strix | HardwareVariant::Vulkan => {
            require_device(shell, "/dev/dri", "GPU (/dev/dri)").await
        }
        HardwareVariant::Cpu => Ok(()),
    }
}

fn toolkit_install_command(manager: PackageManager) -> Option<String> {
    match manager {
        PackageManager::Apt => Some(TOOLKIT_APT.to_string()),
        PackageManager::Dnf => Some(format!(
            "curl -fsSL {} -o /etc/yum.repos.d/nvidia-container-toolkit.repo && dnf install -y nvidia-container-toolkit",
            TOOLKIT_REPO_RPM
        )),
        PackageManager::Yum => Some(format!(
            "curl -fsSL {} -o /etc/yum.repos.d/nvidia-container-toolkit.repo && yum install -y nvidia-container-toolkit",
            TOOLKIT_REPO_RPM
        )),
        PackageManager::Zypper => Some(format!(
            "zypper --non-interactive ar {} && zypper --non-interactive --gpg-auto-import-keys install -y nvidia-container-toolkit",
            TOOLKIT_REPO_RPM
        )),
        PackageManager::Pacman => Some("pacman -Sy --noconfirm nvidia-container-toolkit".to_string()),
        PackageManager::Unknown => None,
    }
}

async fn setup_nvidia(
    shell: &RemoteShell<'_>,
    distro: &Distro,
    retry: RetryPolicy,
) -> Result<(), RemoteError> {
    if !shell.succeeds(&RemoteCommand::probe("nvidia-smi")).await? {
        return Err(RemoteError::DriversMissing {
            vendor: "NVIDIA".to_string(),
        });
    }

    let installed = shell
        .succeeds(&RemoteCommand::probe("nvidia-ctk --version"))
        .await?;
    if installed {
        shell.log().info("NVIDIA Container Toolkit already installed");
    } else {
        let command = toolkit_install_command(distro.package_manager).ok_or_else(|| {
            RemoteError::GpuSetup(format!(
                "no NVIDIA Container Toolkit package for distribution '{}'",
                distro.id
            ))
        })?;
        shell
            .log()
            .info(format!("Installing NVIDIA Container Toolkit ({:?})", distro.package_manager));
        let install = RemoteCommand::mutating(command).sudo();
        let install = &install;
        with_retry(shell, retry, move || shell.run_streaming(install)).await?;
    }

    let runtimes = shell
        .run(&shell.docker(CommandKind::Probe, "info --format '{{json .Runtimes}}'"))
        .await?;
    if runtimes.success() && runtimes.stdout.contains("nvidia") {
        return Ok(());
    }

    shell.log().info("Registering nvidia runtime with Docker");
    shell
        .run(
            &RemoteCommand::mutating(
                "nvidia-ctk runtime configure --runtime=docker && systemctl restart docker",
            )
            .sudo(),
        )
        .await?;
    Ok(())
}

async fn setup_rocm(shell: &RemoteShell<'_>, username: &str) -> Result<(), RemoteError> {
    require_device(shell, "/dev/kfd", "AMD ROCm").await?;
    require_device(shell, "/dev/dri", "AMD ROCm").await?;

    let out = shell
        .run(&RemoteCommand::probe(format!("usermod -aG video,render {}", username)).sudo())
        .await?;
    if !out.success() {
        shell.log().warn(format!(
            "Could not add {} to video/render groups: {}",
            username,
            out.stderr.trim()
        ));
    }
    Ok(())
}

async fn require_device(
    shell: &RemoteShell<'_>,
    path: &str,
    vendor: &str,
) -> Result<(), RemoteError> {
    if shell
        .succeeds(&RemoteCommand::probe(format!("ls {}", path)))
        .await?
    {
        Ok(())
    } else {
        Err(RemoteError::DriversMissing {
            vendor: vendor.to_string(),
        })
    }
}

/// 临时性错误按策略重试，其余错误直接返回
async fn with_retry<F, Fut, T>(
    shell: &RemoteShell<'_>,
    retry: RetryPolicy,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retry.retries => {
                attempt += 1;
                shell.log().warn(format!(
                    "Transient failure ({}), retry {}/{}",
                    e, attempt, retry.retries
                ));
                tokio::time::sleep(retry.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
