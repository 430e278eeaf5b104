//! 服务目录领域模型
//!
//! 服务定义是纯数据：启动参数按部署模式拆成几种 launch spec，
//! 健康检查由调用方注入的 probe 执行（见 `infra::health`）。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::hardware::HardwareVariant;

/// 宿主平台
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Win32,
    Darwin,
    Linux,
}

impl Platform {
    /// 当前进程所在平台
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Win32,
            "macos" => Platform::Darwin,
            _ => Platform::Linux,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Win32 => "win32",
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "win32" | "windows" => Ok(Platform::Win32),
            "darwin" | "macos" => Ok(Platform::Darwin),
            "linux" => Ok(Platform::Linux),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// 部署模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Local,
    Docker,
    Manual,
    Remote,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Local => "local",
            DeploymentMode::Docker => "docker",
            DeploymentMode::Manual => "manual",
            DeploymentMode::Remote => "remote",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(DeploymentMode::Local),
            "docker" => Ok(DeploymentMode::Docker),
            "manual" => Ok(DeploymentMode::Manual),
            "remote" => Ok(DeploymentMode::Remote),
            other => Err(format!("unknown deployment mode: {}", other)),
        }
    }
}

/// 服务类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Daemon,
    Container,
    Binary,
    HttpService,
}

impl ServiceType {
    /// 按类型的默认健康检查超时
    pub fn default_health_timeout(&self) -> Duration {
        match self {
            ServiceType::Daemon => Duration::from_secs(30),
            ServiceType::Container => Duration::from_secs(10),
            ServiceType::Binary => Duration::from_secs(5),
            ServiceType::HttpService => Duration::from_secs(3),
        }
    }
}

/// 某个部署模式的声明，`platforms` 为 None 表示不限平台
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModeSupport {
    pub mode: DeploymentMode,
    pub platforms: Option<Vec<Platform>>,
}

impl ModeSupport {
    pub fn everywhere(mode: DeploymentMode) -> Self {
        Self {
            mode,
            platforms: None,
        }
    }

    pub fn only(mode: DeploymentMode, platforms: &[Platform]) -> Self {
        Self {
            mode,
            platforms: Some(platforms.to_vec()),
        }
    }

    pub fn allows(&self, platform: Platform) -> bool {
        self.platforms
            .as_ref()
            .map_or(true, |list| list.contains(&platform))
    }
}

/// 端口映射
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// 卷挂载
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

/// 按硬件变体叠加到基础容器参数上的 GPU 配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuOverlay {
    /// `--device` 透传
    #[serde(default)]
    pub devices: Vec<String>,
    /// `--runtime`
    pub runtime: Option<String>,
    /// `--gpus`
    pub gpus: Option<String>,
    #[serde(default)]
    pub group_add: Vec<String>,
    #[serde(default)]
    pub security_opts: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// 容器启动参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerLaunchSpec {
    /// 容器名
    pub container_name: String,
    /// 镜像模板，`{variant}` 会被替换为硬件变体
    pub image_template: String,
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// 这些平台使用 host 网络（不做端口映射）
    #[serde(default)]
    pub host_network_platforms: Vec<Platform>,
    #[serde(default)]
    pub overlays: BTreeMap<HardwareVariant, GpuOverlay>,
    /// 启动前需要抢占的宿主端口
    pub preempt_port: Option<u16>,
    /// 允许被抢占的进程名（小写子串匹配）
    #[serde(default)]
    pub preempt_allowlist: Vec<String>,
}

impl ContainerLaunchSpec {
    /// 解析镜像名
    pub fn image_for(&self, variant: HardwareVariant) -> String {
        self.image_template.replace("{variant}", variant.as_str())
    }

    /// 镜像是否区分硬件变体
    pub fn is_variant_aware(&self) -> bool {
        self.image_template.contains("{variant}")
    }

    pub fn uses_host_network(&self, platform: Platform) -> bool {
        self.host_network_platforms.contains(&platform)
    }

    /// 宿主机上可访问的端口（host 网络下即容器端口）
    pub fn reachable_port(&self, platform: Platform) -> Option<u16> {
        let binding = self.ports.first()?;
        if self.uses_host_network(platform) {
            Some(binding.container)
        } else {
            Some(binding.host)
        }
    }

    pub fn overlay_for(&self, variant: HardwareVariant) -> Option<&GpuOverlay> {
        self.overlays.get(&variant)
    }
}

/// 本地二进制启动参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinaryLaunchSpec {
    /// 例如 `claracore/claracore-{platform}-{arch}{ext}`
    pub path_template: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl BinaryLaunchSpec {
    /// 解析当前平台/架构的二进制路径
    pub fn resolve_path(&self, platform: Platform, arch: &str) -> String {
        let ext = if platform == Platform::Win32 { ".exe" } else { "" };
        let arch = match arch {
            "x86_64" | "amd64" => "amd64",
            "aarch64" | "arm64" => "arm64",
            other => other,
        };
        self.path_template
            .replace("{platform}", platform.as_str())
            .replace("{arch}", arch)
            .replace("{ext}", ext)
    }
}

/// manual / remote 模式的连接参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManualSpec {
    pub requires_url: bool,
    pub health_path: String,
    /// 用户配置中保存 URL 的键
    pub config_key: String,
}

/// 健康检查约定
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: String,
    /// 覆盖按类型的默认超时
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
}

/// 服务定义
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub service_type: ServiceType,
    pub critical: bool,
    pub auto_restart: bool,
    /// 越小越先启动
    pub priority: u32,
    pub dependencies: Vec<String>,
    /// 宿主机上的知名端口
    pub port: Option<u16>,
    /// 声明顺序即偏好顺序
    pub modes: Vec<ModeSupport>,
    pub container: Option<ContainerLaunchSpec>,
    pub binary: Option<BinaryLaunchSpec>,
    pub manual: Option<ManualSpec>,
    pub health: HealthCheckSpec,
}

impl ServiceDefinition {
    pub fn declares_mode(&self, mode: DeploymentMode) -> bool {
        self.modes.iter().any(|m| m.mode == mode)
    }

    pub fn mode_support(&self, mode: DeploymentMode) -> Option<&ModeSupport> {
        self.modes.iter().find(|m| m.mode == mode)
    }

    pub fn health_timeout(&self) -> Duration {
        self.health
            .timeout
            .unwrap_or_else(|| self.service_type.default_health_timeout())
    }

    /// 默认的本地健康检查 URL
    pub fn default_health_url(&self, platform: Platform) -> Option<String> {
        let port = self
            .container
            .as_ref()
            .and_then(|c| c.reachable_port(platform))
            .or(self.port)?;
        Some(format!("http://localhost:{}{}", port, self.health.path))
    }

    /// 健康检查 URL：显式覆盖优先，否则使用本地默认
    pub fn health_url(&self, platform: Platform, override_url: Option<&str>) -> Option<String> {
        match override_url {
            Some(base) => Some(join_url(base, &self.health.path)),
            None => self.default_health_url(platform),
        }
    }
}

/// 分配了部署模式的服务
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedService {
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    pub assigned_mode: DeploymentMode,
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_path_resolution() {
        let spec = BinaryLaunchSpec {
            path_template: "claracore/claracore-{platform}-{arch}{ext}".to_string(),
            args: vec![],
        };
        assert_eq!(
            spec.resolve_path(Platform::Win32, "x86_64"),
            "claracore/claracore-win32-amd64.exe"
        );
        assert_eq!(
            spec.resolve_path(Platform::Darwin, "aarch64"),
            "claracore/claracore-darwin-arm64"
        );
    }

    #[test]
    fn test_health_url_override_joins_path() {
        let def = ServiceDefinition {
            name: "n8n".to_string(),
            service_type: ServiceType::Container,
            critical: false,
            auto_restart: true,
            priority: 5,
            dependencies: vec![],
            port: None,
            modes: vec![ModeSupport::everywhere(DeploymentMode::Docker)],
            container: None,
            binary: None,
            manual: None,
            health: HealthCheckSpec {
                path: "/healthz".to_string(),
                timeout: None,
            },
        };
        assert_eq!(
            def.health_url(Platform::Linux, Some("http://10.0.0.5:5678/")),
            Some("http://10.0.0.5:5678/healthz".to_string())
        );
        assert_eq!(def.health_url(Platform::Linux, None), None);
        assert_eq!(def.health_timeout(), Duration::from_secs(10));
    }
}
