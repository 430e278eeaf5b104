//! 宿主机信息领域模型

use serde::Serialize;

use crate::domain::service::{DeploymentMode, Platform};

/// 宿主机静态信息
#[derive(Clone, Debug, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub platform: Platform,
    pub os_version: String,
    pub cpu_arch: String,
    pub cpu_count: usize,
    pub cpu_brand: String,
    pub total_memory_gb: f64,
}

/// 单个服务在当前平台上的兼容性
#[derive(Clone, Debug, Serialize)]
pub struct ServiceCompatibility {
    pub name: String,
    pub critical: bool,
    pub supported_modes: Vec<DeploymentMode>,
    /// 第一个可用模式即默认模式
    pub default_mode: Option<DeploymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
}

/// 平台兼容性报告
#[derive(Clone, Debug, Serialize)]
pub struct PlatformCompatibility {
    pub host: HostInfo,
    pub services: Vec<ServiceCompatibility>,
}
