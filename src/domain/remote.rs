//! 远程部署领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::deploy::DeployStage;
use crate::domain::hardware::{HardwareCapability, HardwareVariant};

fn default_ssh_port() -> u16 {
    22
}

/// 远程主机连接与部署参数
#[derive(Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// OpenSSH / PKCS8 PEM 私钥内容
    pub private_key: Option<String>,
    pub private_key_passphrase: Option<String>,
    /// sudo 密码，未设置时使用登录密码
    pub sudo_password: Option<String>,
    /// 未设置时自动检测
    #[serde(alias = "hardwareType")]
    pub hardware_type: Option<HardwareVariant>,
}

impl RemoteConfig {
    pub fn new(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            password: Some(password.to_string()),
            private_key: None,
            private_key_passphrase: None,
            sudo_password: None,
            hardware_type: None,
        }
    }

    pub fn with_hardware(mut self, variant: HardwareVariant) -> Self {
        self.hardware_type = Some(variant);
        self
    }

    /// 提权所需的密钥（sudo 密码优先）
    pub fn elevated_secret(&self) -> Option<&str> {
        self.sudo_password
            .as_deref()
            .or(self.password.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

// 不输出任何凭据
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("hardware_type", &self.hardware_type)
            .finish()
    }
}

/// 远程部署的阶段（按执行顺序）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteStep {
    Connecting,
    DetectingHardware,
    InstallingPrerequisites,
    ConfiguringNetwork,
    CleaningPrevious,
    PullingImage,
    StartingContainer,
    VerifyingHealth,
}

impl RemoteStep {
    pub const ORDER: [RemoteStep; 8] = [
        RemoteStep::Connecting,
        RemoteStep::DetectingHardware,
        RemoteStep::InstallingPrerequisites,
        RemoteStep::ConfiguringNetwork,
        RemoteStep::CleaningPrevious,
        RemoteStep::PullingImage,
        RemoteStep::StartingContainer,
        RemoteStep::VerifyingHealth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RemoteStep::Connecting => "connecting",
            RemoteStep::DetectingHardware => "detecting_hardware",
            RemoteStep::InstallingPrerequisites => "installing_prerequisites",
            RemoteStep::ConfiguringNetwork => "configuring_network",
            RemoteStep::CleaningPrevious => "cleaning_previous",
            RemoteStep::PullingImage => "pulling_image",
            RemoteStep::StartingContainer => "starting_container",
            RemoteStep::VerifyingHealth => "verifying_health",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RemoteStep::Connecting => "Connect",
            RemoteStep::DetectingHardware => "Detect Hardware",
            RemoteStep::InstallingPrerequisites => "Install Prerequisites",
            RemoteStep::ConfiguringNetwork => "Configure Network",
            RemoteStep::CleaningPrevious => "Clean Previous",
            RemoteStep::PullingImage => "Pull Image",
            RemoteStep::StartingContainer => "Start Container",
            RemoteStep::VerifyingHealth => "Verify Health",
        }
    }

    pub fn stage(&self) -> DeployStage {
        DeployStage::new(self.name(), self.display_name())
    }
}

/// 结构化错误
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 远程部署结果
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentResult {
    pub success: bool,
    /// 最终使用的变体（发生回退时与请求不同）
    pub gpu_type: Option<HardwareVariant>,
    pub requested_gpu_type: Option<HardwareVariant>,
    pub fallback_to_cpu: bool,
    pub gpu_available: bool,
    pub url: Option<String>,
    pub container_name: Option<String>,
    /// 健康端点是否应答
    pub healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareCapability>,
    pub stages: Vec<DeployStage>,
}

impl DeploymentResult {
    pub fn failure(error: ErrorInfo, stages: Vec<DeployStage>) -> Self {
        Self {
            success: false,
            gpu_type: None,
            requested_gpu_type: None,
            fallback_to_cpu: false,
            gpu_available: false,
            url: None,
            container_name: None,
            healthy: false,
            message: error.message.clone(),
            error: Some(error),
            hardware: None,
            stages,
        }
    }
}

/// 连接测试结果
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// 单个远程服务容器的状态
#[derive(Clone, Debug, Serialize)]
pub struct RemoteServiceStatus {
    pub name: String,
    pub image: String,
    pub variant: Option<HardwareVariant>,
    pub running: bool,
    pub healthy: bool,
    pub status: String,
    pub port: Option<u16>,
    pub url: Option<String>,
}

/// 远程服务巡检报告
#[derive(Clone, Debug, Serialize)]
pub struct FleetReport {
    pub success: bool,
    pub services: Vec<RemoteServiceStatus>,
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl FleetReport {
    pub fn from_services(services: Vec<RemoteServiceStatus>) -> Self {
        let running = services.iter().filter(|s| s.running).count();
        let healthy = services.iter().filter(|s| s.healthy).count();
        Self {
            success: true,
            total: services.len(),
            running,
            healthy,
            services,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            success: false,
            services: Vec::new(),
            total: 0,
            running: 0,
            healthy: 0,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}
