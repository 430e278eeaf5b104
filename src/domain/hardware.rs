//! 硬件能力领域模型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 硬件变体（决定使用哪个镜像 tag / 运行时 overlay）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareVariant {
    Cuda,
    Rocm,
    Strix,
    Vulkan,
    Cpu,
}

impl HardwareVariant {
    pub const ALL: [HardwareVariant; 5] = [
        HardwareVariant::Cuda,
        HardwareVariant::Rocm,
        HardwareVariant::Strix,
        HardwareVariant::Vulkan,
        HardwareVariant::Cpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareVariant::Cuda => "cuda",
            HardwareVariant::Rocm => "rocm",
            HardwareVariant::Strix => "strix",
            HardwareVariant::Vulkan => "vulkan",
            HardwareVariant::Cpu => "cpu",
        }
    }

    /// 是否需要 GPU 前置依赖
    pub fn is_gpu(&self) -> bool {
        !matches!(self, HardwareVariant::Cpu)
    }
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cuda" | "nvidia" => Ok(HardwareVariant::Cuda),
            "rocm" | "amd" => Ok(HardwareVariant::Rocm),
            "strix" => Ok(HardwareVariant::Strix),
            "vulkan" => Ok(HardwareVariant::Vulkan),
            "cpu" => Ok(HardwareVariant::Cpu),
            other => Err(format!("unknown hardware variant: {}", other)),
        }
    }
}

/// 检测结论的置信度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// 检测结论：推荐某个变体，或架构不受支持
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detected", rename_all = "lowercase")]
pub enum Detection {
    Supported { variant: HardwareVariant },
    Unsupported { reason: String },
}

/// NVIDIA 探测结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NvidiaInfo {
    pub present: bool,
    pub gpu_name: Option<String>,
    pub cuda_version: Option<String>,
}

/// AMD ROCm 探测结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RocmInfo {
    pub present: bool,
    pub product_name: Option<String>,
    pub version: Option<String>,
}

/// 硬件能力描述
///
/// 每次检测都重新计算，不做跨部署缓存
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapability {
    pub architecture: String,
    pub docker_available: bool,
    pub docker_version: Option<String>,
    pub nvidia: NvidiaInfo,
    pub rocm: RocmInfo,
    pub strix: bool,
    pub cpu_model: Option<String>,
    pub vulkan: bool,
    #[serde(flatten)]
    pub detection: Detection,
    pub confidence: Confidence,
}

impl HardwareCapability {
    /// 架构不受支持时的结果（不再做其它探测）
    pub fn unsupported(architecture: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            docker_available: false,
            docker_version: None,
            nvidia: NvidiaInfo::default(),
            rocm: RocmInfo::default(),
            strix: false,
            cpu_model: None,
            vulkan: false,
            detection: Detection::Unsupported {
                reason: reason.into(),
            },
            confidence: Confidence::High,
        }
    }

    /// 推荐的变体，架构不受支持时为 None
    pub fn recommended(&self) -> Option<HardwareVariant> {
        match &self.detection {
            Detection::Supported { variant } => Some(*variant),
            Detection::Unsupported { .. } => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self.detection, Detection::Supported { .. })
    }

    pub fn unsupported_reason(&self) -> Option<&str> {
        match &self.detection {
            Detection::Unsupported { reason } => Some(reason),
            Detection::Supported { .. } => None,
        }
    }
}
