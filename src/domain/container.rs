//! 容器相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::hardware::HardwareVariant;

/// 容器状态（只读快照，由 ContainerLifecycleManager 产生）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub exists: bool,
    pub running: bool,
    /// 引擎原始状态（created / running / exited ...）
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
    /// 容器端口 -> 宿主端口
    pub ports: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerState {
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: "absent".to_string(),
            ..Default::default()
        }
    }

    pub fn unknown(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: "unknown".to_string(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// 从镜像 tag 推断硬件变体（`repo:cuda` -> Cuda）
    pub fn image_variant(&self) -> Option<HardwareVariant> {
        let image = self.image.as_deref()?;
        let tag = image.rsplit_once(':')?.1;
        tag.parse().ok()
    }
}

/// 容器列表项（`docker ps` 一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: Vec<String>,
}

impl ContainerInfo {
    /// `docker ps --format` 使用的模板，与 [`ContainerInfo::parse_line`] 对应
    pub const PS_FORMAT: &'static str = "{{.Names}}|{{.Image}}|{{.Status}}|{{.Ports}}";

    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let parts: Vec<&str> = line.split('|').collect();
        Some(Self {
            name: parts.first()?.trim().to_string(),
            image: parts.get(1).unwrap_or(&"").trim().to_string(),
            status: parts.get(2).unwrap_or(&"").trim().to_string(),
            ports: parts
                .get(3)
                .unwrap_or(&"")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    /// Status 列以 "Up" 开头即为运行中
    pub fn is_running(&self) -> bool {
        self.status.starts_with("Up")
    }

    /// 第一个映射到宿主的端口（`0.0.0.0:5890->5890/tcp` -> 5890）
    pub fn first_host_port(&self) -> Option<u16> {
        self.ports.iter().find_map(|p| {
            let (host, _) = p.split_once("->")?;
            host.rsplit(':').next()?.parse().ok()
        })
    }
}

/// 容器日志查询参数
#[derive(Debug, Deserialize)]
pub struct ContainerLogsQuery {
    /// 返回最后 N 行，默认 100
    #[serde(default = "default_log_lines")]
    pub tail: usize,
}

fn default_log_lines() -> usize {
    100
}

/// 容器日志响应
#[derive(Debug, Serialize)]
pub struct ContainerLogsResponse {
    pub container: String,
    pub logs: Vec<String>,
    pub total_lines: usize,
}

/// 镜像拉取进度事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullProgress {
    pub status: PullStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    Progress,
    Complete,
    Error,
}

impl PullProgress {
    pub fn progress(detail: impl Into<String>) -> Self {
        Self {
            status: PullStatus::Progress,
            detail: detail.into(),
        }
    }

    pub fn complete(detail: impl Into<String>) -> Self {
        Self {
            status: PullStatus::Complete,
            detail: detail.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: PullStatus::Error,
            detail: detail.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, PullStatus::Progress)
    }
}

/// 本地启动选项
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartOptions {
    /// 覆盖自动检测的硬件变体
    #[serde(alias = "gpuType")]
    pub gpu_type: Option<HardwareVariant>,
    /// 覆盖健康检查 URL
    #[serde(alias = "healthUrl")]
    pub health_url: Option<String>,
}

/// 本地启动结果
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub container: String,
    pub gpu_type: HardwareVariant,
    pub image: String,
    /// 是否新建了容器
    pub created: bool,
    pub healthy: bool,
    pub message: String,
}

/// 变量名是否敏感（用于日志脱敏）
pub fn is_sensitive_key(key: &str) -> bool {
    const SENSITIVE_KEYWORDS: &[&str] = &[
        "password", "secret", "key", "token", "credential", "auth", "private", "jwt",
    ];
    let key_lower = key.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| key_lower.contains(kw))
}
