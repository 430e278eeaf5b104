//! 远程部署
//!
//! 通过一个 SSH 会话串行执行：连接、硬件检测、安装前置依赖、
//! 配置网络、清理旧容器、拉取镜像、启动容器、健康验证。
//! GPU 前置依赖失败时自动降级到 CPU 变体。

pub mod engine;
pub mod monitor;
pub mod secret;
pub mod setup;
pub mod shell;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ErrorCode;
use crate::infra::command::ExecError;
use crate::infra::ssh::{ConnectError, RemoteSession};

pub use engine::RemoteDeploymentEngine;
pub use monitor::RemoteFleetMonitor;
pub use shell::DeployLog;

/// 远程服务容器名前缀
pub const CONTAINER_PREFIX: &str = "claracore-";
/// 远程镜像模板
pub const REMOTE_IMAGE_TEMPLATE: &str = "clara17verse/claracore:{variant}";
/// 容器端口，同时也是远程宿主端口
pub const REMOTE_PORT: u16 = 5890;
/// 共享 bridge 网络
pub const NETWORK_NAME: &str = "clara_network";
/// 断开会话的等待上限
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// 远程部署错误
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("remote command timed out: {command}")]
    CommandTimeout { command: String },

    #[error("remote command failed ({command}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("privilege escalation rejected: {0}")]
    PrivilegeDenied(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("{vendor} drivers not found on the remote host; install drivers first")]
    DriversMissing { vendor: String },

    #[error("GPU setup failed: {0}")]
    GpuSetup(String),

    #[error("container {name} is not running after start")]
    ContainerNotRunning {
        name: String,
        logs: String,
        inspect: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    /// 连接层错误不能触发 CPU 降级
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect(_) | RemoteError::Connection(_) | RemoteError::Timeout(_)
        )
    }

    /// 下载/网络抖动类错误，可以重试
    pub fn is_transient(&self) -> bool {
        const MARKERS: &[&str] = &[
            "timed out",
            "could not resolve",
            "temporary failure",
            "connection reset",
            "connection refused",
            "unable to connect",
        ];
        match self {
            RemoteError::CommandTimeout { .. } => true,
            RemoteError::CommandFailed { stderr, .. } => {
                let lower = stderr.to_lowercase();
                MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }
}

/// 在共享截止时间前完成，否则报 [`RemoteError::Timeout`]
pub(crate) async fn within<T, F>(deadline: Instant, budget: Duration, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .unwrap_or_else(|_| Err(RemoteError::Timeout(budget)))
}

/// 断开会话，超时或成功都算结束
pub(crate) async fn close_session(session: &dyn RemoteSession) {
    if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        warn!(target = %session.target(), "Remote session close timed out");
    }
}

impl From<ExecError> for RemoteError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Connection(msg) => RemoteError::Connection(msg),
            ExecError::Timeout(_) => RemoteError::CommandTimeout {
                command: "unknown".to_string(),
            },
            ExecError::Spawn(io) => RemoteError::Connection(io.to_string()),
        }
    }
}

impl ErrorCode for RemoteError {
    fn code(&self) -> &'static str {
        match self {
            RemoteError::Connect(e) => e.code(),
            RemoteError::Connection(_) => "connection_error",
            RemoteError::CommandTimeout { .. } => "command_timeout",
            RemoteError::CommandFailed { .. } => "command_failed",
            RemoteError::PrivilegeDenied(_) => "privilege_denied",
            RemoteError::UnsupportedArchitecture(_) => "unsupported_architecture",
            RemoteError::DriversMissing { .. } => "drivers_missing",
            RemoteError::GpuSetup(_) => "gpu_setup_failed",
            RemoteError::ContainerNotRunning { .. } => "container_not_running",
            RemoteError::Timeout(_) => "deployment_timeout",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            RemoteError::ContainerNotRunning { logs, inspect, .. } => Some(format!(
                "--- logs ---\n{}\n--- inspect ---\n{}",
                logs, inspect
            )),
            RemoteError::CommandFailed { exit_code, .. } => {
                exit_code.map(|code| format!("exit code {}", code))
            }
            _ => None,
        }
    }
}

/// 远程部署参数
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    pub connect_timeout: Duration,
    /// 整个部署的超时（包含软件安装）
    pub deploy_timeout: Duration,
    pub monitor_timeout: Duration,
    /// docker run 之后等待容器稳定
    pub settle: Duration,
    /// 临时性 GPU 安装错误的重试次数
    pub gpu_install_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            deploy_timeout: Duration::from_secs(1800),
            monitor_timeout: Duration::from_secs(20),
            settle: Duration::from_secs(5),
            gpu_install_retries: 2,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> RemoteError {
        RemoteError::CommandFailed {
            command: "apt-get install -y nvidia-container-toolkit".to_string(),
            exit_code: Some(100),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(failed("Temporary failure resolving 'nvidia.github.io'").is_transient());
        assert!(failed("curl: (28) Operation timed out after 30000 ms").is_transient());
        assert!(!failed("E: Unable to locate package nvidia-container-toolkit").is_transient());
        assert!(!RemoteError::DriversMissing {
            vendor: "NVIDIA".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_connection_level() {
        assert!(RemoteError::Connection("eof".to_string()).is_connection_level());
        assert!(!failed("boom").is_connection_level());
    }

    #[test]
    fn test_drivers_missing_message() {
        let err = RemoteError::DriversMissing {
            vendor: "NVIDIA".to_string(),
        };
        assert!(err.to_string().contains("install drivers first"));
        assert_eq!(err.code(), "drivers_missing");
    }
}
