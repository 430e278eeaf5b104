//! 命令执行器
//!
//! 硬件检测和远程部署只依赖 [`CommandExecutor`]，本地进程与 SSH 通道
//! 是它的两个实现：
//! - 超时控制
//! - 可选 stdin（提权密码走 stdin，不进命令行）
//! - stdout/stderr 分离
//!
//! 非零退出码不是错误，由调用方解释。

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ErrorCode;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum ExecError {
    /// 连接层故障（SSH 断开、认证失效），调用方必须中止
    #[error("connection error: {0}")]
    Connection(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ExecError {
    pub fn is_connection(&self) -> bool {
        matches!(self, ExecError::Connection(_))
    }
}

impl ErrorCode for ExecError {
    fn code(&self) -> &'static str {
        match self {
            ExecError::Connection(_) => "connection_error",
            ExecError::Timeout(_) => "command_timeout",
            ExecError::Spawn(_) => "spawn_failed",
        }
    }
}

/// 命令执行结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// 成功且有输出时返回 trim 后的 stdout
    pub fn stdout_if_success(&self) -> Option<&str> {
        let out = self.stdout.trim();
        (self.success() && !out.is_empty()).then_some(out)
    }

    /// 命令不存在（exit 127 或 shell 提示）
    pub fn command_missing(&self) -> bool {
        self.exit_code == Some(127)
            || self.stderr.contains("command not found")
            || self.stderr.contains("not recognized as an internal or external command")
    }
}

/// 统一的命令执行接口
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// 执行 shell 命令
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError>;

    /// 执行命令并逐行推送 stdout
    ///
    /// 默认实现在命令结束后一次性推送
    async fn exec_streaming(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<ExecOutput, ExecError> {
        let output = self.exec(command, stdin).await?;
        for line in output.stdout.lines() {
            let _ = lines.send(line.to_string());
        }
        Ok(output)
    }

    /// `uname -m` 不可用时（如 Windows）的架构提示
    fn arch_hint(&self) -> Option<String> {
        None
    }

    /// 用于日志的执行目标描述
    fn target(&self) -> String;
}

/// 本地进程执行器
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn shell_command(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        debug!(command = %command, "Local exec");

        let mut cmd = Self::shell_command(command);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // 子进程可能不读 stdin，写失败不影响结果
            let _ = pipe.write_all(input).await;
            drop(pipe);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))?
            .map_err(ExecError::Spawn)?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    fn arch_hint(&self) -> Option<String> {
        Some(std::env::consts::ARCH.to_string())
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}
