//! Docker CLI 封装
//!
//! 生命周期管理只依赖 [`ContainerEngine`]，[`DockerCli`] 通过
//! `tokio::process` 调用 docker 命令行实现它。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::container::{is_sensitive_key, ContainerState, PullProgress};
use crate::domain::service::{GpuOverlay, PortBinding, VolumeMount};
use crate::error::ErrorCode;

/// 容器引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine is not reachable ({0}); start the container engine (Docker Desktop or dockerd) and retry")]
    Unreachable(String),
    #[error("port is already allocated: {0}")]
    PortAllocated(String),
    #[error("failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("docker {op} failed: {stderr}")]
    Command { op: String, stderr: String },
    #[error("docker {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },
    #[error("unexpected docker output: {0}")]
    Parse(String),
}

impl EngineError {
    /// 根据 stderr 归类错误
    pub fn classify(op: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("cannot connect to the docker daemon")
            || lower.contains("error during connect")
            || lower.contains("is the docker daemon running")
        {
            EngineError::Unreachable(stderr.trim().to_string())
        } else if lower.contains("port is already allocated")
            || lower.contains("address already in use")
        {
            EngineError::PortAllocated(stderr.trim().to_string())
        } else {
            EngineError::Command {
                op: op.to_string(),
                stderr: stderr.trim().to_string(),
            }
        }
    }
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            EngineError::Unreachable(_) => "engine_unreachable",
            EngineError::PortAllocated(_) => "port_in_use",
            EngineError::PullFailed { .. } => "image_pull_failed",
            EngineError::Command { .. } => "engine_command_failed",
            EngineError::Timeout { .. } => "engine_timeout",
            EngineError::Parse(_) => "engine_output_invalid",
        }
    }
}

/// `docker create` 参数
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    pub host_network: bool,
    pub network: Option<String>,
    /// 按硬件变体合并的 GPU 配置
    pub overlay: Option<GpuOverlay>,
    pub restart_policy: Option<String>,
}

impl CreateRequest {
    /// 合并 overlay 后的环境变量（overlay 覆盖同名变量）
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(ref overlay) = self.overlay {
            env.extend(overlay.env.clone());
        }
        env
    }

    /// 构造 `docker create` 参数
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), self.name.clone()];

        if self.host_network {
            args.push("--network".to_string());
            args.push("host".to_string());
        } else {
            if let Some(ref network) = self.network {
                args.push("--network".to_string());
                args.push(network.clone());
            }
            for port in &self.ports {
                args.push("-p".to_string());
                args.push(format!("{}:{}", port.host, port.container));
            }
        }

        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.source, volume.target));
        }

        for (key, value) in self.merged_env() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref overlay) = self.overlay {
            args.extend(overlay_flags(overlay));
        }

        if let Some(ref policy) = self.restart_policy {
            args.push("--restart".to_string());
            args.push(policy.clone());
        }

        args.push(self.image.clone());
        args
    }

    /// 用于日志的命令行（敏感变量脱敏）
    pub fn redacted_command(&self) -> String {
        let args: Vec<String> = self
            .to_args()
            .into_iter()
            .map(|arg| match arg.split_once('=') {
                Some((key, _)) if is_sensitive_key(key) => format!("{}=***", key),
                _ => arg,
            })
            .collect();
        format!("docker {}", args.join(" "))
    }
}

/// GPU overlay 对应的 docker 参数
pub fn overlay_flags(overlay: &GpuOverlay) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(ref gpus) = overlay.gpus {
        args.push("--gpus".to_string());
        args.push(gpus.clone());
    }
    if let Some(ref runtime) = overlay.runtime {
        args.push("--runtime".to_string());
        args.push(runtime.clone());
    }
    for device in &overlay.devices {
        args.push(format!("--device={}", device));
    }
    for group in &overlay.group_add {
        args.push("--group-add".to_string());
        args.push(group.clone());
    }
    for opt in &overlay.security_opts {
        args.push("--security-opt".to_string());
        args.push(opt.clone());
    }
    for cap in &overlay.cap_add {
        args.push(format!("--cap-add={}", cap));
    }
    args
}

/// 镜像拉取进度流
///
/// 有限流：以 complete 或 error 事件结束；drop 或 [`PullStream::cancel`]
/// 会终止底层的拉取进程，不可重启。
pub struct PullStream {
    rx: mpsc::Receiver<PullProgress>,
    cancel: CancellationToken,
}

impl PullStream {
    pub fn new(rx: mpsc::Receiver<PullProgress>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// 由预先给定的事件构造（用于测试替身）
    pub fn from_events(events: Vec<PullProgress>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        Self::new(rx, CancellationToken::new())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for PullStream {
    type Item = PullProgress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PullStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 容器引擎操作
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// 引擎是否可达
    async fn ping(&self) -> Result<(), EngineError>;

    /// 容器不存在时返回 None
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError>;

    /// 原始 inspect 输出（用于诊断）
    async fn inspect_raw(&self, name: &str) -> Result<String, EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    fn pull(&self, image: &str) -> PullStream;

    async fn create(&self, request: &CreateRequest) -> Result<(), EngineError>;

    async fn start(&self, name: &str) -> Result<(), EngineError>;

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), EngineError>;

    async fn remove(&self, name: &str) -> Result<(), EngineError>;

    /// 带时间戳的 stdout/stderr 合并日志，最多 `tail` 行
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError>;
}

/// 基于 docker CLI 的引擎
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, op: &str, args: &[String]) -> Result<std::process::Output, EngineError> {
        debug!(op = %op, "docker {}", op);
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| EngineError::Timeout {
                op: op.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| EngineError::Unreachable(format!("failed to run {}: {}", self.binary, e)))
    }

    async fn run_checked(&self, op: &str, args: &[String]) -> Result<String, EngineError> {
        let output = self.run(op, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(EngineError::classify(
                op,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker", Duration::from_secs(60))
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such object")
        || lower.contains("no such container")
        || lower.contains("no such image")
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<(), EngineError> {
        let output = self
            .run("info", &args(&["info", "--format", "{{.ServerVersion}}"]))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Unreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError> {
        let output = self.run("inspect", &args(&["inspect", name])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_object(&stderr) {
                return Ok(None);
            }
            return Err(EngineError::classify("inspect", &stderr));
        }
        parse_inspect(name, &String::from_utf8_lossy(&output.stdout))
    }

    async fn inspect_raw(&self, name: &str) -> Result<String, EngineError> {
        self.run_checked("inspect", &args(&["inspect", name])).await
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        let output = self
            .run("image inspect", &args(&["image", "inspect", image]))
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_object(&stderr) {
            Ok(false)
        } else {
            Err(EngineError::classify("image inspect", &stderr))
        }
    }

    fn pull(&self, image: &str) -> PullStream {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let binary = self.binary.clone();
        let image = image.to_string();

        tokio::spawn(async move {
            info!(image = %image, "Pulling image");
            let spawned = Command::new(&binary)
                .args(["pull", &image])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    let _ = tx
                        .send(PullProgress::error(format!("failed to run {}: {}", binary, e)))
                        .await;
                    return;
                }
            };

            let stderr = child.stderr.take();
            let stderr_task = tokio::spawn(async move {
                let mut collected = String::new();
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                }
                collected
            });

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            warn!(image = %image, "Image pull cancelled");
                            let _ = child.kill().await;
                            return;
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                if tx.send(PullProgress::progress(line)).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            _ => break,
                        }
                    }
                }
            }

            let status = tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status,
            };
            let stderr = stderr_task.await.unwrap_or_default();

            let event = match status {
                Ok(s) if s.success() => PullProgress::complete(format!("pulled {}", image)),
                Ok(_) => PullProgress::error(stderr.trim().to_string()),
                Err(e) => PullProgress::error(e.to_string()),
            };
            let _ = tx.send(event).await;
        });

        PullStream::new(rx, cancel)
    }

    async fn create(&self, request: &CreateRequest) -> Result<(), EngineError> {
        info!(command = %request.redacted_command(), "Creating container");
        self.run_checked("create", &request.to_args()).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.run_checked("start", &args(&["start", name])).await.map(|_| ())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), EngineError> {
        let secs = grace.as_secs().to_string();
        let output = self.run("stop", &args(&["stop", "-t", &secs, name])).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_missing_object(&stderr) {
            Ok(())
        } else {
            Err(EngineError::classify("stop", &stderr))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let output = self.run("rm", &args(&["rm", "-f", name])).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_missing_object(&stderr) {
            Ok(())
        } else {
            Err(EngineError::classify("rm", &stderr))
        }
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let tail_arg = tail.to_string();
        let output = self
            .run("logs", &args(&["logs", "--tail", &tail_arg, "--timestamps", name]))
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(EngineError::classify("logs", &stderr));
        }
        Ok(merge_log_streams(
            &String::from_utf8_lossy(&output.stdout),
            &stderr,
            tail,
        ))
    }
}

/// 合并 stdout/stderr；两路都带 RFC3339 时间戳前缀，按字典序即时间序
pub fn merge_log_streams(stdout: &str, stderr: &str, tail: usize) -> Vec<String> {
    let mut lines: Vec<String> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect();
    lines.sort();
    let skip = lines.len().saturating_sub(tail);
    lines.split_off(skip)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_ip: String,
    host_port: String,
}

/// 解析 `docker inspect` 输出
pub fn parse_inspect(name: &str, json: &str) -> Result<Option<ContainerState>, EngineError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(json).map_err(|e| EngineError::Parse(e.to_string()))?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    // 从未启动过的容器 StartedAt 是 0001-01-01
    let started_at = entry
        .state
        .started_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0);

    let mut ports = BTreeMap::new();
    if let Some(table) = entry.network_settings.and_then(|n| n.ports) {
        for (container_port, bindings) in table {
            let hosts = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| {
                    if b.host_ip.is_empty() {
                        b.host_port
                    } else {
                        format!("{}:{}", b.host_ip, b.host_port)
                    }
                })
                .collect();
            ports.insert(container_port, hosts);
        }
    }

    let resolved_name = entry.name.trim_start_matches('/').to_string();
    Ok(Some(ContainerState {
        name: if resolved_name.is_empty() {
            name.to_string()
        } else {
            resolved_name
        },
        exists: true,
        running: entry.state.running,
        status: entry.state.status,
        started_at,
        image: Some(entry.config.image),
        ports,
        error: None,
    }))
}
