//! 端口抢占
//!
//! 本地容器启动前释放知名端口。只杀策略允许的进程，容器引擎自身的
//! 端口转发进程（docker-proxy 等）永远不动。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::service::Platform;
use crate::infra::command::CommandExecutor;

/// 容器引擎的端口转发进程，持有端口说明容器已经在跑
pub const ENGINE_PROCESSES: &[&str] = &[
    "docker-proxy",
    "com.docker.backend",
    "com.docker.vpnkit",
    "dockerd",
    "vpnkit",
    "wslrelay",
];

/// 杀进程后确认端口释放的次数与间隔
const RELEASE_CHECKS: u32 = 5;
const RELEASE_INTERVAL: Duration = Duration::from_millis(200);

/// 抢占策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionPolicy {
    /// 只杀 allowlist 中的进程
    Allowlist,
    /// 杀任何非引擎进程
    Any,
    /// 不抢占
    Off,
}

impl FromStr for PreemptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allowlist" => Ok(PreemptionPolicy::Allowlist),
            "any" => Ok(PreemptionPolicy::Any),
            "off" | "none" => Ok(PreemptionPolicy::Off),
            other => Err(format!("unknown preemption policy: {}", other)),
        }
    }
}

impl fmt::Display for PreemptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreemptionPolicy::Allowlist => "allowlist",
            PreemptionPolicy::Any => "any",
            PreemptionPolicy::Off => "off",
        };
        f.write_str(s)
    }
}

/// 占用端口的进程
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortHolder {
    pub pid: u32,
    pub name: Option<String>,
}

impl PortHolder {
    pub fn is_engine(&self) -> bool {
        self.name.as_deref().map_or(false, |name| {
            let name = name.to_lowercase();
            ENGINE_PROCESSES.iter().any(|p| name.contains(p))
        })
    }
}

/// 抢占结果
#[derive(Clone, Debug, Default, Serialize)]
pub struct PreemptReport {
    pub port: u16,
    pub killed: Vec<PortHolder>,
    /// 抢占后仍占用端口的非引擎进程
    pub blocking: Vec<PortHolder>,
    /// 引擎自己的转发进程
    pub engine_held: bool,
}

impl PreemptReport {
    pub fn is_blocked(&self) -> bool {
        !self.blocking.is_empty()
    }

    /// 给用户的处理建议
    pub fn remediation(&self) -> String {
        let holders: Vec<String> = self
            .blocking
            .iter()
            .map(|h| format!("{} (pid {})", h.name.as_deref().unwrap_or("unknown"), h.pid))
            .collect();
        format!(
            "port {} is held by {}; stop that process or set CLARA_PORT_PREEMPTION=any to let the agent terminate it",
            self.port,
            holders.join(", ")
        )
    }
}

/// 端口抢占器
pub struct PortPreemptor {
    executor: Arc<dyn CommandExecutor>,
    platform: Platform,
    policy: PreemptionPolicy,
    release_interval: Duration,
}

impl PortPreemptor {
    pub fn new(executor: Arc<dyn CommandExecutor>, platform: Platform, policy: PreemptionPolicy) -> Self {
        Self {
            executor,
            platform,
            policy,
            release_interval: RELEASE_INTERVAL,
        }
    }

    pub fn with_release_interval(mut self, interval: Duration) -> Self {
        self.release_interval = interval;
        self
    }

    pub fn policy(&self) -> PreemptionPolicy {
        self.policy
    }

    /// 查询监听端口的进程；探测命令失败视为无人占用
    pub async fn holders(&self, port: u16) -> Vec<PortHolder> {
        let pids = match self.platform {
            Platform::Win32 => match self.executor.exec("netstat -ano -p tcp", None).await {
                Ok(out) => parse_netstat_pids(&out.stdout, port),
                Err(_) => Vec::new(),
            },
            _ => {
                let cmd = format!("lsof -nP -iTCP:{} -sTCP:LISTEN -t", port);
                match self.executor.exec(&cmd, None).await {
                    Ok(out) => parse_lsof_pids(&out.stdout),
                    Err(_) => Vec::new(),
                }
            }
        };

        let mut holders = Vec::with_capacity(pids.len());
        for pid in pids {
            holders.push(PortHolder {
                pid,
                name: self.process_name(pid).await,
            });
        }
        holders
    }

    async fn process_name(&self, pid: u32) -> Option<String> {
        match self.platform {
            Platform::Win32 => {
                let cmd = format!("tasklist /FI \"PID eq {}\" /FO CSV /NH", pid);
                let out = self.executor.exec(&cmd, None).await.ok()?;
                parse_tasklist_name(&out.stdout)
            }
            _ => {
                let cmd = format!("ps -p {} -o comm=", pid);
                let out = self.executor.exec(&cmd, None).await.ok()?;
                out.stdout_if_success().map(|name| {
                    name.rsplit('/').next().unwrap_or(name).to_string()
                })
            }
        }
    }

    fn may_kill(&self, holder: &PortHolder, allowlist: &[String]) -> bool {
        if holder.is_engine() {
            return false;
        }
        match self.policy {
            PreemptionPolicy::Off => false,
            PreemptionPolicy::Any => true,
            PreemptionPolicy::Allowlist => holder.name.as_deref().map_or(false, |name| {
                let name = name.to_lowercase();
                allowlist.iter().any(|allowed| name.contains(&allowed.to_lowercase()))
            }),
        }
    }

    async fn kill(&self, pid: u32) -> bool {
        let cmd = match self.platform {
            Platform::Win32 => format!("taskkill /F /PID {}", pid),
            _ => format!("kill -9 {}", pid),
        };
        matches!(self.executor.exec(&cmd, None).await, Ok(out) if out.success())
    }

    /// 尽力释放端口
    pub async fn preempt(&self, port: u16, allowlist: &[String]) -> PreemptReport {
        let mut report = PreemptReport {
            port,
            ..Default::default()
        };

        for holder in self.holders(port).await {
            if holder.is_engine() {
                report.engine_held = true;
                continue;
            }
            if self.may_kill(&holder, allowlist) && self.kill(holder.pid).await {
                info!(port = port, pid = holder.pid, name = ?holder.name, "Terminated process holding port");
                report.killed.push(holder);
            } else {
                warn!(port = port, pid = holder.pid, name = ?holder.name, policy = %self.policy, "Port holder left running");
                report.blocking.push(holder);
            }
        }

        if !report.killed.is_empty() {
            let killed: Vec<u32> = report.killed.iter().map(|h| h.pid).collect();
            report.blocking.extend(self.wait_released(port, &killed).await);
        }

        report
    }

    /// 等被杀的进程释放端口，返回超出等待仍在监听的那些
    async fn wait_released(&self, port: u16, killed: &[u32]) -> Vec<PortHolder> {
        let mut lingering = Vec::new();
        for attempt in 1..=RELEASE_CHECKS {
            lingering = self
                .holders(port)
                .await
                .into_iter()
                .filter(|h| !h.is_engine() && killed.contains(&h.pid))
                .collect();
            if lingering.is_empty() {
                return lingering;
            }
            debug!(port = port, attempt, "Killed process still holds port");
            if attempt < RELEASE_CHECKS {
                tokio::time::sleep(self.release_interval).await;
            }
        }
        lingering
    }
}

/// 解析 `lsof -t` 输出（每行一个 pid）
pub fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// 解析 `netstat -ano`，取本地地址端口匹配且处于 LISTENING 的 pid
pub fn parse_netstat_pids(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("listening") {
                return None;
            }
            cols[4].parse().ok()
        })
        .filter(|pid| *pid != 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// 解析 `tasklist /FO CSV /NH` 的第一列
pub fn parse_tasklist_name(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| l.starts_with('"'))?;
    let name = line.split("\",\"").next()?.trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    #[test]
    fn test_parse_lsof_pids() {
        assert_eq!(parse_lsof_pids("4121\n4121\n99\n\n"), vec![99, 4121]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn test_parse_netstat_pids() {
        let out = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8091           0.0.0.0:0              LISTENING       5120
  TCP    0.0.0.0:80910          0.0.0.0:0              LISTENING       77
  TCP    127.0.0.1:8091         127.0.0.1:50012        ESTABLISHED     5120
  TCP    [::]:8091              [::]:0                 LISTENING       5120
";
        assert_eq!(parse_netstat_pids(out, 8091), vec![5120]);
    }

    #[test]
    fn test_parse_tasklist_name() {
        assert_eq!(
            parse_tasklist_name("\"llama-server.exe\",\"5120\",\"Console\",\"1\",\"812,332 K\"\r\n"),
            Some("llama-server.exe".to_string())
        );
        assert_eq!(parse_tasklist_name("INFO: No tasks are running"), None);
    }

    #[test]
    fn test_engine_holder_detection() {
        let holder = PortHolder { pid: 1, name: Some("docker-proxy".to_string()) };
        assert!(holder.is_engine());
        let holder = PortHolder { pid: 2, name: Some("python3".to_string()) };
        assert!(!holder.is_engine());
    }

    #[tokio::test]
    async fn test_allowlist_policy_kills_only_listed() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .respond("lsof -nP -iTCP:8091", "300\n301\n")
                .respond("lsof -nP -iTCP:8091", "301\n")
                .respond("ps -p 300", "/usr/local/bin/llama-server\n")
                .respond("ps -p 301", "postgres\n")
                .respond("kill -9 300", ""),
        );
        let preemptor = PortPreemptor::new(exec.clone(), Platform::Linux, PreemptionPolicy::Allowlist);
        let report = preemptor.preempt(8091, &["llama-server".to_string()]).await;

        assert_eq!(report.killed.len(), 1);
        assert_eq!(report.killed[0].pid, 300);
        assert_eq!(report.blocking.len(), 1);
        assert_eq!(report.blocking[0].name.as_deref(), Some("postgres"));
        assert!(!exec.ran("kill -9 301"));
        assert!(report.remediation().contains("postgres (pid 301)"));
    }

    #[tokio::test]
    async fn test_killed_holder_released_after_delay() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .respond("lsof -nP -iTCP:8091", "300\n")
                .respond("lsof -nP -iTCP:8091", "300\n")
                .respond("lsof -nP -iTCP:8091", "300\n")
                .respond("lsof -nP -iTCP:8091", "")
                .respond("ps -p 300", "llama-server\n")
                .respond("kill -9 300", ""),
        );
        let preemptor = PortPreemptor::new(exec.clone(), Platform::Linux, PreemptionPolicy::Allowlist)
            .with_release_interval(Duration::from_millis(1));
        let report = preemptor.preempt(8091, &["llama-server".to_string()]).await;

        assert_eq!(report.killed.len(), 1);
        assert!(!report.is_blocked());
        assert_eq!(exec.count("lsof"), 4);
    }

    #[tokio::test]
    async fn test_killed_holder_that_never_exits_blocks() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .respond("lsof -nP -iTCP:8091", "300\n")
                .respond("ps -p 300", "llama-server\n")
                .respond("kill -9 300", ""),
        );
        let preemptor = PortPreemptor::new(exec.clone(), Platform::Linux, PreemptionPolicy::Allowlist)
            .with_release_interval(Duration::from_millis(1));
        let report = preemptor.preempt(8091, &["llama-server".to_string()]).await;

        assert!(report.is_blocked());
        assert_eq!(report.blocking[0].pid, 300);
        assert_eq!(exec.count("lsof"), 1 + RELEASE_CHECKS as usize);
    }

    #[tokio::test]
    async fn test_engine_process_is_never_killed() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .respond("lsof -nP -iTCP:8091", "42\n")
                .respond("ps -p 42", "docker-proxy\n"),
        );
        let preemptor = PortPreemptor::new(exec.clone(), Platform::Linux, PreemptionPolicy::Any);
        let report = preemptor.preempt(8091, &[]).await;

        assert!(report.engine_held);
        assert!(!report.is_blocked());
        assert!(!exec.ran("kill"));
    }

    #[tokio::test]
    async fn test_off_policy_reports_blocking() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .respond("lsof -nP -iTCP:8091", "300\n")
                .respond("ps -p 300", "llama-server\n"),
        );
        let preemptor = PortPreemptor::new(exec.clone(), Platform::Linux, PreemptionPolicy::Off);
        let report = preemptor.preempt(8091, &["llama-server".to_string()]).await;
        assert!(report.is_blocked());
        assert!(!exec.ran("kill"));
    }
}
