//! 测试替身
//!
//! 不依赖 docker / SSH 的内存实现，只在测试中编译。

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::container::{ContainerState, PullProgress};
use crate::infra::command::{CommandExecutor, ExecError, ExecOutput};
use crate::infra::docker::{ContainerEngine, CreateRequest, EngineError, PullStream};
use crate::infra::health::HealthProbe;

#[derive(Clone)]
enum Reply {
    Output(ExecOutput),
    Connection(String),
    Timeout,
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// 按子串匹配命令并返回预设输出的执行器
///
/// 同一模式多次 `respond` 会依次返回；最后一个回复会被重复使用。
/// 未匹配的命令返回 exit 127。
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<(String, Option<Vec<u8>>)>>,
    arch: Option<String>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arch_hint(mut self, arch: &str) -> Self {
        self.arch = Some(arch.to_string());
        self
    }

    fn push(self, pattern: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.pattern == pattern) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    pattern: pattern.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn respond(self, pattern: &str, stdout: &str) -> Self {
        self.push(pattern, Reply::Output(ExecOutput::ok(stdout)))
    }

    pub fn respond_output(self, pattern: &str, output: ExecOutput) -> Self {
        self.push(pattern, Reply::Output(output))
    }

    pub fn fail_connection(self, pattern: &str) -> Self {
        self.push(pattern, Reply::Connection("channel closed".to_string()))
    }

    pub fn time_out(self, pattern: &str) -> Self {
        self.push(pattern, Reply::Timeout)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// 匹配命令收到的 stdin
    pub fn stdin_for(&self, needle: &str) -> Option<Vec<u8>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.contains(needle))
            .and_then(|(_, stdin)| stdin.clone())
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        self.log
            .lock()
            .unwrap()
            .push((command.to_string(), stdin.map(|s| s.to_vec())));

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| command.contains(&r.pattern))
                .map(|rule| {
                    if rule.replies.len() > 1 {
                        rule.replies.pop_front().unwrap()
                    } else {
                        rule.replies.front().cloned().unwrap()
                    }
                })
        };

        match reply {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Connection(msg)) => Err(ExecError::Connection(msg)),
            Some(Reply::Timeout) => Err(ExecError::Timeout(Duration::from_secs(1))),
            None => Ok(ExecOutput::failed(127, "sh: 1: command not found")),
        }
    }

    fn arch_hint(&self) -> Option<String> {
        self.arch.clone()
    }

    fn target(&self) -> String {
        "scripted".to_string()
    }
}

/// 固定结果的健康检查
pub struct FakeProbe {
    /// 前 N 次返回 false
    unhealthy_for: usize,
    always_down: bool,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self::healthy_after(0)
    }

    pub fn healthy_after(attempts: usize) -> Self {
        Self {
            unhealthy_for: attempts,
            always_down: false,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn down() -> Self {
        Self {
            always_down: true,
            ..Self::healthy()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, url: &str, _timeout: Duration) -> bool {
        self.urls.lock().unwrap().push(url.to_string());
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        !self.always_down && n >= self.unhealthy_for
    }
}

/// 内存中的容器引擎
#[derive(Default)]
pub struct FakeEngine {
    pub unreachable: bool,
    /// 启动后立即退出
    pub exits_on_start: bool,
    pub pull_fails: bool,
    /// 拉取没有任何输出也不结束
    pub pull_hangs: bool,
    /// 挂起拉取的发送端与取消令牌
    pub hung_pulls: Mutex<Vec<(mpsc::Sender<PullProgress>, CancellationToken)>>,
    pub images: Mutex<Vec<String>>,
    pub containers: Mutex<BTreeMap<String, ContainerState>>,
    pub created: Mutex<Vec<CreateRequest>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last_created(&self) -> Option<CreateRequest> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn hung_pull_cancelled(&self) -> bool {
        self.hung_pulls.lock().unwrap().iter().all(|(_, cancel)| cancel.is_cancelled())
    }

    pub fn called(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == op).count()
    }

    fn record(&self, op: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.unreachable {
            Err(EngineError::Unreachable("Cannot connect to the Docker daemon".to_string()))
        } else {
            Ok(())
        }
    }

    fn set_running(&self, name: &str, running: bool) -> Result<(), EngineError> {
        let mut containers = self.containers.lock().unwrap();
        let state = containers.get_mut(name).ok_or_else(|| EngineError::Command {
            op: "start".to_string(),
            stderr: format!("No such container: {}", name),
        })?;
        state.running = running;
        state.status = if running { "running" } else { "exited" }.to_string();
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.record("ping")
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, EngineError> {
        self.record("inspect")?;
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn inspect_raw(&self, name: &str) -> Result<String, EngineError> {
        self.record("inspect_raw")?;
        let containers = self.containers.lock().unwrap();
        let state = containers.get(name).ok_or_else(|| EngineError::Command {
            op: "inspect".to_string(),
            stderr: format!("No such object: {}", name),
        })?;
        Ok(format!("[{{\"State\":{{\"Status\":\"{}\",\"ExitCode\":1}}}}]", state.status))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.record("image_exists")?;
        Ok(self.images.lock().unwrap().iter().any(|i| i == image))
    }

    fn pull(&self, image: &str) -> PullStream {
        self.calls.lock().unwrap().push("pull".to_string());
        if self.pull_hangs {
            let (tx, rx) = mpsc::channel(1);
            let cancel = CancellationToken::new();
            self.hung_pulls.lock().unwrap().push((tx, cancel.clone()));
            return PullStream::new(rx, cancel);
        }
        if self.pull_fails {
            return PullStream::from_events(vec![
                PullProgress::progress("Pulling fs layer"),
                PullProgress::error(format!("manifest for {} not found", image)),
            ]);
        }
        self.images.lock().unwrap().push(image.to_string());
        PullStream::from_events(vec![
            PullProgress::progress("Pulling fs layer"),
            PullProgress::progress("Download complete"),
            PullProgress::complete(format!("pulled {}", image)),
        ])
    }

    async fn create(&self, request: &CreateRequest) -> Result<(), EngineError> {
        self.record("create")?;
        self.created.lock().unwrap().push(request.clone());
        self.containers.lock().unwrap().insert(
            request.name.clone(),
            ContainerState {
                name: request.name.clone(),
                exists: true,
                running: false,
                status: "created".to_string(),
                image: Some(request.image.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.record("start")?;
        let running = !self.exits_on_start;
        self.set_running(name, running)
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), EngineError> {
        self.record("stop")?;
        if self.containers.lock().unwrap().contains_key(name) {
            self.set_running(name, false)?;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.record("remove")?;
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        self.record("logs")?;
        let lines = vec![
            format!("2026-03-01T10:00:00Z {} booting", name),
            "2026-03-01T10:00:01Z error: model directory not found".to_string(),
        ];
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

/// 模拟远程主机的状态
#[derive(Clone, Debug)]
pub struct HostState {
    pub arch: String,
    pub os_release: String,
    pub is_root: bool,
    pub docker_installed: bool,
    /// 登录用户在 docker 组中
    pub docker_group: bool,
    pub nvidia_driver: bool,
    pub toolkit_installed: bool,
    pub runtime_configured: bool,
    pub dev_kfd: bool,
    pub dev_dri: bool,
    pub network_exists: bool,
    /// name -> (image, running)
    pub containers: BTreeMap<String, (String, bool)>,
    pub images: Vec<String>,
    /// 前 N 次 toolkit 安装返回临时性网络错误
    pub transient_failures: usize,
    pub toolkit_broken: bool,
    pub crash_on_run: bool,
    pub health_code: String,
    /// 命中即返回连接错误的命令片段
    pub fail_at: Vec<String>,
    /// 命中即挂起的命令片段
    pub hang_at: Vec<String>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            os_release: "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n"
                .to_string(),
            is_root: false,
            docker_installed: false,
            docker_group: false,
            nvidia_driver: false,
            toolkit_installed: false,
            runtime_configured: false,
            dev_kfd: false,
            dev_dri: false,
            network_exists: false,
            containers: BTreeMap::new(),
            images: Vec::new(),
            transient_failures: 0,
            toolkit_broken: false,
            crash_on_run: false,
            health_code: "200".to_string(),
            fail_at: Vec::new(),
            hang_at: Vec::new(),
        }
    }
}

/// 有状态的远程主机替身，按命令语义更新状态
#[derive(Clone)]
pub struct FakeHost {
    secret: String,
    state: std::sync::Arc<Mutex<HostState>>,
    log: std::sync::Arc<Mutex<Vec<(String, Option<Vec<u8>>)>>>,
    closed: std::sync::Arc<AtomicUsize>,
}

impl FakeHost {
    /// `secret` 是该主机上的 sudo 密码
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            state: Default::default(),
            log: Default::default(),
            closed: Default::default(),
        }
    }

    pub fn configure(self, f: impl FnOnce(&mut HostState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> HostState {
        self.state.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    pub fn last_stdin(&self) -> Option<Vec<u8>> {
        self.log.lock().unwrap().last().and_then(|(_, s)| s.clone())
    }

    pub fn stdins(&self) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, s)| s.clone())
            .collect()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// 解开 `sudo ... sh -c '<cmd>'`，返回内层命令和是否以 root 执行
    fn unwrap_sudo(&self, command: &str, stdin: Option<&[u8]>) -> Result<(String, bool), ExecOutput> {
        let is_root = self.state.lock().unwrap().is_root;
        if let Some(rest) = command.strip_prefix("sudo -S -p '' sh -c ") {
            let expected = format!("{}\n", self.secret);
            if stdin != Some(expected.as_bytes()) {
                return Err(ExecOutput::failed(
                    1,
                    "[sudo] password for ubuntu: \nSorry, try again.\nsudo: 1 incorrect password attempt",
                ));
            }
            return Ok((unquote(rest), true));
        }
        if let Some(rest) = command.strip_prefix("sudo -n sh -c ") {
            if is_root {
                return Ok((unquote(rest), true));
            }
            return Err(ExecOutput::failed(1, "sudo: a password is required"));
        }
        Ok((command.to_string(), is_root))
    }

    fn dispatch(&self, command: &str, elevated: bool) -> ExecOutput {
        let mut s = self.state.lock().unwrap();
        let denied = || ExecOutput::failed(1, "permission denied");

        if let Some(rest) = command.strip_prefix("docker ") {
            if command == "docker --version" {
                return if s.docker_installed {
                    ExecOutput::ok("Docker version 24.0.7, build afdd53b\n")
                } else {
                    ExecOutput::failed(127, "sh: 1: docker: not found")
                };
            }
            if !s.docker_installed {
                return ExecOutput::failed(127, "sh: 1: docker: not found");
            }
            if !(elevated || s.docker_group) {
                return ExecOutput::failed(
                    1,
                    "permission denied while trying to connect to the Docker daemon socket",
                );
            }
            return docker_command(&mut s, rest);
        }

        match command {
            "uname -m" => ExecOutput::ok(format!("{}\n", s.arch)),
            "id -u" => ExecOutput::ok(if s.is_root { "0\n" } else { "1000\n" }),
            "cat /etc/os-release" => ExecOutput::ok(s.os_release.clone()),
            "cat /proc/cpuinfo" => ExecOutput::ok("processor\t: 0\nmodel name\t: AMD EPYC 7B13 64-Core Processor\n"),
            "nvidia-smi --query-gpu=name --format=csv,noheader" if s.nvidia_driver => {
                ExecOutput::ok("NVIDIA GeForce RTX 4090\n")
            }
            "nvidia-smi" if s.nvidia_driver => ExecOutput::ok(
                "| NVIDIA-SMI 550.54.14    Driver Version: 550.54.14    CUDA Version: 12.4 |\n",
            ),
            "nvidia-ctk --version" if s.toolkit_installed => {
                ExecOutput::ok("NVIDIA Container Toolkit CLI version 1.14.3\n")
            }
            "ls /dev/kfd" if s.dev_kfd => ExecOutput::ok("/dev/kfd\n"),
            "ls /dev/dri" if s.dev_dri => ExecOutput::ok("card0\nrenderD128\n"),
            "systemctl enable --now docker" | "systemctl start docker" | "systemctl restart docker" => {
                if elevated {
                    ExecOutput::ok("")
                } else {
                    denied()
                }
            }
            c if c.contains("get.docker.com") => {
                if !elevated {
                    return denied();
                }
                s.docker_installed = true;
                ExecOutput::ok("# Executing docker install script\n+ apt-get install -y docker-ce\n")
            }
            c if c.contains("install -y nvidia-container-toolkit") => {
                if s.transient_failures > 0 {
                    s.transient_failures -= 1;
                    return ExecOutput::failed(
                        100,
                        "curl: (6) Could not resolve host: nvidia.github.io\nTemporary failure resolving 'nvidia.github.io'",
                    );
                }
                if s.toolkit_broken {
                    return ExecOutput::failed(100, "E: Unable to locate package nvidia-container-toolkit");
                }
                if !elevated {
                    return denied();
                }
                s.toolkit_installed = true;
                ExecOutput::ok("Setting up nvidia-container-toolkit (1.14.3-1) ...\n")
            }
            c if c.starts_with("nvidia-ctk runtime configure") => {
                if !elevated {
                    return denied();
                }
                s.runtime_configured = true;
                ExecOutput::ok("INFO Wrote updated config to /etc/docker/daemon.json\n")
            }
            c if c.starts_with("usermod") => {
                if elevated {
                    ExecOutput::ok("")
                } else {
                    denied()
                }
            }
            c if c.starts_with("curl -s -o /dev/null") => {
                let up = s.containers.values().any(|(_, running)| *running);
                if up {
                    ExecOutput::ok(s.health_code.clone())
                } else {
                    ExecOutput {
                        stdout: "000".to_string(),
                        stderr: String::new(),
                        exit_code: Some(7),
                    }
                }
            }
            _ => ExecOutput::failed(127, "sh: 1: command not found"),
        }
    }
}

fn unquote(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(quoted);
    inner.replace(r"'\''", "'")
}

fn docker_command(s: &mut HostState, args: &str) -> ExecOutput {
    let words: Vec<&str> = args.split_whitespace().collect();
    match words.as_slice() {
        ["info", "--format", ..] => ExecOutput::ok(if s.runtime_configured {
            "{\"nvidia\":{\"path\":\"nvidia-container-runtime\"},\"runc\":{\"path\":\"runc\"}}\n"
        } else {
            "{\"runc\":{\"path\":\"runc\"}}\n"
        }),
        ["info"] => ExecOutput::ok("Server Version: 24.0.7\n"),
        ["network", "inspect", _] => {
            if s.network_exists {
                ExecOutput::ok("[{\"Name\":\"clara_network\"}]\n")
            } else {
                ExecOutput::failed(1, "Error response from daemon: network clara_network not found")
            }
        }
        ["network", "create", _] => {
            s.network_exists = true;
            ExecOutput::ok("f1e2d3c4b5a6\n")
        }
        ["rm", "-f", name] => match s.containers.remove(*name) {
            Some(_) => ExecOutput::ok(format!("{}\n", name)),
            None => ExecOutput::failed(1, format!("Error: No such container: {}", name)),
        },
        ["pull", image] => {
            s.images.push(image.to_string());
            let tag = image.rsplit(':').next().unwrap_or("latest");
            ExecOutput::ok(format!(
                "{}: Pulling from clara17verse/claracore\nDigest: sha256:4f5e\nStatus: Downloaded newer image for {}\n",
                tag, image
            ))
        }
        ["run", ..] => {
            let name = words
                .iter()
                .position(|w| *w == "--name")
                .and_then(|i| words.get(i + 1))
                .map(|n| n.to_string())
                .unwrap_or_default();
            let image = words.last().map(|i| i.to_string()).unwrap_or_default();
            if !s.images.contains(&image) {
                return ExecOutput::failed(125, format!("Unable to find image '{}' locally", image));
            }
            if args.contains("--gpus") && !s.runtime_configured {
                return ExecOutput::failed(
                    125,
                    "docker: Error response from daemon: could not select device driver \"\" with capabilities: [[gpu]].",
                );
            }
            let running = !s.crash_on_run;
            s.containers.insert(name, (image, running));
            ExecOutput::ok("9f8e7d6c5b4a\n")
        }
        ["ps", "--filter", filter, ..] => {
            let name = filter
                .trim_start_matches("name=^")
                .trim_end_matches('$');
            match s.containers.get(name) {
                Some((_, true)) => ExecOutput::ok(format!("{}\n", name)),
                _ => ExecOutput::ok(""),
            }
        }
        ["ps", "-a", ..] => {
            let lines: Vec<String> = s
                .containers
                .iter()
                .map(|(name, (image, running))| {
                    if *running {
                        format!("{}|{}|Up 5 minutes|0.0.0.0:5890->5890/tcp", name, image)
                    } else {
                        format!("{}|{}|Exited (1) 3 seconds ago|", name, image)
                    }
                })
                .collect();
            ExecOutput::ok(lines.join("\n"))
        }
        ["logs", "--tail", _, _] => ExecOutput {
            stdout: "loading models from /app/models\n".to_string(),
            stderr: "fatal: model directory not found\n".to_string(),
            exit_code: Some(0),
        },
        ["inspect", name] => match s.containers.get(*name) {
            Some((_, running)) => ExecOutput::ok(format!(
                "[{{\"Name\":\"/{}\",\"State\":{{\"Running\":{},\"ExitCode\":{}}}}}]",
                name,
                running,
                if *running { 0 } else { 1 }
            )),
            None => ExecOutput::failed(1, format!("Error: No such object: {}", name)),
        },
        _ => ExecOutput::failed(1, format!("unknown docker command: {}", args)),
    }
}

/// [`FakeHost`] 上的会话
pub struct FakeSession {
    host: FakeHost,
}

#[async_trait]
impl CommandExecutor for FakeSession {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        self.host
            .log
            .lock()
            .unwrap()
            .push((command.to_string(), stdin.map(|s| s.to_vec())));

        let (fail, hang) = {
            let s = self.host.state.lock().unwrap();
            (
                s.fail_at.iter().any(|p| command.contains(p.as_str())),
                s.hang_at.iter().any(|p| command.contains(p.as_str())),
            )
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if fail {
            return Err(ExecError::Connection("connection reset by peer".to_string()));
        }

        let (inner, elevated) = match self.host.unwrap_sudo(command, stdin) {
            Ok(parts) => parts,
            Err(denied) => return Ok(denied),
        };
        Ok(self.host.dispatch(&inner, elevated))
    }

    fn target(&self) -> String {
        "ubuntu@10.0.0.5:22".to_string()
    }
}

#[async_trait]
impl crate::infra::ssh::RemoteSession for FakeSession {
    async fn close(&self) {
        self.host.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// 返回 [`FakeSession`] 的连接器
pub struct FakeConnector {
    host: FakeHost,
    pub refuse: bool,
    pub reject_auth: bool,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(host: FakeHost) -> Self {
        Self {
            host,
            refuse: false,
            reject_auth: false,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn refusing(host: FakeHost) -> Self {
        Self {
            refuse: true,
            ..Self::new(host)
        }
    }

    pub fn rejecting_auth(host: FakeHost) -> Self {
        Self {
            reject_auth: true,
            ..Self::new(host)
        }
    }
}

#[async_trait]
impl crate::infra::ssh::RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        config: &crate::domain::remote::RemoteConfig,
    ) -> Result<Box<dyn crate::infra::ssh::RemoteSession>, crate::infra::ssh::ConnectError> {
        use crate::infra::ssh::ConnectError;

        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(ConnectError::Network {
                target: config.target(),
                reason: "Connection refused (os error 111)".to_string(),
            });
        }
        if self.reject_auth {
            return Err(ConnectError::AuthFailed(config.target()));
        }
        Ok(Box::new(FakeSession {
            host: self.host.clone(),
        }))
    }
}

/// 用内存替身组装的编排器（本地 docker 可用，远程主机由 `host` 扮演）
pub fn fake_orchestrator(
    platform: crate::domain::service::Platform,
    engine: std::sync::Arc<FakeEngine>,
    host: FakeHost,
) -> crate::services::ServiceOrchestrator {
    use crate::infra::port::PreemptionPolicy;
    use crate::services::lifecycle::LifecycleSettings;
    use crate::services::orchestrator::{Backends, OrchestratorSettings};
    use crate::services::remote::RemoteSettings;
    use std::sync::Arc;

    let executor = Arc::new(
        ScriptedExecutor::new()
            .respond("uname -m", "x86_64\n")
            .respond("docker --version", "Docker version 24.0.7, build afdd53b\n"),
    );
    crate::services::ServiceOrchestrator::new(
        crate::services::ServiceRegistry::builtin(),
        Backends {
            engine,
            probe: Arc::new(FakeProbe::healthy()),
            executor,
            connector: Arc::new(FakeConnector::new(host)),
        },
        OrchestratorSettings {
            lifecycle: LifecycleSettings {
                platform,
                poll_interval: Duration::from_millis(1),
                max_attempts: 3,
                stop_grace: Duration::from_secs(1),
                restart_delay: Duration::from_millis(1),
                diagnostic_tail: 20,
                pull_timeout: Duration::from_secs(5),
            },
            remote: RemoteSettings {
                settle: Duration::ZERO,
                retry_backoff: Duration::ZERO,
                ..RemoteSettings::default()
            },
            preemption: PreemptionPolicy::Allowlist,
        },
    )
}
