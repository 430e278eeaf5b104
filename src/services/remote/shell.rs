//! 远程命令助手
//!
//! 所有远程命令都经过 [`RemoteShell`]：
//! - 提权命令通过 `sudo -S -p ''` 执行，密钥只写入 stdin
//! - 输出中的 sudo 提示行被过滤，密钥被抹去
//! - probe 命令容忍非零退出码，mutating 命令失败时附带 stderr

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::domain::deploy::LogLine;
use crate::infra::command::{CommandExecutor, ExecError, ExecOutput};
use crate::infra::ssh::RemoteSession;

use super::secret::{wipe, SecretSlot};
use super::RemoteError;

/// sudo 交互提示（整行过滤）
const SUDO_PROMPTS: &[&str] = &["[sudo] password for", "Password:", "Sorry, try again"];

/// sudo 拒绝提权的特征
const SUDO_DENIED: &[&str] = &[
    "incorrect password attempt",
    "a password is required",
    "is not in the sudoers file",
    "no tty present",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// 只读探测，非零退出码表示"不存在"
    Probe,
    /// 修改远程状态，非零退出码即失败
    Mutating,
}

/// 一条远程命令
#[derive(Clone, Debug)]
pub struct RemoteCommand {
    pub command: String,
    pub privileged: bool,
    pub kind: CommandKind,
}

impl RemoteCommand {
    pub fn probe(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            privileged: false,
            kind: CommandKind::Probe,
        }
    }

    pub fn mutating(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            privileged: false,
            kind: CommandKind::Mutating,
        }
    }

    /// 以 root 身份执行
    pub fn sudo(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn sudo_if(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

/// 部署日志：同时写 tracing 和可选的广播通道
#[derive(Clone, Default)]
pub struct DeployLog {
    tx: Option<broadcast::Sender<LogLine>>,
}

impl DeployLog {
    pub fn new(tx: broadcast::Sender<LogLine>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    fn send(&self, line: LogLine) {
        if let Some(ref tx) = self.tx {
            // 没有订阅者时丢弃
            let _ = tx.send(line);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "clara_agent::deploy", "{}", message);
        self.send(LogLine::stdout(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "clara_agent::deploy", "{}", message);
        self.send(LogLine::stderr(message));
    }

    /// 远程命令的输出行
    pub fn output(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "clara_agent::deploy", "{}", line);
        self.send(LogLine::stdout(line));
    }
}

/// 单引号转义，用于 `sh -c '<command>'`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_prompt_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    SUDO_PROMPTS.iter().any(|p| trimmed.starts_with(p))
}

fn strip_prompts(text: &str) -> String {
    text.lines()
        .filter(|l| !is_prompt_line(l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 绑定一个远程会话的命令助手
pub struct RemoteShell<'a> {
    session: &'a dyn RemoteSession,
    secret: &'a SecretSlot,
    log: &'a DeployLog,
    is_root: bool,
    docker_sudo: bool,
}

impl<'a> RemoteShell<'a> {
    pub fn new(session: &'a dyn RemoteSession, secret: &'a SecretSlot, log: &'a DeployLog) -> Self {
        Self {
            session,
            secret,
            log,
            is_root: false,
            docker_sudo: false,
        }
    }

    pub fn log(&self) -> &DeployLog {
        self.log
    }

    /// 登录用户是 root 时不再包装 sudo
    pub async fn detect_root(&mut self) -> Result<bool, RemoteError> {
        let out = self.run(&RemoteCommand::probe("id -u")).await?;
        self.is_root = out.success() && out.stdout.trim() == "0";
        Ok(self.is_root)
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn set_docker_sudo(&mut self, required: bool) {
        self.docker_sudo = required;
    }

    pub fn docker_sudo(&self) -> bool {
        self.docker_sudo
    }

    /// docker 子命令，按当前的 docker 访问方式决定是否提权
    pub fn docker(&self, kind: CommandKind, args: &str) -> RemoteCommand {
        RemoteCommand {
            command: format!("docker {}", args),
            privileged: self.docker_sudo,
            kind,
        }
    }

    /// 最终在远端执行的命令行和 stdin
    fn render(&self, cmd: &RemoteCommand) -> (String, Option<Vec<u8>>) {
        if !cmd.privileged || self.is_root {
            return (cmd.command.clone(), None);
        }
        match self.secret.stdin_line() {
            Some(line) => (
                format!("sudo -S -p '' sh -c {}", shell_quote(&cmd.command)),
                Some(line),
            ),
            None => (format!("sudo -n sh -c {}", shell_quote(&cmd.command)), None),
        }
    }

    async fn execute(
        &self,
        cmd: &RemoteCommand,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<ExecOutput, RemoteError> {
        let (line, mut stdin) = self.render(cmd);
        debug!(
            target = %self.session.target(),
            command = %self.secret.redact(&cmd.command),
            privileged = cmd.privileged,
            "Remote command"
        );

        let result = match lines {
            Some(tx) => {
                self.session
                    .exec_streaming(&line, stdin.as_deref(), tx)
                    .await
            }
            None => self.session.exec(&line, stdin.as_deref()).await,
        };
        if let Some(ref mut buf) = stdin {
            wipe(buf);
        }

        let output = result.map_err(|e| match e {
            ExecError::Timeout(_) => RemoteError::CommandTimeout {
                command: self.secret.redact(&cmd.command),
            },
            other => RemoteError::from(other),
        })?;

        if cmd.privileged {
            let lower = output.stderr.to_lowercase();
            if SUDO_DENIED.iter().any(|m| lower.contains(m)) {
                return Err(RemoteError::PrivilegeDenied(
                    self.secret.redact(strip_prompts(&output.stderr).trim()),
                ));
            }
        }

        Ok(ExecOutput {
            stdout: self.secret.redact(&strip_prompts(&output.stdout)),
            stderr: self.secret.redact(&strip_prompts(&output.stderr)),
            exit_code: output.exit_code,
        })
    }

    fn check(&self, cmd: &RemoteCommand, output: ExecOutput) -> Result<ExecOutput, RemoteError> {
        if cmd.kind == CommandKind::Probe || output.success() {
            return Ok(output);
        }
        let stderr = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Err(RemoteError::CommandFailed {
            command: self.secret.redact(&cmd.command),
            exit_code: output.exit_code,
            stderr,
        })
    }

    /// 执行命令；probe 返回原始结果，mutating 非零退出即失败
    pub async fn run(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let output = self.execute(cmd, None).await?;
        self.check(cmd, output)
    }

    /// 执行命令并把输出逐行写入部署日志
    pub async fn run_streaming(&self, cmd: &RemoteCommand) -> Result<ExecOutput, RemoteError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let forward = async {
            while let Some(line) = rx.recv().await {
                if line.trim().is_empty() || is_prompt_line(&line) {
                    continue;
                }
                self.log.output(self.secret.redact(&line));
            }
        };

        let (result, _) = tokio::join!(self.execute(cmd, Some(tx)), forward);
        self.check(cmd, result?)
    }

    /// probe 是否以 0 退出
    pub async fn succeeds(&self, cmd: &RemoteCommand) -> Result<bool, RemoteError> {
        Ok(self.run(cmd).await?.success())
    }
}

// 硬件检测直接在远程会话上运行
#[async_trait]
impl CommandExecutor for RemoteShell<'_> {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        self.session.exec(command, stdin).await
    }

    fn target(&self) -> String {
        self.session.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeHost};
    use crate::domain::remote::RemoteConfig;
    use crate::infra::ssh::RemoteConnector;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("docker ps"), "'docker ps'");
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
    }

    #[test]
    fn test_strip_prompts() {
        let text = "[sudo] password for ubuntu: \nSorry, try again.\nreal output";
        assert_eq!(strip_prompts(text), "real output");
    }

    #[tokio::test]
    async fn test_privileged_command_uses_stdin() {
        let host = FakeHost::new("s3cr3t-pw");
        let connector = FakeConnector::new(host.clone());
        let session = connector
            .connect(&RemoteConfig::new("10.0.0.5", "ubuntu", "s3cr3t-pw"))
            .await
            .unwrap();
        let slot = SecretSlot::new();
        let log = DeployLog::silent();
        let _guard = slot.arm(Some("s3cr3t-pw"));
        let shell = RemoteShell::new(&*session, &slot, &log);

        let out = shell
            .run(&RemoteCommand::mutating("systemctl restart docker").sudo())
            .await
            .unwrap();
        assert!(out.success());

        let sent = host.commands();
        let last = sent.last().unwrap();
        assert!(last.starts_with("sudo -S -p '' sh -c 'systemctl restart docker'"));
        assert!(!last.contains("s3cr3t-pw"));
        assert_eq!(host.last_stdin().unwrap(), b"s3cr3t-pw\n".to_vec());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_privilege_denied() {
        let host = FakeHost::new("correct-pw");
        let connector = FakeConnector::new(host.clone());
        let session = connector
            .connect(&RemoteConfig::new("10.0.0.5", "ubuntu", "correct-pw"))
            .await
            .unwrap();
        let slot = SecretSlot::new();
        let log = DeployLog::silent();
        let _guard = slot.arm(Some("wrong-pw"));
        let shell = RemoteShell::new(&*session, &slot, &log);

        let err = shell
            .run(&RemoteCommand::mutating("systemctl restart docker").sudo())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::PrivilegeDenied(_)));
    }

    #[tokio::test]
    async fn test_mutating_failure_carries_stderr() {
        let host = FakeHost::new("pw");
        let connector = FakeConnector::new(host.clone());
        let session = connector
            .connect(&RemoteConfig::new("10.0.0.5", "ubuntu", "pw"))
            .await
            .unwrap();
        let slot = SecretSlot::new();
        let log = DeployLog::silent();
        let shell = RemoteShell::new(&*session, &slot, &log);

        let probe = shell.run(&RemoteCommand::probe("nvidia-smi")).await.unwrap();
        assert!(!probe.success());

        let err = shell
            .run(&RemoteCommand::mutating("docker pull clara17verse/claracore:cpu"))
            .await
            .unwrap_err();
        match err {
            RemoteError::CommandFailed { stderr, .. } => assert!(!stderr.is_empty()),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
