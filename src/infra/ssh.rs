//! SSH 客户端
//!
//! 基于 russh 的远程命令执行：一个连接，多个按顺序打开的 exec 通道。

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::remote::RemoteConfig;
use crate::error::ErrorCode;
use crate::infra::command::{CommandExecutor, ExecError, ExecOutput};

/// 建立连接时的错误
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("failed to connect to {target}: {reason}")]
    Network { target: String, reason: String },
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("no password or private key provided")]
    MissingCredential,
}

impl ErrorCode for ConnectError {
    fn code(&self) -> &'static str {
        match self {
            ConnectError::Timeout { .. } => "connection_timeout",
            ConnectError::Network { .. } => "connection_failed",
            ConnectError::AuthFailed(_) => "auth_failed",
            ConnectError::InvalidKey(_) => "invalid_private_key",
            ConnectError::MissingCredential => "missing_credential",
        }
    }
}

/// 打开远程会话
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &RemoteConfig)
        -> Result<Box<dyn RemoteSession>, ConnectError>;
}

/// 已认证的远程会话
#[async_trait]
pub trait RemoteSession: CommandExecutor {
    /// 断开连接
    async fn close(&self);
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // 部署目标由用户显式给出，不做 known_hosts 校验
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// russh 连接器
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        config: &RemoteConfig,
    ) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let target = config.target();
        info!(target = %target, "Opening SSH session");

        let russh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(900)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let establish = async {
            let mut handle = client::connect(
                russh_config,
                (config.host.as_str(), config.port),
                ClientHandler,
            )
            .await
            .map_err(|e| ConnectError::Network {
                target: target.clone(),
                reason: e.to_string(),
            })?;

            let authenticated = if let Some(ref pem) = config.private_key {
                let key_pair =
                    russh_keys::decode_secret_key(pem, config.private_key_passphrase.as_deref())
                        .map_err(|e| ConnectError::InvalidKey(e.to_string()))?;
                handle
                    .authenticate_publickey(config.username.as_str(), Arc::new(key_pair))
                    .await
            } else if let Some(ref password) = config.password {
                handle
                    .authenticate_password(config.username.as_str(), password.as_str())
                    .await
            } else {
                return Err(ConnectError::MissingCredential);
            };

            match authenticated {
                Ok(true) => Ok(handle),
                Ok(false) => Err(ConnectError::AuthFailed(target.clone())),
                Err(e) => Err(ConnectError::Network {
                    target: target.clone(),
                    reason: e.to_string(),
                }),
            }
        };

        let handle = tokio::time::timeout(self.connect_timeout, establish)
            .await
            .map_err(|_| ConnectError::Timeout {
                target: target.clone(),
                timeout: self.connect_timeout,
            })??;

        info!(target = %target, "SSH session authenticated");

        Ok(Box::new(SshSession {
            handle,
            target,
            command_timeout: self.command_timeout,
        }))
    }
}

/// russh 会话
pub struct SshSession {
    handle: Handle<ClientHandler>,
    target: String,
    command_timeout: Duration,
}

impl SshSession {
    async fn run(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        lines: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<ExecOutput, ExecError> {
        let connection = |e: russh::Error| ExecError::Connection(e.to_string());

        let exchange = async {
            let mut channel = self.handle.channel_open_session().await.map_err(connection)?;
            channel.exec(true, command).await.map_err(connection)?;
            if let Some(input) = stdin {
                channel.data(input).await.map_err(connection)?;
            }
            channel.eof().await.map_err(connection)?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;
            let mut pending = String::new();

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.extend_from_slice(data);
                        if let Some(tx) = lines {
                            pending.push_str(&String::from_utf8_lossy(data));
                            while let Some(pos) = pending.find('\n') {
                                let line: String = pending.drain(..=pos).collect();
                                let _ = tx.send(line.trim_end().to_string());
                            }
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    _ => {}
                }
            }

            if let Some(tx) = lines {
                if !pending.trim().is_empty() {
                    let _ = tx.send(pending.trim_end().to_string());
                }
            }

            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
                exit_code,
            })
        };

        tokio::time::timeout(self.command_timeout, exchange)
            .await
            .map_err(|_| ExecError::Timeout(self.command_timeout))?
    }
}

#[async_trait]
impl CommandExecutor for SshSession {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        debug!(target = %self.target, "Remote exec");
        self.run(command, stdin, None).await
    }

    async fn exec_streaming(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<ExecOutput, ExecError> {
        self.run(command, stdin, Some(&lines)).await
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(target = %self.target, error = %e, "SSH disconnect failed");
        }
    }
}
