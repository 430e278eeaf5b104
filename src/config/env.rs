//! 环境变量配置加载

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::config::constants::{DEFAULT_API_KEY, DEFAULT_PORT};
use crate::domain::service::DeploymentMode;
use crate::infra::port::PreemptionPolicy;
use crate::services::lifecycle::LifecycleSettings;
use crate::services::remote::RemoteSettings;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// docker 可执行文件
    pub docker_bin: String,
    /// 启用的可选服务
    pub features: Vec<String>,
    pub preferred_mode: Option<DeploymentMode>,
    pub health_poll_interval: Duration,
    pub health_max_attempts: u32,
    pub stop_grace: Duration,
    pub pull_timeout: Duration,
    pub port_preemption: PreemptionPolicy,
    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    pub deploy_timeout: Duration,
    pub monitor_timeout: Duration,
    pub gpu_install_retries: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let lifecycle = LifecycleSettings::default();
        let remote = RemoteSettings::default();
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            port: DEFAULT_PORT,
            docker_bin: "docker".to_string(),
            features: Vec::new(),
            preferred_mode: None,
            health_poll_interval: lifecycle.poll_interval,
            health_max_attempts: lifecycle.max_attempts,
            stop_grace: lifecycle.stop_grace,
            pull_timeout: lifecycle.pull_timeout,
            port_preemption: PreemptionPolicy::Allowlist,
            ssh_connect_timeout: remote.connect_timeout,
            ssh_command_timeout: Duration::from_secs(600),
            deploy_timeout: remote.deploy_timeout,
            monitor_timeout: remote.monitor_timeout,
            gpu_install_retries: remote.gpu_install_retries,
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_key = env::var("CLARA_AGENT_API_KEY").unwrap_or(defaults.api_key);
        if api_key == DEFAULT_API_KEY {
            warn!("CLARA_AGENT_API_KEY is not set, using the default key");
        }

        let features = env::var("CLARA_FEATURES")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        Self {
            api_key,
            port: parse_var("PORT").unwrap_or(defaults.port),
            docker_bin: env::var("CLARA_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            features,
            preferred_mode: parse_var("CLARA_PREFERRED_MODE"),
            health_poll_interval: parse_var("CLARA_HEALTH_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_poll_interval),
            health_max_attempts: parse_var("CLARA_HEALTH_MAX_ATTEMPTS")
                .unwrap_or(defaults.health_max_attempts),
            stop_grace: parse_var("CLARA_STOP_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_grace),
            pull_timeout: parse_var("CLARA_PULL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pull_timeout),
            port_preemption: parse_var("CLARA_PORT_PREEMPTION").unwrap_or(defaults.port_preemption),
            ssh_connect_timeout: parse_var("CLARA_SSH_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ssh_connect_timeout),
            ssh_command_timeout: parse_var("CLARA_SSH_COMMAND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ssh_command_timeout),
            deploy_timeout: parse_var("CLARA_DEPLOY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.deploy_timeout),
            monitor_timeout: parse_var("CLARA_MONITOR_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_timeout),
            gpu_install_retries: parse_var("CLARA_GPU_INSTALL_RETRIES")
                .unwrap_or(defaults.gpu_install_retries),
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            poll_interval: self.health_poll_interval,
            max_attempts: self.health_max_attempts,
            stop_grace: self.stop_grace,
            pull_timeout: self.pull_timeout,
            ..LifecycleSettings::default()
        }
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            connect_timeout: self.ssh_connect_timeout,
            deploy_timeout: self.deploy_timeout,
            monitor_timeout: self.monitor_timeout,
            gpu_install_retries: self.gpu_install_retries,
            ..RemoteSettings::default()
        }
    }
}

/// 解析环境变量，无法解析时告警并返回 None
fn parse_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    parse_value(name, &raw)
}

fn parse_value<T>(name: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = %name, value = %raw, error = %e, "Ignoring invalid environment variable");
            None
        }
    }
}

/// "comfyui, n8n" -> ["comfyui", "n8n"]
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
