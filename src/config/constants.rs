//! 常量

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 9890;

/// 默认 API Key（生产环境必须覆盖）
pub const DEFAULT_API_KEY: &str = "change-me-in-production";

/// 远程部署日志广播容量
pub const DEPLOY_LOG_CAPACITY: usize = 1024;

/// 已完成的远程部署记录保留数量
pub const MAX_FINISHED_DEPLOYMENTS: usize = 50;

/// 日志接口默认返回行数
pub const DEFAULT_LOG_TAIL: usize = 100;

/// 本地命令（硬件探测、端口抢占）超时秒数
pub const LOCAL_COMMAND_TIMEOUT_SECS: u64 = 30;

/// docker CLI 单次调用超时秒数
pub const DOCKER_COMMAND_TIMEOUT_SECS: u64 = 600;

/// 当前版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
