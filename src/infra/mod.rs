//! 基础设施模块
//!
//! 封装外部依赖（进程、SSH、docker CLI、HTTP 健康检查）

pub mod command;
pub mod docker;
pub mod health;
pub mod port;
pub mod ssh;

pub use command::{CommandExecutor, ExecError, ExecOutput, LocalExecutor};
pub use docker::{ContainerEngine, CreateRequest, DockerCli, EngineError, PullStream};
pub use health::{HealthProbe, HttpHealthProbe};
pub use port::{PortPreemptor, PreemptionPolicy};
pub use ssh::{ConnectError, RemoteConnector, RemoteSession, SshConnector};
