//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod container;
pub mod deploy;
pub mod hardware;
pub mod remote;
pub mod service;
pub mod system;

// Re-exports for convenience
pub use container::{ContainerInfo, ContainerState, PullProgress, StartOptions, StartOutcome};
pub use deploy::{DeployStage, LogLine, LogStream, StageStatus};
pub use hardware::{Confidence, Detection, HardwareCapability, HardwareVariant};
pub use remote::{ConnectionTestResult, DeploymentResult, ErrorInfo, FleetReport, RemoteConfig};
pub use service::{DeploymentMode, Platform, ServiceDefinition, ServiceType};
pub use system::{HostInfo, PlatformCompatibility, ServiceCompatibility};
