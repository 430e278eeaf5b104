//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod hardware;
pub mod lifecycle;
pub mod orchestrator;
pub mod platform;
pub mod registry;
pub mod remote;

pub use hardware::HardwareDetector;
pub use lifecycle::ContainerLifecycleManager;
pub use orchestrator::{OperationResult, ServiceOrchestrator};
pub use registry::ServiceRegistry;
