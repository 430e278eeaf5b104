//! 运行时状态模块
//!
//! 管理应用状态、部署记录和日志通道

pub mod app_state;
pub mod deployments;
pub mod log_hub;

pub use app_state::AppState;
pub use deployments::{DeploymentRecord, DeploymentStatus, DeploymentStore};
pub use log_hub::LogHub;
