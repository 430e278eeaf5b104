//! 部署阶段与日志行

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// 部署中的一个阶段（远程部署固定 8 个）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 机器名，如 `pulling_image`
    pub name: String,
    pub display_name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeployStage {
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            duration_ms: None,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn succeed(&mut self, message: Option<String>) {
        self.close(StageStatus::Success, message);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.close(StageStatus::Failed, Some(message.into()));
    }

    fn close(&mut self, status: StageStatus, message: Option<String>) {
        self.status = status;
        self.message = message;
        self.duration_ms = self
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds());
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// 部署日志行，SSE 每行一个事件
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::on(LogStream::Stdout, content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::on(LogStream::Stderr, content)
    }

    fn on(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_records_duration_and_message() {
        let mut stage = DeployStage::new("pulling_image", "Pull Image");
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        stage.fail("manifest unknown");
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.message.as_deref(), Some("manifest unknown"));
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_unstarted_stage_has_no_duration() {
        let mut stage = DeployStage::new("verifying_health", "Verify Health");
        stage.succeed(None);
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.duration_ms.is_none());
    }

    #[test]
    fn test_log_line_serializes_stream() {
        let json = serde_json::to_value(LogLine::stderr("warn")).unwrap();
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["content"], "warn");
    }
}
