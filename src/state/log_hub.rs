//! 部署日志中心
//!
//! 每个远程部署一个 broadcast 通道，SSE 订阅者按部署 ID 取用

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::config::constants::DEPLOY_LOG_CAPACITY;
use crate::domain::LogLine;

struct LogChannel {
    sender: broadcast::Sender<LogLine>,
    created_at: DateTime<Utc>,
    finished: bool,
}

/// 部署日志中心
pub struct LogHub {
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 为部署创建日志通道，返回发送端
    pub async fn create(&self, deployment_id: &str) -> broadcast::Sender<LogLine> {
        let (sender, _) = broadcast::channel(DEPLOY_LOG_CAPACITY);
        let mut channels = self.channels.write().await;
        channels.insert(
            deployment_id.to_string(),
            LogChannel {
                sender: sender.clone(),
                created_at: Utc::now(),
                finished: false,
            },
        );
        sender
    }

    /// 订阅部署日志；通道不存在返回 None
    pub async fn subscribe(&self, deployment_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let channels = self.channels.read().await;
        channels.get(deployment_id).map(|c| c.sender.subscribe())
    }

    /// 标记部署结束（通道保留，晚到的订阅者仍能拿到结束信号）
    pub async fn finish(&self, deployment_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(deployment_id) {
            channel.finished = true;
        }
    }

    pub async fn is_finished(&self, deployment_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels
            .get(deployment_id)
            .map(|c| c.finished)
            .unwrap_or(true)
    }

    /// 清理已结束且超过 max_age 的通道
    pub async fn cleanup_expired(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, c| !(c.finished && c.created_at < cutoff));
        before - channels.len()
    }

    pub async fn active_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| !c.finished).count()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_lines() {
        let hub = LogHub::new();
        let sender = hub.create("dep-1").await;
        let mut rx = hub.subscribe("dep-1").await.unwrap();

        sender.send(LogLine::stdout("[1/8] Connect")).unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "[1/8] Connect");
        assert!(hub.subscribe("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_finish_and_cleanup() {
        let hub = LogHub::new();
        hub.create("dep-1").await;
        hub.create("dep-2").await;
        assert_eq!(hub.active_count().await, 2);

        hub.finish("dep-1").await;
        assert!(hub.is_finished("dep-1").await);
        assert!(!hub.is_finished("dep-2").await);
        assert!(hub.is_finished("unknown").await);

        let removed = hub.cleanup_expired(chrono::Duration::seconds(-1)).await;
        assert_eq!(removed, 1);
        assert!(hub.subscribe("dep-1").await.is_none());
        assert_eq!(hub.active_count().await, 1);
    }
}
