//! 远程部署记录
//!
//! 进行中的部署按 ID 保存，结束后移入有界历史

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::constants::MAX_FINISHED_DEPLOYMENTS;
use crate::domain::hardware::HardwareVariant;
use crate::domain::remote::DeploymentResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Succeeded,
    Failed,
}

/// 一次远程部署
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    /// user@host:port
    pub target: String,
    pub requested_gpu_type: Option<HardwareVariant>,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeploymentResult>,
}

impl DeploymentRecord {
    pub fn new(target: String, requested_gpu_type: Option<HardwareVariant>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            requested_gpu_type,
            status: DeploymentStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
        }
    }
}

/// 部署记录存储
pub struct DeploymentStore {
    running: RwLock<HashMap<String, DeploymentRecord>>,
    history: RwLock<VecDeque<DeploymentRecord>>,
    max_history: usize,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FINISHED_DEPLOYMENTS)
    }

    pub fn with_capacity(max_history: usize) -> Self {
        Self {
            running: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    pub async fn create(&self, record: DeploymentRecord) -> String {
        let id = record.id.clone();
        self.running.write().await.insert(id.clone(), record);
        id
    }

    /// 先查进行中，再查历史
    pub async fn get(&self, id: &str) -> Option<DeploymentRecord> {
        if let Some(record) = self.running.read().await.get(id) {
            return Some(record.clone());
        }
        let history = self.history.read().await;
        history.iter().find(|r| r.id == id).cloned()
    }

    /// 写入结果并移入历史
    pub async fn finish(&self, id: &str, result: DeploymentResult) {
        let record = self.running.write().await.remove(id);
        let Some(mut record) = record else {
            tracing::warn!(deployment_id = %id, "Finishing unknown deployment");
            return;
        };

        record.status = if result.success {
            DeploymentStatus::Succeeded
        } else {
            DeploymentStatus::Failed
        };
        record.finished_at = Some(Utc::now());
        record.result = Some(result);

        let mut history = self.history.write().await;
        history.push_front(record);
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// 最近的部署（进行中在前）
    pub async fn recent(&self, limit: usize) -> Vec<DeploymentRecord> {
        let mut records: Vec<DeploymentRecord> =
            self.running.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.extend(self.history.read().await.iter().cloned());
        records.truncate(limit);
        records
    }
}

impl Default for DeploymentStore {
    fn default() -> Self {
        Self::new()
    }
}
