//! HTTP 健康检查

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// 健康检查策略，GET 返回 2xx 即健康
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, url: &str, timeout: Duration) -> bool;
}

/// reqwest 实现
#[derive(Clone, Debug, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "Health probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        }
    }
}
