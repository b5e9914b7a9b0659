//! HTTP 决策服务客户端
//!
//! 显式构造、由 Orchestrator 持有、关闭阶段调用 `close` 释放；没有进程级懒加载单例。
//! 传输层失败按 [solver] 配置重试，最终错误映射为携带实体标识的 SolverError。

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SolverSection;
use crate::core::poll::{retry, RetryPolicy};
use crate::core::SolverError;
use crate::solver::{DecisionService, Recommendation, SolveRequest};

pub struct HttpDecisionService {
    endpoint: String,
    client: RwLock<Option<reqwest::Client>>,
    policy: RetryPolicy,
}

impl HttpDecisionService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client: RwLock::new(Some(client)),
            policy,
        })
    }

    /// 从 [solver] 配置构建；未配置 endpoint 时返回 None
    pub fn from_config(cfg: &SolverSection) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = cfg.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        let policy = RetryPolicy::new(cfg.max_attempts, Duration::from_millis(cfg.retry_delay_ms))
            .with_backoff(2.0, Duration::from_millis(cfg.retry_delay_ms.saturating_mul(8)));
        Self::new(endpoint, Duration::from_secs(cfg.timeout_secs), policy).map(Some)
    }

    fn client(&self) -> Option<reqwest::Client> {
        self.client.read().ok().and_then(|guard| guard.clone())
    }

    async fn post_once(&self, client: &reqwest::Client, request: &SolveRequest<'_>) -> Result<Recommendation, String> {
        let resp = client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, truncate(&body, 200)));
        }
        resp.json::<Recommendation>()
            .await
            .map_err(|e| format!("invalid response: {e}"))
    }
}

#[async_trait]
impl DecisionService for HttpDecisionService {
    async fn recommend(&self, request: &SolveRequest<'_>) -> Result<Recommendation, SolverError> {
        let entity = &request.entity_state.id;
        let client = self
            .client()
            .ok_or_else(|| SolverError::new(entity.as_str(), "client closed"))?;
        let outcome = retry(|| self.post_once(&client, request), self.policy).await;
        if outcome.attempts > 1 {
            tracing::debug!("decision service for '{}' took {} attempts", entity, outcome.attempts);
        }
        outcome.result.map_err(|e| SolverError::new(entity.as_str(), e))
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.client.write() {
            if guard.take().is_some() {
                tracing::info!("Decision service client closed");
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
