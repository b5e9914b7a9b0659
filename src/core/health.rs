//! 健康检查
//!
//! 对会话做四项相互独立的检查（不短路）：位置是否可识别、是否有遮挡弹窗、期望视图的标记元素是否可见、
//! 是否出现错误/断线/会话过期提示。所有问题累积到 `issues`，`healthy` 当且仅当 `issues` 为空。

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::SessionSection;
use crate::session::Session;

/// 游戏内的视图（用于校验页面停在期望位置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Overview,
    Buildings,
    Research,
    Recruitment,
    Trade,
    Missions,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Overview => "overview",
            View::Buildings => "buildings",
            View::Research => "research",
            View::Recruitment => "recruitment",
            View::Trade => "trade",
            View::Missions => "missions",
        }
    }
}

/// 一次健康检查的结果；创建后不再修改
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub context: BTreeMap<String, Value>,
}

impl HealthCheckResult {
    pub fn from_issues(issues: Vec<String>, context: BTreeMap<String, Value>) -> Self {
        Self {
            healthy: issues.is_empty(),
            issues,
            context,
        }
    }
}

/// 可插拔的健康谓词
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, session: &dyn Session, expected: Option<View>) -> HealthCheckResult;
}

/// 基于 URL 模式与选择器的页面健康检查
pub struct PageHealthChecker {
    url_patterns: Vec<Regex>,
    overlay_selectors: Vec<String>,
    error_selectors: Vec<String>,
    view_markers: HashMap<String, String>,
}

impl PageHealthChecker {
    pub fn new(
        url_patterns: Vec<Regex>,
        overlay_selectors: Vec<String>,
        error_selectors: Vec<String>,
        view_markers: HashMap<String, String>,
    ) -> Self {
        Self {
            url_patterns,
            overlay_selectors,
            error_selectors,
            view_markers,
        }
    }

    /// 从 [session] 配置构建；URL 模式非法时返回错误
    pub fn from_config(cfg: &SessionSection) -> Result<Self, regex::Error> {
        let url_patterns = cfg
            .url_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            url_patterns,
            cfg.overlay_selectors.clone(),
            cfg.error_selectors.clone(),
            cfg.view_markers.clone(),
        ))
    }

    pub fn is_known_location(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|p| p.is_match(url))
    }

    /// 找出第一个可见的选择器；查询失败记为诊断信息而非问题
    async fn first_visible(
        session: &dyn Session,
        selectors: &[String],
        context: &mut BTreeMap<String, Value>,
    ) -> Option<String> {
        for selector in selectors {
            match session.is_visible(selector).await {
                Ok(true) => return Some(selector.clone()),
                Ok(false) => {}
                Err(e) => {
                    context.insert(format!("check_error:{selector}"), Value::String(e.to_string()));
                }
            }
        }
        None
    }
}

#[async_trait]
impl HealthChecker for PageHealthChecker {
    async fn check(&self, session: &dyn Session, expected: Option<View>) -> HealthCheckResult {
        let mut issues = Vec::new();
        let mut context = BTreeMap::new();

        // 1. 位置
        match session.current_url().await {
            Ok(url) => {
                if !self.is_known_location(&url) {
                    issues.push(format!("Unrecognized location: {url}"));
                }
                context.insert("url".to_string(), Value::String(url));
            }
            Err(e) => issues.push(format!("Cannot read location: {e}")),
        }

        // 2. 遮挡弹窗
        if let Some(selector) = Self::first_visible(session, &self.overlay_selectors, &mut context).await {
            issues.push(format!("Blocking overlay visible: {selector}"));
        }

        // 3. 期望视图
        if let Some(view) = expected {
            context.insert("expected_view".to_string(), Value::String(view.as_str().to_string()));
            match self.view_markers.get(view.as_str()) {
                Some(marker) => match session.is_visible(marker).await {
                    Ok(true) => {}
                    Ok(false) => issues.push(format!("Expected view '{}' not visible", view.as_str())),
                    Err(e) => issues.push(format!("Cannot check view '{}': {e}", view.as_str())),
                },
                None => {
                    context.insert(
                        "view_marker".to_string(),
                        Value::String(format!("no marker configured for '{}'", view.as_str())),
                    );
                }
            }
        }

        // 4. 错误 / 断线 / 会话过期
        if let Some(selector) = Self::first_visible(session, &self.error_selectors, &mut context).await {
            issues.push(format!("Error indicator visible: {selector}"));
        }

        HealthCheckResult::from_issues(issues, context)
    }
}

/// 反复执行完整检查直到健康或次数用尽；无论是否收敛都返回最后一次结果
pub async fn wait_for_healthy(
    session: &dyn Session,
    checker: &dyn HealthChecker,
    expected: Option<View>,
    max_attempts: u32,
    delay: Duration,
) -> HealthCheckResult {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = checker.check(session, expected).await;
        if result.healthy || attempt >= max_attempts {
            if !result.healthy {
                tracing::warn!(
                    "Session still unhealthy after {} checks: {:?}",
                    attempt,
                    result.issues
                );
            }
            return result;
        }
        tracing::debug!("Health check {}/{} failed: {:?}", attempt, max_attempts, result.issues);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}
