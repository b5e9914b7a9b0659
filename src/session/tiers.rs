//! 标准恢复层级
//!
//! 启动时按固定顺序注册：dismiss-overlay → wait-and-retry → reload → navigate-to-entry → full-session-reset。
//! 新增层级只需在列表中追加一个实现了 `RecoveryAction` 的类型。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SessionSection;
use crate::core::health::HealthChecker;
use crate::core::poll::poll_until;
use crate::core::recovery::{RecoveryAction, RecoveryChain};
use crate::session::Session;

pub const DISMISS_OVERLAY: &str = "dismiss-overlay";
pub const WAIT_AND_RETRY: &str = "wait-and-retry";
pub const RELOAD: &str = "reload";
pub const NAVIGATE_TO_ENTRY: &str = "navigate-to-entry";
pub const FULL_SESSION_RESET: &str = "full-session-reset";

/// 轮询直到健康检查通过
async fn settle(session: &dyn Session, checker: &dyn HealthChecker, timeout: Duration, interval: Duration) -> bool {
    poll_until(
        || async { Ok::<_, Infallible>(checker.check(session, None).await.healthy) },
        timeout,
        interval,
    )
    .await
}

/// 关闭可见的遮挡弹窗；没有弹窗时返回 false（交给下一层）
pub struct DismissOverlay {
    overlays: Vec<String>,
    closers: Vec<String>,
}

#[async_trait]
impl RecoveryAction for DismissOverlay {
    fn name(&self) -> &str {
        DISMISS_OVERLAY
    }

    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool> {
        let mut visible = Vec::new();
        for overlay in &self.overlays {
            if session.is_visible(overlay).await? {
                visible.push(overlay.as_str());
            }
        }
        if visible.is_empty() {
            return Ok(false);
        }
        tracing::debug!("Dismissing overlays: {:?}", visible);
        for closer in &self.closers {
            session.click(closer).await?;
        }
        for overlay in visible {
            if session.is_visible(overlay).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// 等待页面稳定后再检查一次健康状态
pub struct WaitAndRetry {
    wait: Duration,
    checker: Arc<dyn HealthChecker>,
}

#[async_trait]
impl RecoveryAction for WaitAndRetry {
    fn name(&self) -> &str {
        WAIT_AND_RETRY
    }

    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool> {
        tokio::time::sleep(self.wait).await;
        Ok(self.checker.check(session, None).await.healthy)
    }
}

pub struct Reload {
    checker: Arc<dyn HealthChecker>,
    timeout: Duration,
    interval: Duration,
}

#[async_trait]
impl RecoveryAction for Reload {
    fn name(&self) -> &str {
        RELOAD
    }

    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool> {
        session.reload().await?;
        Ok(settle(session, self.checker.as_ref(), self.timeout, self.interval).await)
    }
}

pub struct NavigateToEntry {
    entry_url: String,
    checker: Arc<dyn HealthChecker>,
    timeout: Duration,
    interval: Duration,
}

#[async_trait]
impl RecoveryAction for NavigateToEntry {
    fn name(&self) -> &str {
        NAVIGATE_TO_ENTRY
    }

    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool> {
        session.navigate(&self.entry_url).await?;
        Ok(settle(session, self.checker.as_ref(), self.timeout, self.interval).await)
    }
}

/// 清空所有持久化会话数据后重新进入并登录
pub struct FullSessionReset {
    entry_url: String,
    checker: Arc<dyn HealthChecker>,
    timeout: Duration,
    interval: Duration,
}

#[async_trait]
impl RecoveryAction for FullSessionReset {
    fn name(&self) -> &str {
        FULL_SESSION_RESET
    }

    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool> {
        tracing::warn!("Performing full session reset");
        session.clear_storage().await?;
        session.navigate(&self.entry_url).await?;
        if !session.ensure_authenticated().await? {
            anyhow::bail!("re-authentication failed after session reset");
        }
        Ok(settle(session, self.checker.as_ref(), self.timeout, self.interval).await)
    }
}

/// 按规范顺序构建标准恢复链
pub fn standard_chain(cfg: &SessionSection, checker: Arc<dyn HealthChecker>) -> RecoveryChain {
    let timeout = Duration::from_millis(cfg.navigation_timeout_ms);
    let interval = Duration::from_millis(cfg.poll_interval_ms.max(1));
    let actions: Vec<Arc<dyn RecoveryAction>> = vec![
        Arc::new(DismissOverlay {
            overlays: cfg.overlay_selectors.clone(),
            closers: cfg.overlay_close_selectors.clone(),
        }),
        Arc::new(WaitAndRetry {
            wait: Duration::from_millis(cfg.settle_wait_ms),
            checker: checker.clone(),
        }),
        Arc::new(Reload {
            checker: checker.clone(),
            timeout,
            interval,
        }),
        Arc::new(NavigateToEntry {
            entry_url: cfg.entry_url.clone(),
            checker: checker.clone(),
            timeout,
            interval,
        }),
        Arc::new(FullSessionReset {
            entry_url: cfg.entry_url.clone(),
            checker,
            timeout,
            interval,
        }),
    ];
    // 名称为常量且互不相同
    RecoveryChain::new(actions).unwrap_or_default()
}
