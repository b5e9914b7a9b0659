//! 会话上下文：被驱动的浏览器页面
//!
//! `Session` 是对「一个打开的页面/标签页」的不透明句柄，整个进程生命周期内由 Orchestrator 独占持有，
//! 其他组件只借用 `&dyn Session`。具体的选择器抓取与点击由实现方负责（Chrome 实现见 `chrome`）。

#[cfg(feature = "browser")]
pub mod chrome;
pub mod tiers;

use async_trait::async_trait;

#[cfg(feature = "browser")]
pub use chrome::ChromeSession;
pub use tiers::standard_chain;

/// 页面会话的最小操作集；每个方法内部自带超时
#[async_trait]
pub trait Session: Send + Sync {
    /// 当前页面 URL
    async fn current_url(&self) -> anyhow::Result<String>;

    /// 选择器对应元素当前是否可见
    async fn is_visible(&self, selector: &str) -> anyhow::Result<bool>;

    /// 点击选择器对应元素；元素不存在时返回 Ok(false)
    async fn click(&self, selector: &str) -> anyhow::Result<bool>;

    async fn reload(&self) -> anyhow::Result<()>;

    async fn navigate(&self, url: &str) -> anyhow::Result<()>;

    /// 清除 cookie / localStorage 等所有持久化会话数据
    async fn clear_storage(&self) -> anyhow::Result<()>;

    /// 确保已登录；登录流程由实现方提供，返回是否处于已登录状态
    async fn ensure_authenticated(&self) -> anyhow::Result<bool>;

    /// 关闭底层浏览器资源（关闭阶段调用）
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
