//! Headless Chrome 会话
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 是同步 API，所有页面操作都放进 `spawn_blocking`，并用 `tokio::time::timeout` 兜底。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::config::SessionSection;
use crate::session::Session;

/// 选择器可见性判断：存在、有尺寸且未被样式隐藏
fn visibility_script(selector: &str) -> anyhow::Result<String> {
    let quoted = serde_json::to_string(selector)?;
    Ok(format!(
        r#"(() => {{
            const el = document.querySelector({quoted});
            if (!el) return false;
            const rect = el.getBoundingClientRect();
            const style = window.getComputedStyle(el);
            return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';
        }})()"#
    ))
}

const CLEAR_STORAGE_SCRIPT: &str = r#"(() => {
    try { window.localStorage.clear(); } catch (e) {}
    try { window.sessionStorage.clear(); } catch (e) {}
    document.cookie.split(';').forEach(c => {
        const name = c.split('=')[0].trim();
        if (name) document.cookie = name + '=; expires=Thu, 01 Jan 1970 00:00:00 GMT; path=/';
    });
    return true;
})()"#;

pub struct ChromeSession {
    browser: Browser,
    tab: Arc<Tab>,
    cfg: SessionSection,
}

impl ChromeSession {
    /// 启动浏览器并打开入口页
    pub async fn launch(cfg: &SessionSection) -> anyhow::Result<Self> {
        let headless = cfg.headless;
        let entry_url = cfg.entry_url.clone();
        let timeout = Duration::from_millis(cfg.navigation_timeout_ms);

        let (browser, tab) = tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .idle_browser_timeout(Duration::from_secs(3600))
                .build()
                .map_err(|e| anyhow!("invalid launch options: {e}"))?;
            let browser = Browser::new(options).context("Chrome launch failed. Install Chrome/Chromium.")?;
            let tab = browser.new_tab().context("browser tab failed")?;
            tab.set_default_timeout(timeout);
            tab.navigate_to(&entry_url)
                .and_then(|t| t.wait_until_navigated())
                .with_context(|| format!("navigate to {entry_url} failed"))?;
            Ok::<_, anyhow::Error>((browser, tab))
        })
        .await
        .map_err(|e| anyhow!("task join: {e}"))??;

        tracing::info!(url = %cfg.entry_url, headless, "browser session started");
        Ok(Self {
            browser,
            tab,
            cfg: cfg.clone(),
        })
    }

    /// 供页面读取/操作层复用同一个标签页
    pub fn tab(&self) -> Arc<Tab> {
        self.tab.clone()
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.navigation_timeout_ms)
    }

    /// 在阻塞线程池上对标签页执行同步操作，超过导航超时视为失败
    async fn with_tab<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        let timeout = self.navigation_timeout();
        let task = tokio::task::spawn_blocking(move || op(&tab));
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.map_err(|e| anyhow!("task join: {e}"))?,
            Err(_) => Err(anyhow!("browser operation timed out after {:?}", timeout)),
        }
    }
}

#[async_trait]
impl Session for ChromeSession {
    async fn current_url(&self) -> anyhow::Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn is_visible(&self, selector: &str) -> anyhow::Result<bool> {
        let script = visibility_script(selector)?;
        self.with_tab(move |tab| {
            let result = tab.evaluate(&script, false).context("visibility check failed")?;
            Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .await
    }

    async fn click(&self, selector: &str) -> anyhow::Result<bool> {
        if !self.is_visible(selector).await? {
            return Ok(false);
        }
        let selector = selector.to_string();
        self.with_tab(move |tab| {
            let Ok(element) = tab.find_element(&selector) else {
                return Ok(false);
            };
            element.click().with_context(|| format!("click '{selector}' failed"))?;
            Ok(true)
        })
        .await
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.with_tab(|tab| {
            tab.reload(false, None)
                .and_then(|t| t.wait_until_navigated())
                .context("reload failed")?;
            Ok(())
        })
        .await
    }

    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .with_context(|| format!("navigate to {url} failed"))?;
            Ok(())
        })
        .await
    }

    async fn clear_storage(&self) -> anyhow::Result<()> {
        self.with_tab(|tab| {
            tab.evaluate(CLEAR_STORAGE_SCRIPT, false)
                .context("clearing storage failed")?;
            Ok(())
        })
        .await
    }

    async fn ensure_authenticated(&self) -> anyhow::Result<bool> {
        let Some(form) = self.cfg.login_form_selector.clone() else {
            return Ok(true);
        };
        if !self.is_visible(&form).await? {
            return Ok(true);
        }
        let Some(submit) = self.cfg.login_submit_selector.clone() else {
            tracing::warn!("Login form visible but no submit selector configured");
            return Ok(false);
        };
        tracing::info!("Login form visible, submitting stored credentials");
        self.click(&submit).await?;

        let interval = Duration::from_millis(self.cfg.poll_interval_ms.max(1));
        let logged_in = crate::core::poll::poll_until(
            || async { self.is_visible(&form).await.map(|visible| !visible) },
            self.navigation_timeout(),
            interval,
        )
        .await;
        Ok(logged_in)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || tab.close(false).map(|_| ()))
            .await
            .map_err(|e| anyhow!("task join: {e}"))?
            .context("closing tab failed")?;
        tracing::debug!(pid = ?self.browser.get_process_id(), "browser session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_script_quotes_selector() {
        let script = visibility_script(r#"div[data-x="a'b"]"#).unwrap();
        assert!(script.contains(r#"document.querySelector("div[data-x=\"a'b\"]")"#));
    }
}
