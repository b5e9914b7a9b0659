//! 优雅关闭
//!
//! 信号到达时取消 token：编排器在当前周期结束后退出，随后按注册顺序释放决策服务与浏览器会话。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::Session;
use crate::solver::DecisionService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 持有根取消 token 与首个关闭原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编排器与采样任务使用其子 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只记录第一次的原因；重复信号不改变已开始的关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, finishing current cycle");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, finishing current cycle");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Box::new(task));
    }

    /// 执行所有清理任务，返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        match self.manager.reason() {
            Some(reason) => tracing::info!(?reason, "Shutting down, {} cleanup tasks", self.cleanup_tasks.len()),
            None => tracing::info!("Orchestrator finished, {} cleanup tasks", self.cleanup_tasks.len()),
        }

        let mut completed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed", name);
                    completed += 1;
                }
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout),
            }
        }
        completed
    }
}

/// 决策服务清理：关闭 HTTP 客户端
pub struct DecisionServiceCleanup {
    service: Arc<dyn DecisionService>,
}

impl DecisionServiceCleanup {
    pub fn new(service: Arc<dyn DecisionService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for DecisionServiceCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.service.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DecisionService"
    }
}

/// 会话清理：关闭浏览器
pub struct SessionCleanup {
    session: Arc<dyn Session>,
}

impl SessionCleanup {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.session.close().await
    }

    fn name(&self) -> &'static str {
        "Session"
    }
}
