//! 逐级升级的恢复引擎
//!
//! 恢复动作是启动时声明一次的有序列表，越往后越激进（关弹窗 < 刷新 < 清空会话）。
//! `escalating_recovery` 按声明顺序逐个尝试，第一个成功即停止；每次调用内每个动作至多执行一次。
//! `with_recovery` 是最重要的失败隔离原语：执行一次 → 恢复 → 再执行一次 → 否则返回默认值，永不向上抛错。

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::BotError;
use crate::session::Session;

/// 一个恢复层级：名称在所属列表内唯一
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &str;

    /// 返回 Ok(true) 表示恢复成功；Ok(false) 或 Err 都视为该层失败，进入下一层
    async fn execute(&self, session: &dyn Session) -> anyhow::Result<bool>;
}

/// 有序、不可变的恢复动作列表
#[derive(Clone, Default)]
pub struct RecoveryChain {
    actions: Vec<Arc<dyn RecoveryAction>>,
}

impl std::fmt::Debug for RecoveryChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl RecoveryChain {
    /// 构建列表；名称重复时报配置错误
    pub fn new(actions: Vec<Arc<dyn RecoveryAction>>) -> Result<Self, BotError> {
        let mut seen = HashSet::new();
        for action in &actions {
            if !seen.insert(action.name().to_string()) {
                return Err(BotError::ConfigError(format!(
                    "duplicate recovery action '{}'",
                    action.name()
                )));
            }
        }
        Ok(Self { actions })
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// 从指定层级（含）开始截取后续更激进的层级；名称不存在时返回空列表
    pub fn from_tier(&self, name: &str) -> RecoveryChain {
        let actions = match self.actions.iter().position(|a| a.name() == name) {
            Some(idx) => self.actions[idx..].to_vec(),
            None => Vec::new(),
        };
        Self { actions }
    }
}

/// 恢复结果：是否成功及生效的层级名（全部失败时为 "none"）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_used: String,
}

impl RecoveryResult {
    fn none() -> Self {
        Self {
            success: false,
            strategy_used: "none".to_string(),
        }
    }
}

/// 层级报错时的回调：(层级名, 错误)
pub type FailureHook<'a> = &'a (dyn Fn(&str, &anyhow::Error) + Send + Sync);

/// 按声明顺序逐级尝试恢复，第一个返回 true 的层级结束循环
pub async fn escalating_recovery(
    session: &dyn Session,
    chain: &RecoveryChain,
    on_failure: Option<FailureHook<'_>>,
) -> RecoveryResult {
    for action in &chain.actions {
        let name = action.name();
        match action.execute(session).await {
            Ok(true) => {
                tracing::info!("Recovery succeeded with strategy '{}'", name);
                return RecoveryResult {
                    success: true,
                    strategy_used: name.to_string(),
                };
            }
            Ok(false) => {
                tracing::debug!("Recovery strategy '{}' did not help, escalating", name);
            }
            Err(e) => {
                tracing::warn!("Recovery strategy '{}' failed: {:#}", name, e);
                if let Some(hook) = on_failure {
                    hook(name, &e);
                }
            }
        }
    }
    if !chain.is_empty() {
        tracing::warn!("Recovery chain exhausted ({} strategies)", chain.len());
    }
    RecoveryResult::none()
}

/// 执行一次 `action`；失败则逐级恢复，恢复成功后恰好再执行一次；仍失败返回 `default`
pub async fn with_recovery<T, E, F, Fut>(
    session: &dyn Session,
    label: &str,
    mut action: F,
    chain: &RecoveryChain,
    default: T,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let first_error = match action().await {
        Ok(value) => return value,
        Err(e) => e,
    };
    tracing::warn!("'{}' failed: {}; starting recovery", label, first_error);

    let recovery = escalating_recovery(session, chain, None).await;
    if !recovery.success {
        tracing::warn!("'{}' unrecoverable, using default", label);
        return default;
    }

    match action().await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                "'{}' failed again after '{}' recovery: {}; using default",
                label,
                recovery.strategy_used,
                e
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedWorld;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Outcome {
        Succeed,
        Decline,
        Fail,
    }

    struct ScriptedAction {
        name: &'static str,
        outcome: Outcome,
        calls: AtomicUsize,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedAction {
        fn new(name: &'static str, outcome: Outcome, order: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: AtomicUsize::new(0),
                order: order.clone(),
            })
        }
    }

    #[async_trait]
    impl RecoveryAction for ScriptedAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _session: &dyn Session) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name);
            match self.outcome {
                Outcome::Succeed => Ok(true),
                Outcome::Decline => Ok(false),
                Outcome::Fail => anyhow::bail!("{} blew up", self.name),
            }
        }
    }

    fn world() -> SimulatedWorld {
        SimulatedWorld::new("https://game.example/")
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let dismiss = ScriptedAction::new("dismiss-overlay", Outcome::Decline, &order);
        let reload = ScriptedAction::new("reload", Outcome::Succeed, &order);
        let reset = ScriptedAction::new("full-session-reset", Outcome::Succeed, &order);
        let chain = RecoveryChain::new(vec![dismiss.clone(), reload.clone(), reset.clone()]).unwrap();

        let result = escalating_recovery(&world(), &chain, None).await;

        assert_eq!(
            result,
            RecoveryResult {
                success: true,
                strategy_used: "reload".to_string()
            }
        );
        assert_eq!(reset.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock().unwrap(), vec!["dismiss-overlay", "reload"]);
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_escalated() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = ScriptedAction::new("dismiss-overlay", Outcome::Fail, &order);
        let second = ScriptedAction::new("reload", Outcome::Fail, &order);
        let chain = RecoveryChain::new(vec![first.clone(), second.clone()]).unwrap();
        let reported = Mutex::new(Vec::new());
        let hook = |name: &str, err: &anyhow::Error| {
            reported.lock().unwrap().push(format!("{name}: {err}"));
        };

        let result = escalating_recovery(&world(), &chain, Some(&hook)).await;

        assert!(!result.success);
        assert_eq!(result.strategy_used, "none");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *reported.lock().unwrap(),
            vec!["dismiss-overlay: dismiss-overlay blew up", "reload: reload blew up"]
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = ScriptedAction::new("reload", Outcome::Succeed, &order);
        let b = ScriptedAction::new("reload", Outcome::Succeed, &order);
        assert!(RecoveryChain::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_from_tier_slices_escalation() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = RecoveryChain::new(vec![
            ScriptedAction::new("dismiss-overlay", Outcome::Succeed, &order),
            ScriptedAction::new("reload", Outcome::Succeed, &order),
            ScriptedAction::new("full-session-reset", Outcome::Succeed, &order),
        ])
        .unwrap();
        assert_eq!(chain.from_tier("reload").names(), vec!["reload", "full-session-reset"]);
        assert!(chain.from_tier("missing").is_empty());
    }

    #[tokio::test]
    async fn test_with_recovery_first_try_success_skips_recovery() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let reload = ScriptedAction::new("reload", Outcome::Succeed, &order);
        let chain = RecoveryChain::new(vec![reload.clone()]).unwrap();

        let value = with_recovery(&world(), "read", || async { Ok::<_, String>(7) }, &chain, 0).await;

        assert_eq!(value, 7);
        assert_eq!(reload.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_with_recovery_retries_exactly_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = RecoveryChain::new(vec![ScriptedAction::new("reload", Outcome::Succeed, &order)]).unwrap();
        let calls = Cell::new(0);

        let value = with_recovery(
            &world(),
            "upgrade",
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n == 1 {
                        Err("stale element".to_string())
                    } else {
                        Ok(true)
                    }
                }
            },
            &chain,
            false,
        )
        .await;

        assert!(value);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_with_recovery_returns_default_when_everything_fails() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = RecoveryChain::new(vec![
            ScriptedAction::new("dismiss-overlay", Outcome::Fail, &order),
            ScriptedAction::new("reload", Outcome::Decline, &order),
        ])
        .unwrap();
        let calls = Cell::new(0);

        let value = with_recovery(
            &world(),
            "trade",
            || {
                calls.set(calls.get() + 1);
                async { Err::<u32, _>("boom") }
            },
            &chain,
            42,
        )
        .await;

        assert_eq!(value, 42);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_with_recovery_default_when_retry_fails() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = RecoveryChain::new(vec![ScriptedAction::new("reload", Outcome::Succeed, &order)]).unwrap();
        let calls = Cell::new(0);

        let value = with_recovery(
            &world(),
            "recruit",
            || {
                calls.set(calls.get() + 1);
                async { Err::<bool, _>("still broken") }
            },
            &chain,
            false,
        )
        .await;

        assert!(!value);
        assert_eq!(calls.get(), 2);
    }
}
