//! 轮询与重试原语
//!
//! 系统里所有阻塞等待都表达为「对谓词的轮询」而不是固定 sleep：
//! - `poll_until`：谓词为真即返回 true，超时返回 false（由调用方决定超时是否致命）
//! - `poll_for`：取值器产出 Some 即返回该值，超时返回 None
//! - `retry`：有限次数重试，间隔按倍率增长并封顶，耗尽后返回最后一次错误

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// 反复求值 `condition`，直到为真或超过 `timeout`；求值出错视为 false
pub async fn poll_until<F, Fut, E>(mut condition: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    poll_for(
        || {
            let fut = condition();
            async move { fut.await.map(|ok| ok.then_some(())) }
        },
        timeout,
        interval,
    )
    .await
    .is_some()
}

/// 反复调用 `getter`，直到产出值或超过 `timeout`；调用出错视为「暂无值」
pub async fn poll_for<T, F, Fut, E>(mut getter: F, timeout: Duration, interval: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Display,
{
    let deadline = Instant::now() + timeout;
    loop {
        match getter().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => tracing::debug!("poll evaluation failed: {}", e),
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// 重试策略：首次间隔、增长倍率与间隔上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// 第 `attempt` 次失败（从 1 开始）之后应等待的时长
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        let millis = (self.delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// 重试结果：最终结果与实际尝试次数
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// 最多执行 `policy.max_attempts` 次 `action`（至少一次），失败之间按退避等待
pub async fn retry<T, E, F, Fut>(mut action: F, policy: RetryPolicy) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match action().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(e) if attempts >= max_attempts => {
                tracing::debug!("retry exhausted after {} attempts: {}", attempts, e);
                return RetryOutcome {
                    result: Err(e),
                    attempts,
                };
            }
            Err(e) => {
                let wait = policy.delay_after(attempts);
                tracing::debug!(
                    "attempt {}/{} failed ({}), retrying in {}ms",
                    attempts,
                    max_attempts,
                    e,
                    wait.as_millis()
                );
                sleep(wait).await;
            }
        }
    }
}
