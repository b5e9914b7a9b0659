//! 会话监管：生命周期、暂停与连续失败升级
//!
//! 持有 CancellationToken（关闭信号的子 token），Orchestrator 在周期之间检查取消与暂停；
//! 统计连续硬失败的周期数，达到阈值时要求进程级驱动执行完整会话重置。
//! 软失败（未登录、页面不健康）只按短延迟重试：既不计数，也不打断已累积的硬失败序列；只有成功周期清零。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

/// 周期结果的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    SoftFailure,
    HardFailure,
}

/// 记录一个周期结果后的建议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorVerdict {
    Continue,
    /// 连续失败达到阈值，计数已清零
    Escalate,
}

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    paused: AtomicBool,
    consecutive_failures: AtomicU32,
    max_consecutive_failures: u32,
}

impl SessionSupervisor {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self::with_token(CancellationToken::new(), max_consecutive_failures)
    }

    pub fn with_token(cancel_token: CancellationToken, max_consecutive_failures: u32) -> Self {
        Self {
            cancel_token,
            paused: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// 成功清零；软失败不变；硬失败累加，达到阈值返回 Escalate 并清零
    pub fn record_cycle(&self, outcome: CycleOutcome) -> SupervisorVerdict {
        match outcome {
            CycleOutcome::Success => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                return SupervisorVerdict::Continue;
            }
            CycleOutcome::SoftFailure => return SupervisorVerdict::Continue,
            CycleOutcome::HardFailure => {}
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_consecutive_failures {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            SupervisorVerdict::Escalate
        } else {
            SupervisorVerdict::Continue
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::CycleOutcome::{HardFailure, SoftFailure, Success};

    #[test]
    fn test_escalates_after_threshold() {
        let supervisor = SessionSupervisor::new(3);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Continue);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Continue);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Escalate);
        assert_eq!(supervisor.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_counter() {
        let supervisor = SessionSupervisor::new(2);
        supervisor.record_cycle(HardFailure);
        supervisor.record_cycle(Success);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Continue);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Escalate);
    }

    #[test]
    fn test_soft_failures_never_escalate() {
        let supervisor = SessionSupervisor::new(2);
        for _ in 0..10 {
            assert_eq!(supervisor.record_cycle(SoftFailure), SupervisorVerdict::Continue);
        }
        assert_eq!(supervisor.consecutive_failures(), 0);

        // 软失败不打断硬失败序列
        supervisor.record_cycle(HardFailure);
        supervisor.record_cycle(SoftFailure);
        assert_eq!(supervisor.consecutive_failures(), 1);
        assert_eq!(supervisor.record_cycle(HardFailure), SupervisorVerdict::Escalate);
    }

    #[test]
    fn test_pause_and_cancel() {
        let parent = CancellationToken::new();
        let supervisor = SessionSupervisor::with_token(parent.child_token(), 3);
        supervisor.set_paused(true);
        assert!(supervisor.is_paused());
        assert!(!supervisor.is_cancelled());
        parent.cancel();
        assert!(supervisor.is_cancelled());
    }
}
