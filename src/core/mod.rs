//! 编排核心：轮询与重试、健康检查、逐级恢复、阶段判定、停滞检测、会话监管与主控循环

pub mod error;
pub mod health;
pub mod orchestrator;
pub mod phase;
pub mod poll;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod staleness;

pub use error::{BotError, SolverError};
pub use health::{HealthCheckResult, HealthChecker, PageHealthChecker, View};
pub use orchestrator::{calculate_sleep_time, ActionStats, CycleResult, Orchestrator, OrchestratorBuilder};
pub use phase::{determine_phase, Phase, PhaseDecision};
pub use poll::{poll_for, poll_until, retry, RetryOutcome, RetryPolicy};
pub use recovery::{escalating_recovery, with_recovery, RecoveryAction, RecoveryChain, RecoveryResult};
pub use session_supervisor::{CycleOutcome, SessionSupervisor, SupervisorVerdict};
pub use staleness::{check_stale, StaleCheck, StateSnapshot};
