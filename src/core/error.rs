//! 编排错误类型
//!
//! 周期内的失败分为两类：会话级（位置/登录/健康检查未恢复，短延迟重试）与硬失败（读不到任何实体，长延迟重试）。
//! 决策服务错误单独建模，始终携带实体标识，只影响该实体本周期。

use thiserror::Error;

/// 一次读取 → 求解 → 执行周期中可能出现的错误
#[derive(Error, Debug)]
pub enum BotError {
    /// 页面上没有读到任何实体：说明会话状态无效，而不是世界为空
    #[error("No entities observed")]
    NoEntities,

    #[error("Session unhealthy: {}", .0.join("; "))]
    SessionUnhealthy(Vec<String>),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("UI read failed: {0}")]
    ReadFailed(String),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("Cycle panicked: {0}")]
    Panicked(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl BotError {
    /// 硬失败需要更长的重试延迟，并计入连续失败次数
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            BotError::NoEntities | BotError::Navigation(_) | BotError::Panicked(_)
        )
    }
}

/// 决策服务错误，附带请求它的实体标识
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("decision service failed for entity '{entity}': {message}")]
pub struct SolverError {
    pub entity: String,
    pub message: String,
}

impl SolverError {
    pub fn new(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            message: message.into(),
        }
    }
}
