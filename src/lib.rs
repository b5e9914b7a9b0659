//! Castellan - 浏览器策略游戏自动驾驶
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 轮询与重试、健康检查、逐级恢复、阶段判定、停滞检测、会话监管、主控循环
//! - **observability**: 日志初始化、阶段耗时指标与采样
//! - **session**: 被驱动的页面会话与标准恢复层级（Chrome 实现需 feature "browser"）
//! - **sim**: 内存模拟世界（无浏览器运行与测试）
//! - **solver**: 决策服务抽象、HTTP 客户端与本地规划器
//! - **world**: 实体数据模型与页面读取/操作 trait

pub mod config;
pub mod core;
pub mod observability;
pub mod session;
pub mod sim;
pub mod solver;
pub mod world;

pub use crate::core::{BotError, Orchestrator, OrchestratorBuilder};
