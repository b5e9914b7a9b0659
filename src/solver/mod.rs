//! 决策服务客户端抽象
//!
//! 决策服务是外部黑盒：输入实体快照与固定目标配置，输出下一步建议。视为无状态且幂等，
//! 每周期对每个实体重新请求，从不缓存。失败以 `SolverError` 表示并携带实体标识。

pub mod http;
pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::SolverError;
use crate::world::Entity;

pub use http::HttpDecisionService;
pub use local::LocalPlanner;

/// 建造动作计划：`start_in_ms` 为资源满足前需等待的时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub item: String,
    #[serde(default)]
    pub target_level: Option<u32>,
    #[serde(default)]
    pub start_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub technology: String,
    #[serde(default)]
    pub start_in_ms: u64,
}

/// 立即执行的下一步（标签联合）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImmediateAction {
    Build(BuildPlan),
    Research(ResearchPlan),
    #[default]
    None,
}

/// 决策服务对单个实体的建议；字段缺失时按默认值解码（唯一的规范化点）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recommendation {
    pub immediate: ImmediateAction,
    /// 当 immediate 为研究时，下一次建造的计划（用于研究/建造优先级比较）
    pub next_build: Option<BuildPlan>,
    pub objective_satisfied: bool,
    pub target_composition: BTreeMap<String, u64>,
}

/// 固定的目标配置：建筑目标等级、兵种目标数量、研究列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfiguration {
    pub buildings: BTreeMap<String, u32>,
    pub units: BTreeMap<String, u64>,
    pub research: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveRequest<'a> {
    pub entity_state: &'a Entity,
    pub target_configuration: &'a TargetConfiguration,
}

#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn recommend(&self, request: &SolveRequest<'_>) -> Result<Recommendation, SolverError>;

    /// 释放连接等资源；关闭后再调用 recommend 应返回错误
    async fn close(&self) {}
}
