//! 本地规划器：未配置远程决策服务时的确定性兜底
//!
//! 选择低于目标等级的最低建筑（同等级按名称）作为下一步；所有建筑达标（含进行中的目标等级）即视为主目标满足，
//! 此时目标兵力即配置中的 units。

use async_trait::async_trait;

use crate::core::SolverError;
use crate::solver::{BuildPlan, DecisionService, ImmediateAction, Recommendation, SolveRequest};

#[derive(Debug, Default)]
pub struct LocalPlanner;

#[async_trait]
impl DecisionService for LocalPlanner {
    async fn recommend(&self, request: &SolveRequest<'_>) -> Result<Recommendation, SolverError> {
        let entity = request.entity_state;
        let target = request.target_configuration;

        let next = target
            .buildings
            .iter()
            .filter_map(|(item, &wanted)| {
                let state = entity.items.get(item);
                let level = state.map(|s| s.level).unwrap_or(0);
                let reached = state
                    .and_then(|s| s.progress.as_ref())
                    .map(|p| p.target_level)
                    .unwrap_or(level);
                (reached < wanted).then_some((level, item))
            })
            .min();

        Ok(match next {
            Some((level, item)) => Recommendation {
                immediate: ImmediateAction::Build(BuildPlan {
                    item: item.clone(),
                    target_level: Some(level + 1),
                    start_in_ms: 0,
                }),
                next_build: None,
                objective_satisfied: false,
                target_composition: Default::default(),
            },
            None => Recommendation {
                immediate: ImmediateAction::None,
                next_build: None,
                objective_satisfied: true,
                target_composition: target.units.clone(),
            },
        })
    }
}
