//! 阶段判定状态机
//!
//! 纯函数：由决策服务的建议与当前兵力推导出 BUILDING / RECRUITING / TRADING 之一，每个周期重新计算，
//! 不存储、不增量更新。没有终止状态：建议一旦报告目标未满足，实体立即回到 BUILDING。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::solver::Recommendation;

/// 实体当前适合执行的动作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Building,
    Recruiting,
    Trading,
}

/// 阶段及需要补足的兵种缺口（只含非零项）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseDecision {
    pub phase: Phase,
    pub deficits: BTreeMap<String, u64>,
}

impl PhaseDecision {
    fn building() -> Self {
        Self {
            phase: Phase::Building,
            deficits: BTreeMap::new(),
        }
    }
}

/// 判定阶段：目标未满足 → BUILDING；有缺口 → RECRUITING；否则 → TRADING（含超出目标的情况）
pub fn determine_phase(
    recommendation: Option<&Recommendation>,
    current_counts: &BTreeMap<String, u64>,
) -> PhaseDecision {
    let rec = match recommendation {
        Some(rec) if rec.objective_satisfied => rec,
        _ => return PhaseDecision::building(),
    };

    let deficits: BTreeMap<String, u64> = rec
        .target_composition
        .iter()
        .filter_map(|(item, &target)| {
            let current = current_counts.get(item).copied().unwrap_or(0);
            let deficit = target.saturating_sub(current);
            (deficit > 0).then(|| (item.clone(), deficit))
        })
        .collect();

    let phase = if deficits.is_empty() {
        Phase::Trading
    } else {
        Phase::Recruiting
    };
    PhaseDecision { phase, deficits }
}
