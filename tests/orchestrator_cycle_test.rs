//! 主控循环集成测试：在模拟世界上运行完整的 读取 → 求解 → 执行 周期

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use castellan::config::AppConfig;
use castellan::core::{Orchestrator, OrchestratorBuilder, SessionSupervisor, SolverError};
use castellan::sim::SimulatedWorld;
use castellan::solver::{BuildPlan, DecisionService, ImmediateAction, Recommendation, ResearchPlan, SolveRequest};
use castellan::world::{Entity, ItemState};

const ENTRY: &str = "https://game.example/";

/// 按实体 id 返回预设建议；未预设的实体不做任何事
#[derive(Default)]
struct ScriptedSolver {
    plans: HashMap<String, Result<Recommendation, String>>,
}

impl ScriptedSolver {
    fn plan(mut self, entity: &str, recommendation: Recommendation) -> Self {
        self.plans.insert(entity.to_string(), Ok(recommendation));
        self
    }

    fn fail(mut self, entity: &str, message: &str) -> Self {
        self.plans.insert(entity.to_string(), Err(message.to_string()));
        self
    }
}

#[async_trait]
impl DecisionService for ScriptedSolver {
    async fn recommend(&self, request: &SolveRequest<'_>) -> Result<Recommendation, SolverError> {
        let id = &request.entity_state.id;
        match self.plans.get(id) {
            Some(Ok(rec)) => Ok(rec.clone()),
            Some(Err(message)) => Err(SolverError::new(id.clone(), message.clone())),
            None => Ok(Recommendation::default()),
        }
    }
}

struct PanickingSolver;

#[async_trait]
impl DecisionService for PanickingSolver {
    async fn recommend(&self, _request: &SolveRequest<'_>) -> Result<Recommendation, SolverError> {
        panic!("solver exploded");
    }
}

fn build(item: &str, start_in_ms: u64) -> BuildPlan {
    BuildPlan {
        item: item.to_string(),
        target_level: None,
        start_in_ms,
    }
}

fn build_now(item: &str) -> Recommendation {
    Recommendation {
        immediate: ImmediateAction::Build(build(item, 0)),
        ..Default::default()
    }
}

fn research(technology: &str, start_in_ms: u64, next_build: Option<BuildPlan>) -> Recommendation {
    Recommendation {
        immediate: ImmediateAction::Research(ResearchPlan {
            technology: technology.to_string(),
            start_in_ms,
        }),
        next_build,
        ..Default::default()
    }
}

fn satisfied(composition: &[(&str, u64)]) -> Recommendation {
    Recommendation {
        objective_satisfied: true,
        target_composition: composition.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        ..Default::default()
    }
}

fn castle(id: &str, index: usize) -> Entity {
    Entity::new(id, index)
        .with_item("farm", ItemState::ready(1))
        .with_item("keep", ItemState::ready(1))
}

fn orchestrator(world: &Arc<SimulatedWorld>, solver: impl DecisionService + 'static, config: AppConfig) -> Orchestrator {
    OrchestratorBuilder::new(config)
        .with_solver(Arc::new(solver))
        .build(world.clone(), world.clone(), world.clone())
        .unwrap()
}

fn count_calls(world: &SimulatedWorld, call: &str) -> usize {
    world.calls().iter().filter(|c| c.as_str() == call).count()
}

#[tokio::test(start_paused = true)]
async fn test_building_cycle_upgrades_and_sleeps() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.add_entity(Entity::new("B", 1).with_item("farm", ItemState::upgrading(2, 400_000)));
    let solver = ScriptedSolver::default().plan("A", build_now("farm"));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stats.built, 1);
    assert_eq!(count_calls(&world, "upgrade:0:farm"), 1);
    // A 本周期已操作，只看 B 的计时器
    assert_eq!(result.min_remaining_ms, Some(400_000));
    assert_eq!(result.sleep_ms, Some(100_000));
    assert!(orch.metrics().snapshot().contains_key("build"));
}

#[tokio::test(start_paused = true)]
async fn test_no_entities_is_hard_failure() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("No entities"));
    assert_eq!(result.sleep_ms, Some(AppConfig::default().cycle.hard_failure_retry_ms));
}

#[tokio::test(start_paused = true)]
async fn test_solver_failure_skips_only_that_entity() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.add_entity(castle("B", 1));
    let solver = ScriptedSolver::default()
        .fail("A", "solver unavailable")
        .plan("B", build_now("keep"));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.skipped_entities, 1);
    assert_eq!(result.stats.built, 1);
    assert_eq!(count_calls(&world, "upgrade:1:keep"), 1);
    assert!(!world.calls().iter().any(|c| c.starts_with("upgrade:0")));
}

#[tokio::test(start_paused = true)]
async fn test_research_decided_once_per_cycle() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.add_entity(castle("B", 1));
    let solver = ScriptedSolver::default()
        .plan("A", research("crop_rotation", 0, Some(build("farm", 30_000))))
        .plan("B", research("crop_rotation", 0, Some(build("farm", 30_000))));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.researched, 1);
    assert_eq!(world.researched(), vec!["crop_rotation"]);
    assert_eq!(count_calls(&world, "upgrade:0:farm"), 0);
    assert_eq!(count_calls(&world, "upgrade:1:farm"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_earlier_build_takes_priority_over_research() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    let solver = ScriptedSolver::default().plan("A", research("crop_rotation", 60_000, Some(build("farm", 0))));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.researched, 0);
    assert!(world.researched().is_empty());
    assert_eq!(count_calls(&world, "upgrade:0:farm"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_research_tie_goes_to_build() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    let solver = ScriptedSolver::default().plan("A", research("crop_rotation", 0, Some(build("farm", 0))));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.researched, 0);
    assert!(world.researched().is_empty());
    assert_eq!(count_calls(&world, "upgrade:0:farm"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recruits_only_the_deficit() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.set_counts(0, &[("spearman", 40), ("archer", 50)]);
    let solver = ScriptedSolver::default().plan("A", satisfied(&[("spearman", 100), ("archer", 50)]));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.recruited, 1);
    assert_eq!(count_calls(&world, "recruit:0:spearman:60"), 1);
    assert!(!world.calls().iter().any(|c| c.starts_with("recruit:0:archer")));
    assert_eq!(world.counts_of(0)["spearman"], 100);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_counts_do_not_recruit() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.add_entity(castle("B", 1));
    world.set_counts(0, &[("spearman", 100)]);
    world.fail_next("read_counts", 2);
    let solver = ScriptedSolver::default()
        .plan("A", satisfied(&[("spearman", 100)]))
        .plan("B", build_now("keep"));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stats.unknown_counts, 1);
    assert_eq!(result.stats.built, 1);
    assert!(!world.calls().iter().any(|c| c.starts_with("recruit:") || c.starts_with("trade:")));
    assert_eq!(world.counts_of(0)["spearman"], 100);
}

#[tokio::test(start_paused = true)]
async fn test_trading_and_missions_for_completed_entities() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.set_counts(0, &[("spearman", 100)]);
    let solver = ScriptedSolver::default().plan("A", satisfied(&[("spearman", 100)]));
    let mut config = AppConfig::default();
    config.cycle.missions_enabled = true;
    let orch = orchestrator(&world, solver, config);

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.traded, 1);
    assert_eq!(result.stats.missions, 1);
    let calls = world.calls();
    let trade = calls.iter().position(|c| c == "trade:0").unwrap();
    let missions = calls.iter().position(|c| c == "missions:0").unwrap();
    assert!(trade < missions);
}

#[tokio::test(start_paused = true)]
async fn test_failed_action_retried_once_after_recovery() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.fail_next("upgrade", 1);
    let solver = ScriptedSolver::default().plan("A", build_now("farm"));
    let orch = orchestrator(&world, solver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success);
    assert_eq!(result.stats.built, 1);
    assert_eq!(count_calls(&world, "upgrade:0:farm"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unauthenticated_session_is_soft_failure() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.set_authenticated(false);
    world.set_can_login(false);
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(!result.success);
    assert_eq!(result.sleep_ms, Some(AppConfig::default().cycle.soft_failure_retry_ms));
    assert!(!world.calls().iter().any(|c| c == "read_entities"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_location_navigates_to_entry() {
    let world = Arc::new(SimulatedWorld::new("https://elsewhere.example/lobby"));
    world.add_entity(castle("A", 0));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(world.url(), ENTRY);
    assert_eq!(count_calls(&world, &format!("navigate:{ENTRY}")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_failure_is_hard_failure() {
    let world = Arc::new(SimulatedWorld::new("https://elsewhere.example/lobby"));
    world.add_entity(castle("A", 0));
    world.fail_next("navigate", 10);
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(!result.success);
    assert!(result.hard);
    assert!(result.error.as_deref().unwrap_or_default().contains("Navigation failed"));
    assert_eq!(result.sleep_ms, Some(AppConfig::default().cycle.hard_failure_retry_ms));
    assert!(!world.calls().iter().any(|c| c == "read_entities"));
}

#[tokio::test(start_paused = true)]
async fn test_overlay_dismissed_before_reading() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.add_overlay(".modal.is-open", ".modal.is-open .close");
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(result.success, "{:?}", result.error);
    let calls = world.calls();
    let click = calls.iter().position(|c| c == "click:.modal.is-open .close").unwrap();
    let read = calls.iter().position(|c| c == "read_entities").unwrap();
    assert!(click < read);
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_contained_at_cycle_boundary() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    let orch = orchestrator(&world, PanickingSolver, AppConfig::default());

    let result = orch.run_cycle().await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("solver exploded"));
    assert_eq!(result.sleep_ms, Some(AppConfig::default().cycle.hard_failure_retry_ms));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_trigger_full_reset() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());
    let supervisor = SessionSupervisor::new(3);

    let cycles = orch.run_until(&supervisor, Some(3)).await;

    assert_eq!(cycles, 3);
    assert_eq!(count_calls(&world, "clear_storage"), 1);
    assert_eq!(supervisor.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_soft_failures_never_reset_session() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    world.set_authenticated(false);
    world.set_can_login(false);
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());
    let supervisor = SessionSupervisor::new(3);

    let cycles = orch.run_until(&supervisor, Some(3)).await;

    assert_eq!(cycles, 3);
    assert_eq!(count_calls(&world, "clear_storage"), 0);
    assert_eq!(supervisor.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_timers_force_resync() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(Entity::new("A", 0).with_item("farm", ItemState::upgrading(2, 400_000)));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());
    let supervisor = SessionSupervisor::new(3);

    orch.run_until(&supervisor, Some(1)).await;
    assert_eq!(count_calls(&world, "reload"), 0);

    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(Entity::new("A", 0).with_item("farm", ItemState::upgrading(2, 400_000)));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());
    orch.run_until(&supervisor, Some(2)).await;
    assert_eq!(count_calls(&world, "reload"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_when_cancelled() {
    let world = Arc::new(SimulatedWorld::new(ENTRY));
    world.add_entity(castle("A", 0));
    let orch = orchestrator(&world, ScriptedSolver::default(), AppConfig::default());
    let supervisor = SessionSupervisor::new(3);
    supervisor.cancel();

    assert_eq!(orch.run_until(&supervisor, None).await, 0);
    assert!(world.calls().is_empty());
}
