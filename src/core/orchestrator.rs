//! 编排器：读取 → 求解 → 执行 主控循环
//!
//! 单个周期：会话保障 → 读取全部实体 → 逐实体请求决策服务 → 按 建造/研究 → 招募 → 交易 →（任务）顺序执行 → 计算休眠时间。
//! 周期边界之下的任何错误或 panic 都不会逃逸：失败被转换为带重试延迟的 `CycleResult`。
//! 周期之间由 `run` 驱动：停滞检测触发强制重新同步，连续硬失败触发完整会话重置。

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use regex::Regex;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::{AppConfig, LoopSection, SessionSection};
use crate::core::health::{wait_for_healthy, HealthChecker, PageHealthChecker};
use crate::core::phase::{determine_phase, Phase, PhaseDecision};
use crate::core::poll::poll_until;
use crate::core::recovery::{escalating_recovery, with_recovery, RecoveryChain, RecoveryResult};
use crate::core::session_supervisor::{CycleOutcome, SessionSupervisor, SupervisorVerdict};
use crate::core::staleness::{check_stale, StateSnapshot};
use crate::core::BotError;
use crate::observability::MetricsRegistry;
use crate::session::tiers::{FULL_SESSION_RESET, RELOAD};
use crate::session::{standard_chain, Session};
use crate::solver::{
    DecisionService, HttpDecisionService, ImmediateAction, LocalPlanner, Recommendation, SolveRequest,
    TargetConfiguration,
};
use crate::world::{Entity, UiActions, UiReader};

/// 一个周期成功执行的动作数（按类别）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionStats {
    pub built: u32,
    pub researched: u32,
    pub recruited: u32,
    pub traded: u32,
    pub missions: u32,
    /// 决策服务失败而跳过的实体数
    pub skipped_entities: u32,
    /// 目标已满足但兵力读取失败、本周期不招募也不交易的实体数
    pub unknown_counts: u32,
}

impl ActionStats {
    pub fn total(&self) -> u32 {
        self.built + self.researched + self.recruited + self.traded + self.missions
    }
}

/// 周期结果：周期与周期之间唯一的契约
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub success: bool,
    /// 失败是否为硬失败（读不到实体、导航失败、panic）
    pub hard: bool,
    pub sleep_ms: Option<u64>,
    pub error: Option<String>,
    pub stats: ActionStats,
    /// 本周期未被操作的实体中最短的剩余时间（停滞检测签名）
    pub min_remaining_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl CycleResult {
    fn failure(error: String, hard: bool, retry_ms: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            hard,
            sleep_ms: Some(retry_ms),
            error: Some(error),
            stats: ActionStats::default(),
            min_remaining_ms: None,
            started_at,
        }
    }

    pub fn outcome(&self) -> CycleOutcome {
        match (self.success, self.hard) {
            (true, _) => CycleOutcome::Success,
            (false, true) => CycleOutcome::HardFailure,
            (false, false) => CycleOutcome::SoftFailure,
        }
    }
}

/// 实体序号 → 兵种 → 数量
type CountsByEntity = BTreeMap<usize, BTreeMap<String, u64>>;

/// 单个实体本周期的求解结果
#[derive(Debug, Clone)]
struct EntityPlan {
    entity: Entity,
    recommendation: Recommendation,
    decision: PhaseDecision,
}

struct CycleReport {
    stats: ActionStats,
    min_remaining_ms: Option<u64>,
    sleep_ms: u64,
}

/// 计算下一周期前的休眠时间，结果总在 [min_sleep_ms, max_sleep_ms] 内
///
/// 剩余时间不超过免费完成阈值时只睡最短时间；否则睡到「剩余时间 - 阈值」，并夹在上下限之间。
/// 没有任何剩余时间时使用默认间隔。
pub fn calculate_sleep_time(min_remaining_ms: Option<u64>, settings: &LoopSection) -> u64 {
    let min = settings.min_sleep_ms;
    let max = settings.max_sleep_ms.max(min);
    match min_remaining_ms {
        None => settings.default_interval_ms.clamp(min, max),
        Some(remaining) if remaining <= settings.free_finish_threshold_ms => min,
        Some(remaining) => (remaining - settings.free_finish_threshold_ms).clamp(min, max),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 编排器：独占持有会话，串行执行周期
pub struct Orchestrator {
    session: Arc<dyn Session>,
    reader: Arc<dyn UiReader>,
    actions: Arc<dyn UiActions>,
    solver: Arc<dyn DecisionService>,
    checker: Arc<dyn HealthChecker>,
    recovery: RecoveryChain,
    locations: Vec<Regex>,
    target: TargetConfiguration,
    settings: LoopSection,
    session_cfg: SessionSection,
    metrics: MetricsRegistry,
    clock_origin: Instant,
}

impl Orchestrator {
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// 关闭阶段使用：返回会话与决策服务句柄以便释放
    pub fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    pub fn solver(&self) -> Arc<dyn DecisionService> {
        self.solver.clone()
    }

    /// 执行一个完整周期；从不 panic、从不返回错误
    pub async fn run_cycle(&self) -> CycleResult {
        let started_at = Utc::now();
        let span = tracing::info_span!("cycle", id = %uuid::Uuid::new_v4());
        let outcome = AssertUnwindSafe(self.cycle_inner())
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    "Cycle done: built={} researched={} recruited={} traded={} missions={} skipped={} unknown_counts={} sleep={}ms",
                    report.stats.built,
                    report.stats.researched,
                    report.stats.recruited,
                    report.stats.traded,
                    report.stats.missions,
                    report.stats.skipped_entities,
                    report.stats.unknown_counts,
                    report.sleep_ms
                );
                CycleResult {
                    success: true,
                    hard: false,
                    sleep_ms: Some(report.sleep_ms),
                    error: None,
                    stats: report.stats,
                    min_remaining_ms: report.min_remaining_ms,
                    started_at,
                }
            }
            Ok(Err(e)) => {
                let retry_ms = if e.is_hard() {
                    self.settings.hard_failure_retry_ms
                } else {
                    self.settings.soft_failure_retry_ms
                };
                tracing::warn!("Cycle failed: {} (retry in {}ms)", e, retry_ms);
                CycleResult::failure(e.to_string(), e.is_hard(), retry_ms, started_at)
            }
            Err(payload) => {
                let err = BotError::Panicked(panic_message(payload.as_ref()));
                tracing::error!("{}", err);
                CycleResult::failure(err.to_string(), true, self.settings.hard_failure_retry_ms, started_at)
            }
        }
    }

    async fn cycle_inner(&self) -> Result<CycleReport, BotError> {
        self.assure_session().await?;
        let (entities, counts) = self.read_world().await?;

        let mut stats = ActionStats::default();
        let plans = self.solve(&entities, counts.as_ref(), &mut stats).await;

        let mut acted = HashSet::new();
        self.execute_building(&plans, &mut stats, &mut acted).await;
        self.execute_recruiting(&plans, &mut stats, &mut acted).await;
        self.execute_trading(&plans, &mut stats, &mut acted).await;
        if self.settings.missions_enabled {
            self.execute_missions(&plans, &mut stats, &mut acted).await;
        }

        let min_remaining_ms = entities
            .iter()
            .filter(|e| !acted.contains(&e.index))
            .filter_map(Entity::min_time_remaining)
            .min();
        let sleep_ms = calculate_sleep_time(min_remaining_ms, &self.settings);
        Ok(CycleReport {
            stats,
            min_remaining_ms,
            sleep_ms,
        })
    }

    fn is_known_location(&self, url: &str) -> bool {
        self.locations.iter().any(|p| p.is_match(url))
    }

    /// 会话保障：校验位置、关闭弹窗、确保登录，每步都包裹在恢复链中
    async fn assure_session(&self) -> Result<(), BotError> {
        let _timer = self.metrics.time("session");
        let session = self.session.as_ref();
        let timeout = Duration::from_millis(self.session_cfg.navigation_timeout_ms);
        let interval = Duration::from_millis(self.session_cfg.poll_interval_ms.max(1));

        let located = with_recovery(
            session,
            "verify-location",
            || async {
                let url = session.current_url().await?;
                if self.is_known_location(&url) {
                    return Ok::<_, anyhow::Error>(true);
                }
                tracing::info!("Unrecognized location {}, navigating to entry", url);
                session.navigate(&self.session_cfg.entry_url).await?;
                let arrived = poll_until(
                    || async { session.current_url().await.map(|u| self.is_known_location(&u)) },
                    timeout,
                    interval,
                )
                .await;
                if arrived {
                    Ok(true)
                } else {
                    Err(anyhow::anyhow!("still at unrecognized location after navigating from {url}"))
                }
            },
            &self.recovery,
            false,
        )
        .await;
        if !located {
            return Err(BotError::Navigation(format!(
                "cannot reach {}",
                self.session_cfg.entry_url
            )));
        }

        let overlays_clear = with_recovery(
            session,
            "dismiss-overlays",
            || async {
                for overlay in &self.session_cfg.overlay_selectors {
                    if !session.is_visible(overlay).await? {
                        continue;
                    }
                    for closer in &self.session_cfg.overlay_close_selectors {
                        session.click(closer).await?;
                    }
                    if session.is_visible(overlay).await? {
                        anyhow::bail!("overlay '{}' still visible", overlay);
                    }
                }
                Ok::<_, anyhow::Error>(true)
            },
            &self.recovery,
            false,
        )
        .await;

        let authenticated = with_recovery(
            session,
            "authenticate",
            || async {
                if session.ensure_authenticated().await? {
                    Ok(true)
                } else {
                    Err(anyhow::anyhow!("not authenticated"))
                }
            },
            &self.recovery,
            false,
        )
        .await;
        if !authenticated {
            return Err(BotError::SessionUnhealthy(vec!["not authenticated".to_string()]));
        }
        if !overlays_clear {
            tracing::debug!("Overlays could not be dismissed, deferring to health check");
        }

        let health = wait_for_healthy(
            session,
            self.checker.as_ref(),
            None,
            self.session_cfg.health_attempts,
            Duration::from_millis(self.session_cfg.health_delay_ms),
        )
        .await;
        if !health.healthy {
            return Err(BotError::SessionUnhealthy(health.issues));
        }
        Ok(())
    }

    /// 读取所有实体与兵力；读不到实体视为硬失败，读不到兵力返回 None（不是零兵力）
    async fn read_world(&self) -> Result<(Vec<Entity>, Option<CountsByEntity>), BotError> {
        let _timer = self.metrics.time("read");
        let session = self.session.as_ref();

        let raw = with_recovery(
            session,
            "read-entities",
            || self.reader.read_entities(),
            &self.recovery,
            Vec::new(),
        )
        .await;
        if raw.is_empty() {
            return Err(BotError::NoEntities);
        }
        let entities: Vec<Entity> = raw
            .into_iter()
            .enumerate()
            .map(|(position, r)| r.normalize(position))
            .collect();

        let counts: Option<CountsByEntity> = with_recovery(
            session,
            "read-counts",
            || async { self.reader.read_counts().await.map(Some) },
            &self.recovery,
            None,
        )
        .await
        .map(|all| all.into_iter().map(|c| (c.index, c.counts)).collect());
        if counts.is_none() {
            tracing::warn!("Unit counts unavailable this cycle");
        }

        tracing::debug!("Read {} entities", entities.len());
        Ok((entities, counts))
    }

    /// 逐实体请求决策服务；单个实体失败只跳过该实体
    ///
    /// 兵力未知的实体只能处于 BUILDING：目标已满足时缺口无法计算，本周期跳过
    async fn solve(
        &self,
        entities: &[Entity],
        counts: Option<&CountsByEntity>,
        stats: &mut ActionStats,
    ) -> Vec<EntityPlan> {
        let _timer = self.metrics.time("solve");
        let unknown = BTreeMap::new();
        let mut plans = Vec::with_capacity(entities.len());
        for entity in entities {
            let request = SolveRequest {
                entity_state: entity,
                target_configuration: &self.target,
            };
            match self.solver.recommend(&request).await {
                Ok(recommendation) => {
                    let current = match counts.and_then(|c| c.get(&entity.index)) {
                        Some(current) => current,
                        None if !recommendation.objective_satisfied => &unknown,
                        None => {
                            tracing::warn!(entity = %entity.id, "unit counts unknown, skipping recruiting and trading");
                            stats.unknown_counts += 1;
                            continue;
                        }
                    };
                    let decision = determine_phase(Some(&recommendation), current);
                    tracing::debug!(entity = %entity.id, phase = ?decision.phase, "phase determined");
                    plans.push(EntityPlan {
                        entity: entity.clone(),
                        recommendation,
                        decision,
                    });
                }
                Err(e) => {
                    tracing::warn!("Skipping entity this cycle: {}", e);
                    stats.skipped_entities += 1;
                }
            }
        }
        plans
    }

    /// 包裹单个 UI 动作：失败走恢复链，最终结果记录为审计日志
    async fn guarded<F, Fut>(&self, action: &str, entity: Option<&str>, call: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let start = Instant::now();
        let ok = with_recovery(self.session.as_ref(), action, call, &self.recovery, false).await;
        let audit = serde_json::json!({
            "event": "ui_action",
            "action": action,
            "entity": entity,
            "ok": ok,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "ui");
        ok
    }

    fn in_phase(plans: &[EntityPlan], phase: Phase) -> impl Iterator<Item = &EntityPlan> {
        plans.iter().filter(move |p| p.decision.phase == phase)
    }

    /// 建造/研究：研究设施全局共享，每周期只对第一个研究建议做一次判断；
    /// 只有研究开始时间早于下一次建造时才研究，同时开始则优先建造
    async fn execute_building(&self, plans: &[EntityPlan], stats: &mut ActionStats, acted: &mut HashSet<usize>) {
        let _timer = self.metrics.time("build");
        let mut research_decided = false;

        for plan in Self::in_phase(plans, Phase::Building) {
            let entity = &plan.entity;
            let rec = &plan.recommendation;
            let build = match &rec.immediate {
                ImmediateAction::Build(build) => Some(build),
                ImmediateAction::Research(research) if !research_decided => {
                    research_decided = true;
                    let research_first = rec
                        .next_build
                        .as_ref()
                        .map_or(true, |b| research.start_in_ms < b.start_in_ms);
                    if research_first {
                        let technology = research.technology.as_str();
                        if self
                            .guarded("research", Some(entity.id.as_str()), || self.actions.research(technology))
                            .await
                        {
                            stats.researched += 1;
                        }
                        None
                    } else {
                        tracing::debug!(
                            "Building takes priority over research '{}' this cycle",
                            research.technology
                        );
                        rec.next_build.as_ref()
                    }
                }
                ImmediateAction::Research(_) => rec.next_build.as_ref(),
                ImmediateAction::None => None,
            };

            let Some(build) = build else { continue };
            if !entity.can_act(&build.item) {
                tracing::debug!(entity = %entity.id, item = %build.item, "upgrade not available yet");
                continue;
            }
            let item = build.item.as_str();
            if self
                .guarded("upgrade", Some(entity.id.as_str()), || self.actions.upgrade(entity.index, item))
                .await
            {
                stats.built += 1;
                acted.insert(entity.index);
            }
        }
    }

    /// 招募：只补足阶段判定算出的缺口
    async fn execute_recruiting(&self, plans: &[EntityPlan], stats: &mut ActionStats, acted: &mut HashSet<usize>) {
        let _timer = self.metrics.time("recruit");
        for plan in Self::in_phase(plans, Phase::Recruiting) {
            let entity = &plan.entity;
            for (item, &amount) in &plan.decision.deficits {
                if self
                    .guarded("recruit", Some(entity.id.as_str()), || self.actions.recruit(entity.index, item, amount))
                    .await
                {
                    stats.recruited += 1;
                    acted.insert(entity.index);
                }
            }
        }
    }

    async fn execute_trading(&self, plans: &[EntityPlan], stats: &mut ActionStats, acted: &mut HashSet<usize>) {
        let _timer = self.metrics.time("trade");
        for plan in Self::in_phase(plans, Phase::Trading) {
            let entity = &plan.entity;
            if self
                .guarded("trade", Some(entity.id.as_str()), || self.actions.trade(entity.index))
                .await
            {
                stats.traded += 1;
                acted.insert(entity.index);
            }
        }
    }

    /// 任务阶段：与交易相同的实体资格
    async fn execute_missions(&self, plans: &[EntityPlan], stats: &mut ActionStats, acted: &mut HashSet<usize>) {
        let _timer = self.metrics.time("missions");
        for plan in Self::in_phase(plans, Phase::Trading) {
            let entity = &plan.entity;
            if self
                .guarded("missions", Some(entity.id.as_str()), || self.actions.run_missions(entity.index))
                .await
            {
                stats.missions += 1;
                acted.insert(entity.index);
            }
        }
    }

    /// 强制重新同步：从 reload 层级开始逐级恢复
    pub async fn resync(&self) -> RecoveryResult {
        escalating_recovery(self.session.as_ref(), &self.recovery.from_tier(RELOAD), None).await
    }

    /// 连续硬失败后的完整会话重置
    pub async fn reset_session(&self) -> RecoveryResult {
        escalating_recovery(self.session.as_ref(), &self.recovery.from_tier(FULL_SESSION_RESET), None).await
    }

    fn snapshot(&self, signature: String) -> StateSnapshot {
        StateSnapshot::new(self.clock_origin.elapsed().as_millis() as u64, signature)
    }

    /// 与上一快照比较；停滞则强制重新同步。返回作为下一次比较基准的快照
    async fn check_progress(
        &self,
        previous: Option<StateSnapshot>,
        result: &CycleResult,
        expected_change_ms: u64,
    ) -> Option<StateSnapshot> {
        let remaining = result.min_remaining_ms?;
        let current = self.snapshot(remaining.to_string());
        let check = check_stale(
            previous.as_ref(),
            &current,
            expected_change_ms,
            self.settings.stale_tolerance,
        );
        if check.is_stale {
            tracing::warn!(
                "World looks stale ({}), forcing resync",
                check.reason.as_deref().unwrap_or("unchanged signature")
            );
            let recovery = self.resync().await;
            if !recovery.success {
                tracing::error!("Forced resync failed");
            }
        }
        Some(current)
    }

    pub async fn run(&self, supervisor: &SessionSupervisor) {
        self.run_until(supervisor, None).await;
    }

    /// 串行执行周期直到取消（或达到 `max_cycles`），返回已执行的周期数
    pub async fn run_until(&self, supervisor: &SessionSupervisor, max_cycles: Option<u64>) -> u64 {
        let token = supervisor.cancel_token();
        let mut previous: Option<StateSnapshot> = None;
        let mut expected_change_ms = self.settings.default_interval_ms;
        let mut cycles = 0u64;

        while !token.is_cancelled() {
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            if supervisor.is_paused() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(self.settings.min_sleep_ms)) => continue,
                }
            }

            let result = self.run_cycle().await;
            cycles += 1;

            if supervisor.record_cycle(result.outcome()) == SupervisorVerdict::Escalate {
                tracing::warn!(
                    "{} consecutive hard failures, resetting session",
                    self.settings.max_consecutive_failures
                );
                let recovery = self.reset_session().await;
                if !recovery.success {
                    tracing::error!("Full session reset failed");
                }
            }

            previous = self.check_progress(previous, &result, expected_change_ms).await;

            let sleep_ms = result.sleep_ms.unwrap_or(self.settings.default_interval_ms);
            expected_change_ms = sleep_ms;
            tracing::info!("Sleeping {}ms before next cycle", sleep_ms);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
        tracing::info!("Orchestrator stopped after {} cycles", cycles);
        cycles
    }
}

/// 编排器构建器：统一的组件装配逻辑
pub struct OrchestratorBuilder {
    config: AppConfig,
    solver: Option<Arc<dyn DecisionService>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self { config, solver: None }
    }

    /// 指定决策服务；未指定时按 [solver] 配置创建 HTTP 客户端，未配置 endpoint 则用本地规划器
    pub fn with_solver(mut self, solver: Arc<dyn DecisionService>) -> Self {
        self.solver = Some(solver);
        self
    }

    fn solver_from_config(&self) -> Result<Arc<dyn DecisionService>, BotError> {
        match HttpDecisionService::from_config(&self.config.solver) {
            Ok(Some(service)) => {
                tracing::info!("Using remote decision service");
                Ok(Arc::new(service))
            }
            Ok(None) => {
                tracing::warn!("No decision service endpoint configured, using local planner");
                Ok(Arc::new(LocalPlanner))
            }
            Err(e) => Err(BotError::ConfigError(format!("decision service: {e}"))),
        }
    }

    pub fn build(
        self,
        session: Arc<dyn Session>,
        reader: Arc<dyn UiReader>,
        actions: Arc<dyn UiActions>,
    ) -> Result<Orchestrator, BotError> {
        let session_cfg = self.config.session.clone();
        let locations = session_cfg
            .url_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BotError::ConfigError(format!("invalid url pattern: {e}")))?;

        let checker: Arc<dyn HealthChecker> = Arc::new(
            PageHealthChecker::from_config(&session_cfg)
                .map_err(|e| BotError::ConfigError(format!("invalid url pattern: {e}")))?,
        );
        let recovery = standard_chain(&session_cfg, checker.clone());
        let solver = match self.solver.clone() {
            Some(solver) => solver,
            None => self.solver_from_config()?,
        };

        Ok(Orchestrator {
            session,
            reader,
            actions,
            solver,
            checker,
            recovery,
            locations,
            target: self.config.target,
            settings: self.config.cycle.normalized(),
            session_cfg,
            metrics: MetricsRegistry::new(),
            clock_origin: Instant::now(),
        })
    }
}
