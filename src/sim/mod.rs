//! 内存模拟世界
//!
//! 同时实现 `Session`、`UiReader`、`UiActions`：未配置浏览器时供主程序运行，也用于测试。
//! 支持注入失败（`fail_next`）、弹窗、错误横幅与计时器推进（`advance`），并记录所有调用。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::session::Session;
use crate::world::{Entity, EntityCounts, ItemState, Progress, RawEntity, UiActions, UiReader};

/// 每次升级在模拟世界中耗费的时间
pub const SIM_BUILD_TIME_MS: u64 = 600_000;

#[derive(Debug)]
struct SimState {
    url: String,
    /// 瞬时可见元素（刷新/导航后消失）
    visible: HashSet<String>,
    /// 关闭按钮 → 对应弹窗
    closers: HashMap<String, String>,
    authenticated: bool,
    can_login: bool,
    entities: Vec<Entity>,
    counts: BTreeMap<usize, BTreeMap<String, u64>>,
    researched: Vec<String>,
    failures: HashMap<String, usize>,
    calls: Vec<String>,
}

#[derive(Debug)]
pub struct SimulatedWorld {
    state: Mutex<SimState>,
}

impl SimulatedWorld {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(SimState {
                url: url.into(),
                visible: HashSet::new(),
                closers: HashMap::new(),
                authenticated: true,
                can_login: true,
                entities: Vec::new(),
                counts: BTreeMap::new(),
                researched: Vec::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// 用少量起始实体构建一个可直接运行的演示世界
    pub fn demo(entry_url: &str) -> Self {
        let world = Self::new(entry_url);
        for (i, name) in ["Castle Aldmoor", "Castle Brenwick"].iter().enumerate() {
            world.add_entity(
                Entity::new(*name, i)
                    .with_item("farm", ItemState::ready(1))
                    .with_item("keep", ItemState::ready(1))
                    .with_item("barracks", ItemState::ready(0)),
            );
        }
        world
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // 测试中的 panic 不应让后续断言全部失败
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 记录调用并消耗一次注入的失败
    fn enter(&self, op: &str, call: String) -> anyhow::Result<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("simulated failure in {op}");
            }
        }
        Ok(state)
    }

    pub fn add_entity(&self, entity: Entity) {
        self.lock().entities.push(entity);
    }

    pub fn set_counts(&self, index: usize, counts: &[(&str, u64)]) {
        let map = counts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        self.lock().counts.insert(index, map);
    }

    pub fn counts_of(&self, index: usize) -> BTreeMap<String, u64> {
        self.lock().counts.get(&index).cloned().unwrap_or_default()
    }

    pub fn entity(&self, index: usize) -> Option<Entity> {
        self.lock().entities.iter().find(|e| e.index == index).cloned()
    }

    pub fn show(&self, selector: &str) {
        self.lock().visible.insert(selector.to_string());
    }

    pub fn add_overlay(&self, overlay: &str, closer: &str) {
        let mut state = self.lock();
        state.visible.insert(overlay.to_string());
        state.closers.insert(closer.to_string(), overlay.to_string());
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.lock().authenticated = authenticated;
    }

    pub fn set_can_login(&self, can_login: bool) {
        self.lock().can_login = can_login;
    }

    /// 让接下来 `times` 次名为 `op` 的操作返回错误
    pub fn fail_next(&self, op: &str, times: usize) {
        self.lock().failures.insert(op.to_string(), times);
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn researched(&self) -> Vec<String> {
        self.lock().researched.clone()
    }

    /// 推进所有计时器；完成的升级提升等级并重新可操作
    pub fn advance(&self, ms: u64) {
        let mut state = self.lock();
        for entity in &mut state.entities {
            for item in entity.items.values_mut() {
                if let Some(progress) = item.progress.as_mut() {
                    progress.time_remaining_ms = progress.time_remaining_ms.saturating_sub(ms);
                    if progress.time_remaining_ms == 0 {
                        item.level = progress.target_level;
                        item.progress = None;
                        item.can_act_now = true;
                    }
                }
            }
            entity.active_actions = entity.items.values().filter(|i| i.progress.is_some()).count() as u32;
        }
    }
}

#[async_trait]
impl Session for SimulatedWorld {
    async fn current_url(&self) -> anyhow::Result<String> {
        let state = self.enter("current_url", "current_url".to_string())?;
        Ok(state.url.clone())
    }

    async fn is_visible(&self, selector: &str) -> anyhow::Result<bool> {
        let state = self.lock();
        Ok(state.visible.contains(selector))
    }

    async fn click(&self, selector: &str) -> anyhow::Result<bool> {
        let mut state = self.enter("click", format!("click:{selector}"))?;
        if let Some(overlay) = state.closers.get(selector).cloned() {
            let was_visible = state.visible.remove(&overlay);
            return Ok(was_visible);
        }
        Ok(state.visible.remove(selector))
    }

    async fn reload(&self) -> anyhow::Result<()> {
        let mut state = self.enter("reload", "reload".to_string())?;
        state.visible.clear();
        Ok(())
    }

    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let mut state = self.enter("navigate", format!("navigate:{url}"))?;
        state.visible.clear();
        state.url = url.to_string();
        Ok(())
    }

    async fn clear_storage(&self) -> anyhow::Result<()> {
        let mut state = self.enter("clear_storage", "clear_storage".to_string())?;
        state.authenticated = false;
        Ok(())
    }

    async fn ensure_authenticated(&self) -> anyhow::Result<bool> {
        let mut state = self.enter("ensure_authenticated", "ensure_authenticated".to_string())?;
        if !state.authenticated && state.can_login {
            state.authenticated = true;
        }
        Ok(state.authenticated)
    }
}

#[async_trait]
impl UiReader for SimulatedWorld {
    async fn read_entities(&self) -> anyhow::Result<Vec<RawEntity>> {
        let state = self.enter("read_entities", "read_entities".to_string())?;
        Ok(state.entities.iter().map(RawEntity::from).collect())
    }

    async fn read_counts(&self) -> anyhow::Result<Vec<EntityCounts>> {
        let state = self.enter("read_counts", "read_counts".to_string())?;
        // 每个实体都有一条记录：未设置兵力即为零兵力
        Ok(state
            .entities
            .iter()
            .map(|e| EntityCounts {
                index: e.index,
                counts: state.counts.get(&e.index).cloned().unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl UiActions for SimulatedWorld {
    async fn upgrade(&self, entity_index: usize, item: &str) -> anyhow::Result<bool> {
        let mut state = self.enter("upgrade", format!("upgrade:{entity_index}:{item}"))?;
        let Some(entity) = state.entities.iter_mut().find(|e| e.index == entity_index) else {
            return Ok(false);
        };
        let slot = entity.items.entry(item.to_string()).or_insert_with(|| ItemState::ready(0));
        if !slot.can_act_now || slot.progress.is_some() {
            return Ok(false);
        }
        slot.can_act_now = false;
        slot.progress = Some(Progress {
            target_level: slot.level + 1,
            time_remaining_ms: SIM_BUILD_TIME_MS,
        });
        entity.active_actions += 1;
        Ok(true)
    }

    async fn research(&self, technology: &str) -> anyhow::Result<bool> {
        let mut state = self.enter("research", format!("research:{technology}"))?;
        if state.researched.iter().any(|t| t == technology) {
            return Ok(false);
        }
        state.researched.push(technology.to_string());
        Ok(true)
    }

    async fn recruit(&self, entity_index: usize, item: &str, amount: u64) -> anyhow::Result<bool> {
        let mut state = self.enter("recruit", format!("recruit:{entity_index}:{item}:{amount}"))?;
        *state
            .counts
            .entry(entity_index)
            .or_default()
            .entry(item.to_string())
            .or_insert(0) += amount;
        Ok(true)
    }

    async fn trade(&self, entity_index: usize) -> anyhow::Result<bool> {
        let _state = self.enter("trade", format!("trade:{entity_index}"))?;
        Ok(true)
    }

    async fn run_missions(&self, entity_index: usize) -> anyhow::Result<bool> {
        let _state = self.enter("missions", format!("missions:{entity_index}"))?;
        Ok(true)
    }
}
