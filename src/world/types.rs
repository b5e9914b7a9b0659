//! 实体数据模型
//!
//! 抓取层返回的 `RawEntity` 所有字段都是可选的；读取之后立即调用一次 `normalize` 得到 `Entity`，
//! 下游的阶段判定与执行逻辑不再自行推导默认值。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 抓取层原始输出（字段缺失即为 None）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEntity {
    pub id: Option<String>,
    pub index: Option<usize>,
    pub resources: Option<BTreeMap<String, u64>>,
    pub items: Option<BTreeMap<String, RawItem>>,
    pub active_actions: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawItem {
    pub level: Option<u32>,
    pub can_act_now: Option<bool>,
    pub in_progress: Option<RawProgress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProgress {
    pub is_active: Option<bool>,
    pub target_level: Option<u32>,
    pub time_remaining_ms: Option<u64>,
}

/// 规范化后的实体快照，每周期重新读取，不跨周期保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub index: usize,
    pub resources: BTreeMap<String, u64>,
    pub items: BTreeMap<String, ItemState>,
    pub active_actions: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub level: u32,
    pub can_act_now: bool,
    pub progress: Option<Progress>,
}

/// 进行中的升级
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub target_level: u32,
    pub time_remaining_ms: u64,
}

impl RawEntity {
    /// 唯一的默认值推导点；`position` 为读取顺序，缺少 index/id 时使用
    pub fn normalize(self, position: usize) -> Entity {
        let index = self.index.unwrap_or(position);
        let items = self
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|(name, raw)| (name, raw.normalize()))
            .collect();
        Entity {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("entity-{index}")),
            index,
            resources: self.resources.unwrap_or_default(),
            items,
            active_actions: self.active_actions.unwrap_or(0),
        }
    }
}

impl RawItem {
    fn normalize(self) -> ItemState {
        let level = self.level.unwrap_or(0);
        let progress = self.in_progress.and_then(|p| {
            if !p.is_active.unwrap_or(false) {
                return None;
            }
            Some(Progress {
                target_level: p.target_level.unwrap_or(level + 1),
                time_remaining_ms: p.time_remaining_ms.unwrap_or(0),
            })
        });
        ItemState {
            level,
            can_act_now: self.can_act_now.unwrap_or(false),
            progress,
        }
    }
}

impl From<&Entity> for RawEntity {
    fn from(entity: &Entity) -> Self {
        let items = entity
            .items
            .iter()
            .map(|(name, item)| {
                let raw = RawItem {
                    level: Some(item.level),
                    can_act_now: Some(item.can_act_now),
                    in_progress: item.progress.as_ref().map(|p| RawProgress {
                        is_active: Some(true),
                        target_level: Some(p.target_level),
                        time_remaining_ms: Some(p.time_remaining_ms),
                    }),
                };
                (name.clone(), raw)
            })
            .collect();
        RawEntity {
            id: Some(entity.id.clone()),
            index: Some(entity.index),
            resources: Some(entity.resources.clone()),
            items: Some(items),
            active_actions: Some(entity.active_actions),
        }
    }
}

impl Entity {
    pub fn new(id: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
            resources: BTreeMap::new(),
            items: BTreeMap::new(),
            active_actions: 0,
        }
    }

    pub fn with_item(mut self, name: impl Into<String>, state: ItemState) -> Self {
        self.items.insert(name.into(), state);
        self
    }

    pub fn level(&self, item: &str) -> u32 {
        self.items.get(item).map(|i| i.level).unwrap_or(0)
    }

    /// 该项目当前是否可以立即操作
    pub fn can_act(&self, item: &str) -> bool {
        self.items.get(item).map(|i| i.can_act_now).unwrap_or(false)
    }

    /// 所有进行中升级的最短剩余时间
    pub fn min_time_remaining(&self) -> Option<u64> {
        self.items
            .values()
            .filter_map(|i| i.progress.as_ref().map(|p| p.time_remaining_ms))
            .min()
    }
}

impl ItemState {
    pub fn ready(level: u32) -> Self {
        Self {
            level,
            can_act_now: true,
            progress: None,
        }
    }

    pub fn upgrading(level: u32, time_remaining_ms: u64) -> Self {
        Self {
            level,
            can_act_now: false,
            progress: Some(Progress {
                target_level: level + 1,
                time_remaining_ms,
            }),
        }
    }
}

/// 每个实体的当前兵力
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub index: usize,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}
