//! 游戏世界协作方：UI 读取与 UI 动作
//!
//! 编排核心只依赖这两个 trait；每个方法内部已自带超时，但核心仍把它们视为可失败调用并统一包装。

#[cfg(feature = "browser")]
pub mod chrome;
pub mod types;

use async_trait::async_trait;

#[cfg(feature = "browser")]
pub use chrome::ScriptedUi;
pub use types::{Entity, EntityCounts, ItemState, Progress, RawEntity, RawItem, RawProgress};

/// 从页面读取实体状态
#[async_trait]
pub trait UiReader: Send + Sync {
    async fn read_entities(&self) -> anyhow::Result<Vec<RawEntity>>;

    async fn read_counts(&self) -> anyhow::Result<Vec<EntityCounts>>;
}

/// 在页面上执行动作；返回 Ok(false) 表示动作未生效（资源不足、按钮不可用等）
#[async_trait]
pub trait UiActions: Send + Sync {
    async fn upgrade(&self, entity_index: usize, item: &str) -> anyhow::Result<bool>;

    /// 研究设施在所有实体间共享
    async fn research(&self, technology: &str) -> anyhow::Result<bool>;

    async fn recruit(&self, entity_index: usize, item: &str, amount: u64) -> anyhow::Result<bool>;

    async fn trade(&self, entity_index: usize) -> anyhow::Result<bool>;

    /// 任务阶段（扩展），默认不支持
    async fn run_missions(&self, _entity_index: usize) -> anyhow::Result<bool> {
        Ok(false)
    }
}
