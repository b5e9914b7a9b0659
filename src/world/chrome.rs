//! 基于配置脚本的页面读取与操作（browser 模式）
//!
//! 读取脚本需返回 JSON（实体数组 / 兵力数组），动作脚本需返回布尔。
//! 游戏页面结构随版本变化，选择逻辑全部放在 `[scripts]` 配置中，代码只负责占位符替换与结果解析。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use headless_chrome::Tab;
use serde::de::DeserializeOwned;

use crate::config::ScriptsSection;
use crate::world::{EntityCounts, RawEntity, UiActions, UiReader};

/// 用 JSON 字面量替换占位符，避免注入
///
/// 单遍扫描模板：已插入的值不会再被当作模板解析；未知占位符原样保留。
fn render(template: &str, args: &[(&str, serde_json::Value)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| args.iter().find(|(name, _)| *name == &after[..close]).map(|(_, v)| (close, v)));
        match value {
            Some((close, value)) => {
                out.push_str(&value.to_string());
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct ScriptedUi {
    tab: Arc<Tab>,
    scripts: ScriptsSection,
    timeout: Duration,
}

impl ScriptedUi {
    pub fn new(tab: Arc<Tab>, scripts: ScriptsSection, timeout: Duration) -> Self {
        Self { tab, scripts, timeout }
    }

    async fn evaluate(&self, script: String) -> anyhow::Result<serde_json::Value> {
        let tab = self.tab.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = tab.evaluate(&script, true).context("script evaluation failed")?;
            Ok::<_, anyhow::Error>(result.value.unwrap_or(serde_json::Value::Null))
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|e| anyhow!("task join: {e}"))?,
            Err(_) => Err(anyhow!("script timed out after {:?}", self.timeout)),
        }
    }

    /// 脚本可以直接返回对象，也可以返回 JSON 字符串
    async fn read<T: DeserializeOwned>(&self, name: &str, script: Option<&String>) -> anyhow::Result<T> {
        let script = script.ok_or_else(|| anyhow!("scripts.{name} is not configured"))?;
        let value = match self.evaluate(script.clone()).await? {
            serde_json::Value::String(text) => serde_json::from_str(&text)?,
            other => other,
        };
        serde_json::from_value(value).with_context(|| format!("scripts.{name} returned malformed data"))
    }

    async fn act(&self, name: &str, script: Option<&String>, args: &[(&str, serde_json::Value)]) -> anyhow::Result<bool> {
        let Some(template) = script else {
            tracing::debug!("scripts.{} is not configured, skipping", name);
            return Ok(false);
        };
        let value = self.evaluate(render(template, args)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl UiReader for ScriptedUi {
    async fn read_entities(&self) -> anyhow::Result<Vec<RawEntity>> {
        self.read("read_entities", self.scripts.read_entities.as_ref()).await
    }

    /// 未配置脚本时返回错误：兵力未知不能当作零兵力
    async fn read_counts(&self) -> anyhow::Result<Vec<EntityCounts>> {
        self.read("read_counts", self.scripts.read_counts.as_ref()).await
    }
}

#[async_trait]
impl UiActions for ScriptedUi {
    async fn upgrade(&self, entity_index: usize, item: &str) -> anyhow::Result<bool> {
        self.act(
            "upgrade",
            self.scripts.upgrade.as_ref(),
            &[("index", entity_index.into()), ("item", item.into())],
        )
        .await
    }

    async fn research(&self, technology: &str) -> anyhow::Result<bool> {
        self.act("research", self.scripts.research.as_ref(), &[("technology", technology.into())])
            .await
    }

    async fn recruit(&self, entity_index: usize, item: &str, amount: u64) -> anyhow::Result<bool> {
        self.act(
            "recruit",
            self.scripts.recruit.as_ref(),
            &[("index", entity_index.into()), ("item", item.into()), ("amount", amount.into())],
        )
        .await
    }

    async fn trade(&self, entity_index: usize) -> anyhow::Result<bool> {
        self.act("trade", self.scripts.trade.as_ref(), &[("index", entity_index.into())])
            .await
    }

    async fn run_missions(&self, entity_index: usize) -> anyhow::Result<bool> {
        self.act("missions", self.scripts.missions.as_ref(), &[("index", entity_index.into())])
            .await
    }
}
