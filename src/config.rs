//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CASTELLAN__*` 覆盖（双下划线表示嵌套，如 `CASTELLAN__LOOP__MIN_SLEEP_MS=5000`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::solver::TargetConfiguration;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    #[serde(rename = "loop")]
    pub cycle: LoopSection,
    pub session: SessionSection,
    pub solver: SolverSection,
    pub target: TargetConfiguration,
    pub metrics: MetricsSection,
    pub scripts: ScriptsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 是否使用内置模拟世界（未启用 browser feature 时总是使用）
    #[serde(default)]
    pub simulate: bool,
}

/// [loop] 段：周期节奏、失败延迟与停滞检测
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    /// 没有任何实体报告剩余时间时的默认间隔
    pub default_interval_ms: u64,
    /// 剩余时间低于该阈值的建造可免费立即完成
    pub free_finish_threshold_ms: u64,
    /// 会话级失败后的重试延迟
    pub soft_failure_retry_ms: u64,
    /// 硬失败（读不到实体、导航失败）后的重试延迟
    pub hard_failure_retry_ms: u64,
    /// 连续失败多少个周期后执行完整会话重置
    pub max_consecutive_failures: u32,
    pub stale_tolerance: f64,
    pub missions_enabled: bool,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            min_sleep_ms: 5_000,
            max_sleep_ms: 1_800_000,
            default_interval_ms: 300_000,
            free_finish_threshold_ms: 300_000,
            soft_failure_retry_ms: 30_000,
            hard_failure_retry_ms: 120_000,
            max_consecutive_failures: 3,
            stale_tolerance: 0.5,
            missions_enabled: false,
        }
    }
}

impl LoopSection {
    /// 保证 min_sleep_ms <= max_sleep_ms、容差为正
    pub fn normalized(mut self) -> Self {
        if self.max_sleep_ms < self.min_sleep_ms {
            self.max_sleep_ms = self.min_sleep_ms;
        }
        if !(self.stale_tolerance > 0.0) {
            self.stale_tolerance = 0.5;
        }
        self.max_consecutive_failures = self.max_consecutive_failures.max(1);
        self
    }
}

/// [session] 段：入口地址、位置识别、弹窗/错误选择器与各等待时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub entry_url: String,
    /// 可识别位置的 URL 正则
    pub url_patterns: Vec<String>,
    pub overlay_selectors: Vec<String>,
    /// 关闭弹窗的按钮，按顺序尝试
    pub overlay_close_selectors: Vec<String>,
    pub error_selectors: Vec<String>,
    /// 视图名（overview / buildings / ...）→ 标记元素选择器
    pub view_markers: HashMap<String, String>,
    pub poll_interval_ms: u64,
    pub navigation_timeout_ms: u64,
    pub health_attempts: u32,
    pub health_delay_ms: u64,
    /// wait-and-retry 层级的等待时长
    pub settle_wait_ms: u64,
    /// 未登录时可见的元素（登录表单）
    pub login_form_selector: Option<String>,
    /// 提交登录的按钮（依赖浏览器保存的凭据）
    pub login_submit_selector: Option<String>,
    pub headless: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            entry_url: "https://game.example/".to_string(),
            url_patterns: vec![r"^https://game\.example/".to_string()],
            overlay_selectors: vec![".modal.is-open".to_string(), ".overlay--blocking".to_string()],
            overlay_close_selectors: vec![
                ".modal.is-open .close".to_string(),
                ".overlay--blocking .button--dismiss".to_string(),
            ],
            error_selectors: vec![".connection-lost".to_string(), ".session-expired".to_string()],
            view_markers: HashMap::new(),
            poll_interval_ms: 250,
            navigation_timeout_ms: 15_000,
            health_attempts: 3,
            health_delay_ms: 1_000,
            settle_wait_ms: 2_000,
            login_form_selector: None,
            login_submit_selector: None,
            headless: true,
        }
    }
}

/// [solver] 段：远程决策服务；未设置 endpoint 时使用本地规划器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverSection {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SolverSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 10,
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// [metrics] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub sample_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 60,
        }
    }
}

/// [scripts] 段：browser 模式下读取/操作页面的 JavaScript 片段
///
/// 动作脚本支持占位符 `{index}` `{item}` `{amount}` `{technology}`，需求值为布尔。
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScriptsSection {
    pub read_entities: Option<String>,
    pub read_counts: Option<String>,
    pub upgrade: Option<String>,
    pub research: Option<String>,
    pub recruit: Option<String>,
    pub trade: Option<String>,
    pub missions: Option<String>,
}

/// 从 config 目录加载配置，环境变量 CASTELLAN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CASTELLAN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CASTELLAN")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.cycle = cfg.cycle.normalized();
    Ok(cfg)
}
