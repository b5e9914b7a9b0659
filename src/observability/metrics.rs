//! 阶段耗时指标与周期采样
//!
//! Orchestrator 按命名阶段（session / read / solve / build / recruit / trade / missions）记录耗时；
//! 采样任务独立运行，只读取指标与进程内存，从不触碰会话。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 单个阶段的累计耗时
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub last_ms: u64,
}

impl PhaseStats {
    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ms / self.count
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    phases: Arc<Mutex<BTreeMap<String, PhaseStats>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, phase: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        if let Ok(mut phases) = self.phases.lock() {
            let stats = phases.entry(phase.to_string()).or_default();
            stats.count += 1;
            stats.total_ms += ms;
            stats.max_ms = stats.max_ms.max(ms);
            stats.last_ms = ms;
        }
    }

    /// 计时守卫：离开作用域时记录
    pub fn time(&self, phase: &'static str) -> PhaseTimer {
        PhaseTimer {
            registry: self.clone(),
            phase,
            start: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, PhaseStats> {
        self.phases.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

pub struct PhaseTimer {
    registry: MetricsRegistry,
    phase: &'static str,
    start: Instant,
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.registry.record(self.phase, self.start.elapsed());
    }
}

/// 进程常驻内存（字节），仅 Linux 可用
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// 解析 `VmRSS:` 行；内核以 kB 报告，与页大小无关
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// 启动采样任务：每隔 `interval` 输出一次指标快照，直到 token 取消
pub fn spawn_sampler(registry: MetricsRegistry, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = serde_json::json!({
                        "event": "metrics_sample",
                        "rss_bytes": resident_memory_bytes(),
                        "phases": registry.snapshot(),
                    });
                    tracing::info!(metrics = %snapshot, "metrics");
                }
            }
        }
        tracing::debug!("Metrics sampler stopped");
    })
}
