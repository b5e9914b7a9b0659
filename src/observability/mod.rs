//! 可观测性：日志初始化与阶段耗时指标

pub mod metrics;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use metrics::{spawn_sampler, MetricsRegistry, PhaseStats};

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
