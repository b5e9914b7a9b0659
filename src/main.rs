//! Castellan 入口
//!
//! 初始化日志、加载配置、装配会话与决策服务，运行主控循环直到收到关闭信号，然后释放资源。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use castellan::config::{load_config, AppConfig};
use castellan::core::shutdown::{DecisionServiceCleanup, SessionCleanup, ShutdownCoordinator, ShutdownManager};
use castellan::core::SessionSupervisor;
use castellan::observability::{self, spawn_sampler};
use castellan::session::Session;
use castellan::sim::SimulatedWorld;
use castellan::world::{UiActions, UiReader};
use castellan::OrchestratorBuilder;
use tokio_util::sync::CancellationToken;

type World = (Arc<dyn Session>, Arc<dyn UiReader>, Arc<dyn UiActions>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config ({}), using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let world = build_world(&config, shutdown.token())
        .await
        .context("Failed to open game session")?;
    let orchestrator = OrchestratorBuilder::new(config.clone())
        .build(world.0, world.1, world.2)
        .context("Failed to build orchestrator")?;

    let sampler = config.metrics.enabled.then(|| {
        spawn_sampler(
            orchestrator.metrics().clone(),
            Duration::from_secs(config.metrics.sample_interval_secs.max(1)),
            shutdown.token(),
        )
    });

    let supervisor = SessionSupervisor::with_token(
        shutdown.token().child_token(),
        config.cycle.max_consecutive_failures,
    );
    tracing::info!("{} started", config.app.name.as_deref().unwrap_or("castellan"));
    orchestrator.run(&supervisor).await;

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(DecisionServiceCleanup::new(orchestrator.solver()));
    coordinator.register(SessionCleanup::new(orchestrator.session()));
    coordinator.run_cleanup().await;

    if let Some(handle) = sampler {
        let _ = handle.await;
    }
    Ok(())
}

#[cfg(feature = "browser")]
async fn build_world(config: &AppConfig, token: CancellationToken) -> anyhow::Result<World> {
    use castellan::session::ChromeSession;
    use castellan::world::ScriptedUi;

    if config.app.simulate {
        return Ok(simulated_world(config, token));
    }
    let session = Arc::new(ChromeSession::launch(&config.session).await?);
    let ui = Arc::new(ScriptedUi::new(
        session.tab(),
        config.scripts.clone(),
        session.navigation_timeout(),
    ));
    let session: Arc<dyn Session> = session;
    let reader: Arc<dyn UiReader> = ui.clone();
    let actions: Arc<dyn UiActions> = ui;
    Ok((session, reader, actions))
}

#[cfg(not(feature = "browser"))]
async fn build_world(config: &AppConfig, token: CancellationToken) -> anyhow::Result<World> {
    if !config.app.simulate {
        tracing::warn!("Built without the \"browser\" feature");
    }
    Ok(simulated_world(config, token))
}

/// 模拟世界：后台按真实时间推进计时器
fn simulated_world(config: &AppConfig, token: CancellationToken) -> World {
    tracing::warn!("Running against the simulated world");
    let world = Arc::new(SimulatedWorld::demo(&config.session.entry_url));

    let clock = world.clone();
    tokio::spawn(async move {
        let tick = Duration::from_secs(1);
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => clock.advance(tick.as_millis() as u64),
            }
        }
    });

    let session: Arc<dyn Session> = world.clone();
    let reader: Arc<dyn UiReader> = world.clone();
    let actions: Arc<dyn UiActions> = world;
    (session, reader, actions)
}
