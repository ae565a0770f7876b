//! Bee Subagents 守护进程
//!
//! 连接网关，恢复磁盘上的运行登记表并持续跟踪子智能体运行，直到收到关闭信号或网关断开。
//!
//! 运行方式：
//! ```bash
//! BEE__GATEWAY__URL=ws://127.0.0.1:18789 cargo run --bin bee-subagents
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_subagents::config::load_config;
use bee_subagents::core::{
    run_with_graceful_shutdown, GatewayCloseCleanup, RegistryFlushCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
use bee_subagents::gateway::{AgentEventBus, GatewayRpc, WsGatewayClient};
use bee_subagents::observability;
use bee_subagents::subagent::{
    GatewayAnnouncer, GatewayTranscriptSummarizer, JsonFileRunStore, RegistryDeps, RegistrySettings,
    SubagentRegistry, TracingTelemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let events = AgentEventBus::default();
    let client = WsGatewayClient::connect(&cfg.gateway, events.clone())
        .await
        .context("Failed to connect to gateway")?;
    let gateway: Arc<dyn GatewayRpc> = client.clone();

    let store_path = cfg.registry.resolved_path();
    tracing::info!("Subagent registry at {:?}", store_path);

    let registry = SubagentRegistry::new(RegistryDeps {
        gateway: Arc::clone(&gateway),
        events,
        store: Arc::new(JsonFileRunStore::new(&store_path)),
        announcer: Arc::new(GatewayAnnouncer::new(Arc::clone(&gateway))),
        summarizer: Arc::new(GatewayTranscriptSummarizer::new(Arc::clone(&gateway))),
        telemetry: Some(Arc::new(TracingTelemetry)),
        settings: RegistrySettings::from(&cfg),
    });
    registry.init().await;
    tracing::info!("Tracking {} subagent runs", registry.len().await);

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(RegistryFlushCleanup::new(registry.clone()));
    coordinator.register(GatewayCloseCleanup::new(Arc::clone(&client)));

    let gateway_closed = {
        let client = Arc::clone(&client);
        let shutdown = Arc::clone(&shutdown);
        async move {
            client.closed().await;
            tracing::warn!("Gateway connection lost");
            shutdown.shutdown(ShutdownReason::GatewayLost);
        }
    };

    let reason = run_with_graceful_shutdown(shutdown, gateway_closed, coordinator).await;
    tracing::info!("Stopped ({:?})", reason);

    Ok(())
}
