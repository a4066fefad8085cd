use a2a_hub::{
    api::ApiServer, config::HubConfig, dispatch::Dispatcher, liveness::LivenessTracker,
    outbound::AgentClient, registry::AgentRegistry, store::Store, tasks::TaskManager,
};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting A2A hub");

    let config = HubConfig::load();

    let store = Arc::new(Store::connect(&config.database_path).await?);
    let client = Arc::new(AgentClient::new(&config)?);
    let registry = Arc::new(AgentRegistry::new(store.clone(), client.clone()).await?);
    let tasks = Arc::new(TaskManager::new(store.clone()).await?);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        tasks.clone(),
        client.clone(),
    ));
    let liveness = Arc::new(LivenessTracker::new(registry.clone(), client, &config));

    // Background loops run until the server has drained its handlers.
    let loops = CancellationToken::new();
    let sweeper = dispatcher.clone().spawn_sweeper(
        config.sweep_interval_secs,
        config.task_retention_secs,
        loops.clone(),
    );
    let prober = liveness.clone().spawn(loops.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    let api = ApiServer::new(config, registry, tasks, dispatcher, liveness);
    api.run(shutdown).await?;

    // Inbound handlers are drained; now stop the loops.
    loops.cancel();
    let _ = tokio::join!(sweeper, prober);

    info!("A2A hub stopped");
    Ok(())
}
