use anyhow::Result;
use clap::Parser;
use foreman_core::{
    api::{ApiServer, ApiState},
    config::Config,
    connector::DefaultConnectorFactory,
    diagnostics::DiagnosticsView,
    dispatcher::Dispatcher,
    hub::ClientSessionHub,
    queue::TaskQueue,
    registry::AgentRegistry,
    store::{JsonStore, MemoryStore, StateStore},
    warmup::WarmupCoordinator,
    bus::EventBus,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "foreman-core", about = "Orchestrator for long-lived AI coding agents")]
struct Cli {
    /// Path to the JSON state file (overrides FOREMAN_STATE_FILE).
    #[arg(long)]
    state_file: Option<String>,

    /// Skip connector warmup even when configured on.
    #[arg(long)]
    no_warmup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if cli.state_file.is_some() {
        config.store.state_file = cli.state_file;
    }

    info!("Starting Foreman Core");

    let store: Arc<dyn StateStore> = match &config.store.state_file {
        Some(path) => {
            info!("Using JSON state store at {path}");
            Arc::new(JsonStore::open(path).await.map_err(foreman_core::ForemanError::from)?)
        }
        None => {
            warn!("No state file configured; state will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = Arc::new(EventBus::new(config.bus.subscriber_outbound_buffer));
    let registry = Arc::new(AgentRegistry::new(
        store.clone(),
        bus.clone(),
        config.registry.clone(),
        config.connector.max_concurrent,
    ));
    registry.hydrate().await?;

    let queue = Arc::new(TaskQueue::new(
        store.clone(),
        bus.clone(),
        config.queue.max_pending_tasks,
    ));

    let factory = Arc::new(DefaultConnectorFactory::new(config.connector.clone()));
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry.clone(),
        queue.clone(),
        bus.clone(),
        factory,
        config.dispatcher.clone(),
        config.connector.clone(),
    );

    let background = dispatcher.start().await?;
    let sweeper = registry.spawn_sweeper();

    if config.dispatcher.warmup_on_startup && !cli.no_warmup {
        let warmup = WarmupCoordinator::new(registry.clone(), queue.clone());
        let enqueued = warmup.run().await;
        info!("Warmup enqueued {enqueued} task(s)");
    }

    let hub = Arc::new(ClientSessionHub::new(
        bus.clone(),
        queue.clone(),
        registry.clone(),
        dispatcher.clone(),
    ));
    let diagnostics = Arc::new(DiagnosticsView::new(
        store.clone(),
        registry.clone(),
        bus.clone(),
        dispatcher.clone(),
    ));

    let api_server = ApiServer::new(
        config.api.clone(),
        ApiState {
            registry: registry.clone(),
            queue: queue.clone(),
            hub,
            diagnostics,
        },
    );

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
        }
    }

    dispatcher.shutdown().await;
    sweeper.abort();
    for handle in background {
        handle.abort();
    }
    info!("Foreman Core stopped");
    Ok(())
}
