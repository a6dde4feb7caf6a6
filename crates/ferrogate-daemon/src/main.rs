//! Gateway daemon: loads the configuration, wires the pipeline, runs until
//! interrupted.
//!
//! Channel adapters and a production LLM provider are attached by embedders
//! through the library crates; standalone the daemon runs with an echoing
//! provider, which is enough to smoke the full message path (bus → router →
//! scheduler → agent loop → outbound).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferrogate_agent::tools::ToolRegistry;
use ferrogate_agent::AgentLoop;
use ferrogate_core::bus::events::EventPublisher;
use ferrogate_core::bus::queue::MessageBus;
use ferrogate_core::config::Config;
use ferrogate_core::session::store::SessionStore;
use ferrogate_core::utils;
use ferrogate_gateway::binding::BindingTable;
use ferrogate_gateway::heartbeat::HeartbeatService;
use ferrogate_gateway::InboundRouter;
use ferrogate_providers::retry::RetryPolicy;
use ferrogate_providers::testing::ScriptedProvider;
use ferrogate_providers::{Provider, RetryingProvider};
use ferrogate_trace::{MemoryCollector, NoopCollector, TraceCollector};

#[derive(Parser, Debug)]
#[command(name = "ferrogated", about = "Ferrogate agent gateway daemon")]
struct Args {
    /// Path to the configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture span previews and keep traces in memory.
    #[arg(long, short)]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = match path {
        Some(p) => p.clone(),
        None => utils::get_data_path().join("config.json"),
    };
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if args.verbose { "debug" } else { "info" })
            }),
        )
        .init();

    let config = load_config(args.config.as_ref())?;
    let workspace = utils::get_default_workspace_path();
    std::fs::create_dir_all(&workspace)?;

    let bus = Arc::new(MessageBus::new(256));
    let events = EventPublisher::default();
    let store = Arc::new(SessionStore::new(None)?);
    let collector: Arc<dyn TraceCollector> = if args.verbose {
        Arc::new(MemoryCollector::new(true))
    } else {
        Arc::new(NoopCollector)
    };

    // No provider backend is linked into the standalone daemon; the echo
    // provider keeps the pipeline exercisable end to end.
    warn!("no LLM provider backend configured, falling back to echo provider");
    let provider: Arc<dyn Provider> = Arc::new(RetryingProvider::new(
        ScriptedProvider::new(Vec::new()),
        RetryPolicy::default(),
        events.clone(),
    ));

    let tools = Arc::new(ToolRegistry::new().with_events(events.clone()));

    let scheduler = ferrogate_scheduler::Scheduler::new(config.scheduler.clone());
    scheduler.set_token_estimate_fn({
        let store = store.clone();
        Arc::new(move |session_key| {
            ferrogate_agent::summarize::estimate_session_tokens(&store, session_key)
        })
    });

    let agent = Arc::new(AgentLoop::new(
        config.gateway.default_agent.clone(),
        provider,
        store.clone(),
        tools,
        collector,
        events.clone(),
        config.agent.clone(),
        workspace.clone(),
    ));
    scheduler.set_runner({
        let agent = agent.clone();
        Arc::new(move |cancel, req| {
            let agent = agent.clone();
            Box::pin(async move { agent.run(cancel, req).await })
        })
    });

    let bindings = BindingTable::new(&config.gateway);
    let router = Arc::new(InboundRouter::new(
        bus.clone(),
        scheduler.clone(),
        store.clone(),
        config.clone(),
        bindings,
    ));

    let heartbeat = Arc::new(HeartbeatService::new(
        config.gateway.default_agent.clone(),
        workspace,
        scheduler.clone(),
        store.clone(),
        bus.clone(),
        config.heartbeat.clone(),
    ));

    let shutdown = CancellationToken::new();
    let router_task = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.run(shutdown).await })
    };
    let heartbeat_task = {
        let heartbeat = heartbeat.clone();
        tokio::spawn(async move { heartbeat.run().await })
    };
    // Without channel adapters attached, log outbound deliveries.
    let outbound_task = {
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(out) = bus.consume_outbound().await {
                info!(
                    channel = %out.channel,
                    chat_id = %out.chat_id,
                    content_len = out.content.len(),
                    media = out.media.len(),
                    "outbound message"
                );
            }
        })
    };

    info!("ferrogated running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    heartbeat.stop();
    shutdown.cancel();
    scheduler.stop().await;
    let _ = router_task.await;
    heartbeat_task.abort();
    outbound_task.abort();
    Ok(())
}
