use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_cluster::{
    ClusterState, HeartbeatService, LeaderElection, SyncOrigin, SyncService,
};
use vigil_common::NodeConfig;
use vigil_pipeline::{ComponentTables, PipelineRuntime};
use vigil_registry::{RedisRegistry, Registry};

mod bootstrap;
mod http;

#[derive(Parser)]
#[command(name = "vigil-node", version, about = "Vigil Hub cluster node")]
struct Cli {
    /// Directory holding component configs (input/, output/, ruleset/,
    /// project/, plugin/). Loaded only when contending for leadership.
    #[arg(long, default_value = "./config")]
    config_root: PathBuf,

    /// Contend for the leader lock. Without it the node follows only.
    #[arg(long)]
    leader: bool,

    /// Status listener port.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::from_env()?;
    info!(node = %config.node_id, leader_eligible = cli.leader, "Vigil node starting");

    // Registry unreachable at startup is fatal (non-zero exit).
    let registry = RedisRegistry::connect(&config.redis_url)
        .await
        .context("registry unreachable")?;
    let registry: Arc<dyn Registry> = Arc::new(registry);

    let tables = Arc::new(ComponentTables::new());
    if cli.leader {
        bootstrap::load_config_root(&cli.config_root, &tables)?;
    }
    let runtime = Arc::new(PipelineRuntime::new(tables));
    let state = ClusterState::new(config.node_id.clone(), registry, runtime);

    // Long-lived services: sync listener, heartbeats, election.
    let sync = Arc::new(SyncService::new(state.clone()));
    let _sync_listener = sync.clone().spawn_listener();

    let heartbeats = HeartbeatService::new(state.clone());
    let node_table = heartbeats.table.clone();
    let _publisher = heartbeats.spawn_publisher();
    let _monitor = heartbeats.spawn_monitor();

    if cli.leader {
        let _election = LeaderElection::new(state.clone()).spawn();
    } else {
        // Catch up immediately instead of waiting for the first nudge.
        let _ = sync.synchronize(SyncOrigin::Periodic).await;
    }

    let app = http::router(state.clone(), node_table);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("cannot bind status listener on port {}", cli.port))?;
    info!(port = cli.port, "Status listener up");

    tokio::select! {
        served = axum::serve(listener, app) => {
            served.context("status listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful drain: stop every project before exiting.
    for snapshot in state.runtime().snapshots() {
        if let Err(e) = state.runtime().stop_project(&snapshot.id).await {
            tracing::debug!(project = %snapshot.id, error = %e, "Stop during shutdown");
        }
    }
    info!("Vigil node stopped");
    Ok(())
}
