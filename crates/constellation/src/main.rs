//! # Constellation Agent
//!
//! Runs one cluster member: gossip membership and health state, the
//! consensus-backed lease authority, and liveness/readiness endpoints.
//!
//! ## Architecture
//! ```text
//!  UDP gossip ◄──► Cluster (ClusterState)
//!  HTTP /raft ◄──► ConsensusManager ◄── LeaseManager ◄── claim loop
//!  HTTP /health, /ready
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use constellation::cluster::Cluster;
use constellation::config::{AppConfig, ConfigOverrides};
use constellation::consensus::{ConsensusManager, LeaseManager};
use constellation::routes;
use constellation::state::AppState;
use constellation_common::LeaseType;

/// Constellation cluster agent
#[derive(Parser, Debug)]
#[command(name = "constellation-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/constellation.toml")]
    config: String,

    /// Node name (overrides config)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Health endpoint listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Gossip port (overrides config)
    #[arg(long, env = "GOSSIP_PORT")]
    gossip_port: Option<u16>,

    /// Consensus transport port (overrides config)
    #[arg(long, env = "RAFT_PORT")]
    raft_port: Option<u16>,

    /// Consensus data directory (overrides config)
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Gossip seeds, comma separated (overrides config)
    #[arg(long, env = "GOSSIP_SEEDS", value_delimiter = ',')]
    join: Vec<String>,

    /// Consensus seeds, comma separated (overrides config)
    #[arg(long, env = "RAFT_SEEDS", value_delimiter = ',')]
    raft_join: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            node_name: self.node_name.clone(),
            listen: self.listen.clone(),
            gossip_port: self.gossip_port,
            raft_port: self.raft_port,
            data_dir: self.data_dir.clone(),
            gossip_seeds: self.join.clone(),
            raft_seeds: self.raft_join.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("✨ Starting Constellation agent v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!(node = %config.node.name, "📋 Configuration loaded from {}", args.config);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cluster = Arc::new(
        Cluster::start(config.gossip_config())
            .await
            .context("Failed to start gossip cluster")?,
    );
    cluster.broadcast_gateway_health(true);
    info!(addr = %cluster.local_addr(), "🛰️  Gossip listening");

    let consensus = ConsensusManager::open(config.consensus_config())
        .await
        .context("Failed to open consensus")?;
    register_callbacks(&consensus);
    consensus
        .bootstrap()
        .await
        .context("Failed to join or bootstrap consensus")?;
    info!(
        leader = consensus.leader_id().as_deref().unwrap_or("unknown"),
        "🗳️  Consensus started"
    );

    let leases = LeaseManager::start(consensus.clone(), config.renewal_interval());

    let claim_task = tokio::spawn(claim_loop(
        cluster.clone(),
        consensus.clone(),
        leases.clone(),
        config.leases.claim.clone(),
        config.renewal_interval(),
        shutdown_tx.subscribe(),
    ));

    let state = AppState::new(config.clone(), cluster.clone(), consensus.clone(), leases.clone());
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 Health endpoints listening on {}", config.listen_addr);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    let _ = claim_task.await;
    leases.shutdown().await;
    consensus.shutdown().await;

    if let Err(e) = cluster.leave(config.leave_timeout()).await {
        warn!(error = %e, "Failed to leave gossip cluster gracefully");
    }
    cluster.shutdown();

    info!("👋 Constellation agent shutdown complete");
    Ok(())
}

fn register_callbacks(consensus: &ConsensusManager) {
    for lease_type in LeaseType::ALL {
        consensus.register_lease_callback(lease_type, move |held| {
            if held {
                info!(lease = %lease_type, "🔑 Lease acquired by this node");
            } else {
                warn!(lease = %lease_type, "Lease no longer held by this node");
            }
        });
    }
    consensus.register_leadership_callback(|leader| {
        if leader {
            info!("👑 This node is now the consensus leader");
        } else {
            info!("This node is no longer the consensus leader");
        }
    });
}

/// Claim configured leases while leading; drain gossip updates
async fn claim_loop(
    cluster: Arc<Cluster>,
    consensus: Arc<ConsensusManager>,
    leases: Arc<LeaseManager>,
    claim: Vec<LeaseType>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }

        while let Some(update) = cluster.next_update() {
            debug!(version = update.version, nodes = update.nodes.len(), "Cluster state updated by peer");
        }

        if !consensus.is_leader() {
            continue;
        }
        for &lease_type in &claim {
            if leases.has_lease(lease_type).await {
                continue;
            }
            match leases.acquire_lease(lease_type).await {
                Ok(lease) => info!(lease = %lease_type, term = lease.term, "Claimed lease"),
                Err(e) if e.is_conflict() => debug!(lease = %lease_type, error = %e, "Lease held elsewhere"),
                Err(e) => warn!(lease = %lease_type, error = %e, "Failed to claim lease"),
            }
        }
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
