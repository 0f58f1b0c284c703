//! Consensus manager: the lease state machine behind a replicated log.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use constellation_common::constants::{
    DEFAULT_DATA_DIR, DEFAULT_RAFT_PORT, LEADER_WAIT_SECS, LEASE_COMMIT_TIMEOUT_SECS, LEASE_MONITOR_INTERVAL_SECS,
};
use constellation_common::{ConstellationError, Lease, LeaseCommand, LeaseType, Result};

use super::dispatch::{Callback, CallbackDispatcher, CallbackStats};
use super::fsm::{LeaseOutcome, LeaseStateMachine};
use super::raft::transport::{HttpTransport, raft_router, serve};
use super::raft::{FileStorage, JoinRequest, RaftConfig, RaftHandle, RaftNode, RaftRpc, RaftStatus, RaftStorage, Voters};

const JOIN_RETRY: Duration = Duration::from_millis(500);
const JOIN_REDIRECTS: usize = 3;
const DISPATCH_GRACE: Duration = Duration::from_secs(2);

/// Consensus manager configuration
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Node name, used as the consensus node id and lease holder name
    pub node_name: String,
    /// Address the consensus transport listens on
    pub bind_addr: String,
    /// Address peers use to reach this node
    pub advertise_addr: String,
    /// Storage lives under `<data_dir>/raft`
    pub data_dir: PathBuf,
    /// Transport addresses of existing cluster members
    pub seeds: Vec<String>,
    pub commit_timeout: Duration,
    pub monitor_interval: Duration,
    /// How long a seeded node keeps trying to join before giving up
    pub leader_wait: Duration,
    /// Self-bootstrap when no seed answers and no cluster is known
    pub bootstrap_fallback: bool,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub snapshot_threshold: u64,
    pub callback_workers: usize,
    pub callback_queue: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let raft = RaftConfig::default();
        Self {
            node_name: String::new(),
            bind_addr: format!("0.0.0.0:{DEFAULT_RAFT_PORT}"),
            advertise_addr: format!("127.0.0.1:{DEFAULT_RAFT_PORT}"),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            seeds: Vec::new(),
            commit_timeout: Duration::from_secs(LEASE_COMMIT_TIMEOUT_SECS),
            monitor_interval: Duration::from_secs(LEASE_MONITOR_INTERVAL_SECS),
            leader_wait: Duration::from_secs(LEADER_WAIT_SECS),
            bootstrap_fallback: true,
            election_timeout_min: raft.election_timeout_min,
            election_timeout_max: raft.election_timeout_max,
            heartbeat_interval: raft.heartbeat_interval,
            rpc_timeout: raft.rpc_timeout,
            snapshot_threshold: raft.snapshot_threshold,
            callback_workers: 4,
            callback_queue: 64,
        }
    }
}

impl ConsensusConfig {
    fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            node_id: self.node_name.clone(),
            advertise_addr: self.advertise_addr.clone(),
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.heartbeat_interval,
            rpc_timeout: self.rpc_timeout,
            snapshot_threshold: self.snapshot_threshold,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Watchers {
    leases: HashMap<LeaseType, Vec<Callback>>,
    leadership: Vec<Callback>,
}

/// Replicated lease authority for this node
pub struct ConsensusManager {
    config: ConsensusConfig,
    raft: RaftHandle<LeaseOutcome>,
    fsm: Arc<RwLock<LeaseStateMachine>>,
    rpc: Arc<dyn RaftRpc>,
    watchers: RwLock<Watchers>,
    dispatcher: CallbackDispatcher,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusManager {
    /// Open storage, serve the HTTP transport and join or bootstrap the cluster
    pub async fn start(config: ConsensusConfig) -> Result<Arc<Self>> {
        let manager = Self::open(config).await?;
        manager.bootstrap().await?;
        Ok(manager)
    }

    /// Open storage and serve the HTTP transport. Membership is left to [`Self::bootstrap`].
    pub async fn open(config: ConsensusConfig) -> Result<Arc<Self>> {
        let storage = FileStorage::open(config.data_dir.join("raft"))?;
        let transport = HttpTransport::new(config.rpc_timeout)?;
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            ConstellationError::Network(format!("failed to bind consensus transport on {}: {e}", config.bind_addr))
        })?;
        info!(bind = %config.bind_addr, advertise = %config.advertise_addr, "Consensus transport listening");

        let manager = Self::launch(config, Arc::new(storage), Arc::new(transport))?;

        let router = raft_router(manager.raft.clone());
        let shutdown = manager.shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            if let Err(e) = serve(listener, router, shutdown).await {
                error!(error = %e, "Consensus transport stopped");
            }
        });
        manager.tasks.lock().push(server);
        Ok(manager)
    }

    /// Start the consensus node and lease monitor without touching membership
    pub fn launch(config: ConsensusConfig, storage: Arc<dyn RaftStorage>, rpc: Arc<dyn RaftRpc>) -> Result<Arc<Self>> {
        if config.node_name.is_empty() {
            return Err(ConstellationError::Config("consensus node name must not be empty".into()));
        }

        let fsm = Arc::new(RwLock::new(LeaseStateMachine::new()));
        let raft = RaftNode::spawn(config.raft_config(), storage, rpc.clone(), fsm.clone())?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(Self {
            dispatcher: CallbackDispatcher::new(config.callback_workers, config.callback_queue),
            config,
            raft,
            fsm,
            rpc,
            watchers: RwLock::new(Watchers::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let monitor = tokio::spawn(lease_monitor(manager.clone(), manager.shutdown_tx.subscribe()));
        manager.tasks.lock().push(monitor);
        Ok(manager)
    }

    /// Become a voter: self-bootstrap without seeds, otherwise join through them
    pub async fn bootstrap(&self) -> Result<()> {
        let me = Voters::from([(self.config.node_name.clone(), self.config.advertise_addr.clone())]);

        if self.config.seeds.is_empty() {
            info!(node = %self.config.node_name, "No consensus seeds configured, bootstrapping single-voter cluster");
            return self.raft.bootstrap(me).await;
        }

        let deadline = Instant::now() + self.config.leader_wait;
        loop {
            if self.raft.status().is_voter() {
                info!(node = %self.config.node_name, "Already a consensus voter");
                return Ok(());
            }
            if self.join_via_seeds().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(JOIN_RETRY).await;
        }

        let status = self.raft.status();
        if status.is_voter() {
            return Ok(());
        }
        if status.voters.is_empty() && status.leader_id.is_none() {
            if self.config.bootstrap_fallback {
                warn!(
                    node = %self.config.node_name,
                    seeds = ?self.config.seeds,
                    "No consensus leader reachable, self-bootstrapping; nodes starting concurrently may form separate clusters"
                );
                return self.raft.bootstrap(me).await;
            }
            return Err(ConstellationError::Membership(format!(
                "no consensus leader reachable via {} seed(s)",
                self.config.seeds.len()
            )));
        }

        warn!(
            node = %self.config.node_name,
            leader = ?status.leader_id,
            "Known to a consensus cluster but not yet a voter"
        );
        Ok(())
    }

    async fn join_via_seeds(&self) -> bool {
        let req = JoinRequest {
            node_id: self.config.node_name.clone(),
            addr: self.config.advertise_addr.clone(),
        };

        for seed in self.config.seeds.iter().filter(|s| **s != self.config.advertise_addr) {
            let mut target = seed.clone();
            for _ in 0..JOIN_REDIRECTS {
                match self.rpc.join(&target, req.clone()).await {
                    Ok(resp) if resp.accepted => {
                        info!(via = %target, "Joined consensus cluster");
                        return true;
                    }
                    Ok(resp) => match resp.leader_addr {
                        Some(leader) if leader != target => {
                            debug!(seed = %target, leader = %leader, "Following leader hint");
                            target = leader;
                        }
                        _ => {
                            debug!(seed = %target, error = ?resp.error, "Seed declined join");
                            break;
                        }
                    },
                    Err(e) => {
                        debug!(seed = %target, error = %e, "Seed unreachable");
                        break;
                    }
                }
            }
        }
        false
    }

    /// Propose an acquire for this node. Leader only.
    pub async fn acquire_lease(&self, lease_type: LeaseType, lease_id: &str, term: u64) -> Result<Lease> {
        let cmd = LeaseCommand::acquire(lease_type, &self.config.node_name, lease_id, term);
        self.submit(cmd)
            .await?
            .ok_or_else(|| ConstellationError::Internal(format!("acquire of {lease_type} produced no lease")))
    }

    /// Propose a release for this node. Leader only.
    pub async fn release_lease(&self, lease_type: LeaseType, lease_id: &str, term: u64) -> Result<()> {
        let cmd = LeaseCommand::release(lease_type, &self.config.node_name, lease_id, term);
        self.submit(cmd).await.map(|_| ())
    }

    async fn submit(&self, cmd: LeaseCommand) -> LeaseOutcome {
        if !self.raft.is_leader() {
            return Err(ConstellationError::NotLeader {
                leader: self.leader_id(),
            });
        }
        let data = serde_json::to_vec(&cmd)?;
        self.raft.propose(data, self.config.commit_timeout).await?
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn get_lease(&self, lease_type: LeaseType) -> Option<Lease> {
        self.fsm.read().get_lease(lease_type)
    }

    /// Does this node hold `lease_type` in the replicated state?
    pub fn has_lease(&self, lease_type: LeaseType) -> bool {
        self.get_lease(lease_type)
            .is_some_and(|lease| lease.node_name == self.config.node_name)
    }

    pub fn get_all_leases(&self) -> Vec<Lease> {
        self.fsm.read().leases()
    }

    /// Transport address of the current leader
    pub fn get_leader(&self) -> Option<String> {
        self.raft.status().leader_addr
    }

    pub fn leader_id(&self) -> Option<String> {
        self.raft.status().leader_id
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    pub(crate) fn raft(&self) -> &RaftHandle<LeaseOutcome> {
        &self.raft
    }

    /// Call `callback(held)` whenever this node gains or loses `lease_type`
    pub fn register_lease_callback(&self, lease_type: LeaseType, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.watchers
            .write()
            .leases
            .entry(lease_type)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Call `callback(is_leader)` whenever this node gains or loses consensus leadership
    pub fn register_leadership_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.watchers.write().leadership.push(Arc::new(callback));
    }

    pub fn callback_stats(&self) -> CallbackStats {
        self.dispatcher.stats()
    }

    /// Diff leadership and watched lease ownership against the previous poll
    fn poll_transitions(&self, was_leader: &mut bool, held: &mut HashMap<LeaseType, bool>) {
        let (leadership, watched) = {
            let watchers = self.watchers.read();
            let watched: Vec<(LeaseType, Vec<Callback>)> =
                watchers.leases.iter().map(|(t, cbs)| (*t, cbs.clone())).collect();
            (watchers.leadership.clone(), watched)
        };

        let leader = self.is_leader();
        if leader != *was_leader {
            info!(node = %self.config.node_name, is_leader = leader, "Consensus leadership changed");
            *was_leader = leader;
            for callback in leadership {
                self.dispatcher.dispatch("leadership", callback, leader);
            }
        }

        for (lease_type, callbacks) in watched {
            let has_lease = self.has_lease(lease_type);
            let had_lease = held.insert(lease_type, has_lease).unwrap_or(false);
            if has_lease == had_lease {
                continue;
            }

            info!(lease = %lease_type, has_lease, "Lease ownership changed");
            let label = format!("lease:{lease_type}");
            for callback in callbacks {
                self.dispatcher.dispatch(&label, callback, has_lease);
            }
        }
    }

    /// Stop the monitor, transport and consensus node
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_name, "Shutting down consensus manager");
        let _ = self.shutdown_tx.send(());
        self.raft.shutdown().await;
        self.dispatcher.shutdown(DISPATCH_GRACE).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Consensus background task did not stop in time");
            }
        }
    }
}

async fn lease_monitor(manager: Arc<ConsensusManager>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(manager.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_leader = false;
    let mut held = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => manager.poll_transitions(&mut was_leader, &mut held),
            _ = shutdown.recv() => break,
        }
    }
    debug!("Lease monitor stopped");
}
