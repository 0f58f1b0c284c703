//! Configuration management for the Constellation agent.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use constellation_common::LeaseType;
use constellation_common::constants::{
    DEFAULT_DATA_DIR, DEFAULT_GOSSIP_PORT, DEFAULT_LISTEN_ADDR, DEFAULT_RAFT_PORT, LEADER_WAIT_SECS,
    LEASE_COMMIT_TIMEOUT_SECS, LEASE_MONITOR_INTERVAL_SECS, LEASE_RENEWAL_INTERVAL_SECS, LEAVE_TIMEOUT_SECS,
};

use crate::cluster::GossipConfig;
use crate::consensus::ConsensusConfig;

/// Environment variables `CONSTELLATION__<SECTION>__<KEY>` override the file
const ENV_PREFIX: &str = "CONSTELLATION";
const ENV_SEPARATOR: &str = "__";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address for liveness/readiness
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub gossip: GossipSection,

    #[serde(default)]
    pub consensus: ConsensusSection,

    #[serde(default)]
    pub leases: LeaseSection,
}

/// Identity and advertised metadata of this node
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique node name (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub name: String,

    #[serde(default)]
    pub public_ip: String,

    #[serde(default)]
    pub overlay_ip: String,

    /// Lower is preferred
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: generate_node_id(),
            public_ip: String::new(),
            overlay_ip: String::new(),
            priority: 0,
            capabilities: Vec::new(),
        }
    }
}

/// Membership protocol settings
#[derive(Debug, Clone, Deserialize)]
pub struct GossipSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_gossip_port")]
    pub bind_port: u16,

    /// Gossip seeds ("host:port")
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_gossip_nodes")]
    pub gossip_nodes: usize,

    #[serde(default = "default_suspicion_mult")]
    pub suspicion_mult: u32,

    #[serde(default = "default_push_pull_interval")]
    pub push_pull_interval_secs: u64,

    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_secs: u64,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_gossip_port(),
            seeds: Vec::new(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            gossip_interval_ms: default_gossip_interval(),
            gossip_nodes: default_gossip_nodes(),
            suspicion_mult: default_suspicion_mult(),
            push_pull_interval_secs: default_push_pull_interval(),
            leave_timeout_secs: default_leave_timeout(),
        }
    }
}

/// Consensus settings
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_raft_port")]
    pub port: u16,

    /// Address peers dial; derived from the node addresses when unset
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Consensus transport addresses of existing members
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_secs: u64,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_leader_wait")]
    pub leader_wait_secs: u64,

    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Self-bootstrap when seeds never answer
    #[serde(default = "default_true")]
    pub bootstrap_fallback: bool,

    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,

    #[serde(default = "default_callback_queue")]
    pub callback_queue: usize,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_raft_port(),
            advertise_addr: None,
            data_dir: default_data_dir(),
            seeds: Vec::new(),
            commit_timeout_secs: default_commit_timeout(),
            monitor_interval_secs: default_monitor_interval(),
            leader_wait_secs: default_leader_wait(),
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat(),
            snapshot_threshold: default_snapshot_threshold(),
            bootstrap_fallback: true,
            callback_workers: default_callback_workers(),
            callback_queue: default_callback_queue(),
        }
    }
}

/// Lease renewal and claiming
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,

    /// Lease types the agent claims while it leads
    #[serde(default)]
    pub claim: Vec<LeaseType>,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            renewal_interval_secs: default_renewal_interval(),
            claim: Vec::new(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_gossip_port() -> u16 { DEFAULT_GOSSIP_PORT }
fn default_raft_port() -> u16 { DEFAULT_RAFT_PORT }
fn default_data_dir() -> PathBuf { PathBuf::from(DEFAULT_DATA_DIR) }
fn default_probe_interval() -> u64 { 1000 }
fn default_probe_timeout() -> u64 { 500 }
fn default_gossip_interval() -> u64 { 200 }
fn default_gossip_nodes() -> usize { 3 }
fn default_suspicion_mult() -> u32 { 4 }
fn default_push_pull_interval() -> u64 { 30 }
fn default_leave_timeout() -> u64 { LEAVE_TIMEOUT_SECS }
fn default_commit_timeout() -> u64 { LEASE_COMMIT_TIMEOUT_SECS }
fn default_monitor_interval() -> u64 { LEASE_MONITOR_INTERVAL_SECS }
fn default_leader_wait() -> u64 { LEADER_WAIT_SECS }
fn default_election_timeout_min() -> u64 { 1000 }
fn default_election_timeout_max() -> u64 { 2000 }
fn default_heartbeat() -> u64 { 250 }
fn default_snapshot_threshold() -> u64 { 1024 }
fn default_true() -> bool { true }
fn default_callback_workers() -> usize { 4 }
fn default_callback_queue() -> usize { 64 }
fn default_renewal_interval() -> u64 { LEASE_RENEWAL_INTERVAL_SECS }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

/// Command-line overrides applied on top of file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub node_name: Option<String>,
    pub listen: Option<String>,
    pub gossip_port: Option<u16>,
    pub raft_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub gossip_seeds: Vec<String>,
    pub raft_seeds: Vec<String>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(ref name) = self.node_name {
            config.node.name = name.clone();
        }
        if let Some(ref listen) = self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(port) = self.gossip_port {
            config.gossip.bind_port = port;
        }
        if let Some(port) = self.raft_port {
            config.consensus.port = port;
        }
        if let Some(ref dir) = self.data_dir {
            config.consensus.data_dir = dir.clone();
        }
        if !self.gossip_seeds.is_empty() {
            config.gossip.seeds = self.gossip_seeds.clone();
        }
        if !self.raft_seeds.is_empty() {
            config.consensus.seeds = self.raft_seeds.clone();
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("node.capabilities")
                    .with_list_parse_key("gossip.seeds")
                    .with_list_parse_key("consensus.seeds")
                    .with_list_parse_key("leases.claim"),
            )
            .build()
            .context("Failed to load config")?;

        let mut config: AppConfig = settings.try_deserialize().context("Failed to parse config")?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the consensus timers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() {
            bail!("node.name must not be empty");
        }
        let c = &self.consensus;
        if c.election_timeout_min_ms == 0 || c.election_timeout_min_ms > c.election_timeout_max_ms {
            bail!(
                "consensus election timeout range {}..{}ms is invalid",
                c.election_timeout_min_ms,
                c.election_timeout_max_ms
            );
        }
        if c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            bail!(
                "consensus heartbeat ({}ms) must be shorter than the election timeout ({}ms)",
                c.heartbeat_interval_ms,
                c.election_timeout_min_ms
            );
        }
        if self.leases.renewal_interval_secs == 0 {
            bail!("leases.renewal_interval_secs must be positive");
        }
        Ok(())
    }

    /// Address other nodes should use to reach this one
    fn advertised_ip(&self) -> &str {
        [&self.node.overlay_ip, &self.node.public_ip]
            .into_iter()
            .find(|ip| !ip.is_empty())
            .map(String::as_str)
            .unwrap_or("127.0.0.1")
    }

    pub fn gossip_config(&self) -> GossipConfig {
        let g = &self.gossip;
        GossipConfig {
            node_name: self.node.name.clone(),
            bind_addr: g.bind_addr.clone(),
            bind_port: g.bind_port,
            public_ip: self.node.public_ip.clone(),
            overlay_ip: self.node.overlay_ip.clone(),
            priority: self.node.priority,
            capabilities: self.node.capabilities.clone(),
            seed_nodes: g.seeds.clone(),
            probe_interval: Duration::from_millis(g.probe_interval_ms),
            probe_timeout: Duration::from_millis(g.probe_timeout_ms),
            gossip_interval: Duration::from_millis(g.gossip_interval_ms),
            gossip_nodes: g.gossip_nodes,
            suspicion_mult: g.suspicion_mult,
            push_pull_interval: Duration::from_secs(g.push_pull_interval_secs),
            ..Default::default()
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        let c = &self.consensus;
        let advertise_addr = c
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.advertised_ip(), c.port));

        ConsensusConfig {
            node_name: self.node.name.clone(),
            bind_addr: format!("{}:{}", c.bind_addr, c.port),
            advertise_addr,
            data_dir: c.data_dir.clone(),
            seeds: c.seeds.clone(),
            commit_timeout: Duration::from_secs(c.commit_timeout_secs),
            monitor_interval: Duration::from_secs(c.monitor_interval_secs),
            leader_wait: Duration::from_secs(c.leader_wait_secs),
            bootstrap_fallback: c.bootstrap_fallback,
            election_timeout_min: Duration::from_millis(c.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(c.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            snapshot_threshold: c.snapshot_threshold,
            callback_workers: c.callback_workers,
            callback_queue: c.callback_queue,
            ..Default::default()
        }
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.leases.renewal_interval_secs)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_secs(self.gossip.leave_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node: NodeConfig::default(),
            gossip: GossipSection::default(),
            consensus: ConsensusSection::default(),
            leases: LeaseSection::default(),
        }
    }
}
