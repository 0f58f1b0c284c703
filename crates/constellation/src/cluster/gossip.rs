//! Gossip cluster orchestrator.
//!
//! Seeds the shared [`ClusterState`] with the local node, runs the
//! membership engine with the state delegates wired in, and exposes the
//! health-reporting operations used by local collaborators. Local writes
//! reach peers on the engine's own gossip schedule.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use constellation_common::constants::{DEFAULT_GOSSIP_PORT, HTTP_ENDPOINT, META_MAX_SIZE, UDP_PACKET_BUDGET};
use constellation_common::{GatewayHealth, NodeMetadata, ServiceHealth};

use super::delegate::{MembershipEvents, StateDelegate};
use super::membership::{Member, MemberStatus, Membership, MembershipConfig};
use super::state::{ClusterState, StateSnapshot};

/// Gossip cluster configuration
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Unique node name
    pub node_name: String,
    /// Local bind address (e.g. "0.0.0.0")
    pub bind_addr: String,
    pub bind_port: u16,
    /// Publicly reachable address
    pub public_ip: String,
    /// Overlay address, advertised to peers when set
    pub overlay_ip: String,
    /// Placement priority (lower = preferred)
    pub priority: i32,
    pub capabilities: Vec<String>,
    /// Seed peers ("host:port")
    pub seed_nodes: Vec<String>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub suspicion_mult: u32,
    pub push_pull_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: DEFAULT_GOSSIP_PORT,
            public_ip: String::new(),
            overlay_ip: String::new(),
            priority: 0,
            capabilities: vec![],
            seed_nodes: vec![],
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl GossipConfig {
    /// Engine configuration tuned for a private low-latency network
    pub fn membership_config(&self) -> Result<MembershipConfig> {
        let bind_ip: IpAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid gossip bind address: {}", self.bind_addr))?;

        let advertise_addr = if self.overlay_ip.is_empty() {
            None
        } else {
            let ip: IpAddr = self
                .overlay_ip
                .parse()
                .with_context(|| format!("Invalid overlay address: {}", self.overlay_ip))?;
            Some(SocketAddr::new(ip, self.bind_port))
        };

        Ok(MembershipConfig {
            name: self.node_name.clone(),
            bind_addr: SocketAddr::new(bind_ip, self.bind_port),
            advertise_addr,
            probe_interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
            gossip_interval: self.gossip_interval,
            gossip_nodes: self.gossip_nodes,
            suspicion_mult: self.suspicion_mult,
            push_pull_interval: self.push_pull_interval,
            connect_timeout: self.connect_timeout,
            meta_max_size: META_MAX_SIZE,
            packet_budget: UDP_PACKET_BUDGET,
        })
    }
}

/// A running gossip cluster member
pub struct Cluster {
    node_name: String,
    state: Arc<ClusterState>,
    delegate: Arc<StateDelegate>,
    membership: Arc<Membership<StateDelegate, MembershipEvents>>,
}

impl Cluster {
    /// Start the membership engine and join seeds (if any)
    pub async fn start(config: GossipConfig) -> Result<Self> {
        let state = Arc::new(ClusterState::new());

        let mut local = NodeMetadata::new(&config.node_name, &config.public_ip, &config.overlay_ip);
        local.priority = config.priority;
        local.capabilities = config.capabilities.clone();
        state.update_node(local);

        let delegate = Arc::new(StateDelegate::new(&config.node_name, state.clone()));
        let events = Arc::new(MembershipEvents::new(&config.node_name, state.clone()));

        let membership = Membership::create(config.membership_config()?, delegate.clone(), events)
            .await
            .context("Failed to start membership engine")?;

        let cluster = Self {
            node_name: config.node_name.clone(),
            state,
            delegate,
            membership,
        };

        if !config.seed_nodes.is_empty() {
            if let Err(e) = cluster.join(&config.seed_nodes).await {
                tracing::warn!(
                    error = %e,
                    "Failed to join cluster, continuing as first member"
                );
            }
        }

        tracing::info!(
            node = %cluster.node_name,
            addr = %cluster.local_addr(),
            members = cluster.membership.num_members(),
            "Gossip cluster started"
        );

        Ok(cluster)
    }

    /// Contact seed peers. Returns how many answered.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let contacted = self.membership.join(seeds).await?;
        tracing::info!(contacted, "Joined gossip cluster");
        Ok(contacted)
    }

    /// Announce departure to all members
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.membership.leave(timeout).await
    }

    /// Stop the membership engine
    pub fn shutdown(&self) {
        self.membership.shutdown();
        tracing::info!(node = %self.node_name, "Gossip cluster shut down");
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    /// Shared cluster state handle
    pub fn state(&self) -> Arc<ClusterState> {
        self.state.clone()
    }

    /// Members known to the membership engine, including this node
    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    /// Metadata of alive members that are not cordoned
    pub fn healthy_nodes(&self) -> Vec<NodeMetadata> {
        self.membership
            .members()
            .into_iter()
            .filter(|m| self.membership.member_status(&m.name) == Some(MemberStatus::Alive))
            .filter_map(|m| self.state.get_node(&m.name))
            .filter(|node| !node.cordoned)
            .collect()
    }

    /// Pop the next state received from a peer
    pub fn next_update(&self) -> Option<StateSnapshot> {
        self.delegate.next_update()
    }

    /// Record local health for a service
    pub fn broadcast_service_health(
        &self,
        service_name: &str,
        healthy: bool,
        endpoints: HashMap<String, String>,
        networks: Vec<String>,
    ) {
        let mut health = ServiceHealth::new(service_name, &self.node_name, healthy);
        health.endpoints = endpoints;
        health.networks = networks;
        self.state.update_service_health(health);

        tracing::debug!(service = %service_name, healthy, "Service health recorded");
    }

    /// Record local gateway health
    pub fn broadcast_gateway_health(&self, healthy: bool) {
        self.state
            .update_gateway_health(GatewayHealth::new(&self.node_name, healthy));

        tracing::debug!(healthy, "Gateway health recorded");
    }

    /// Change the local node's cordon flag and (optionally) capabilities
    pub async fn update_node_metadata(&self, cordoned: bool, capabilities: Option<Vec<String>>) -> Result<()> {
        let mut node = self
            .state
            .get_node(&self.node_name)
            .with_context(|| format!("Local node {} missing from cluster state", self.node_name))?;

        node.cordoned = cordoned;
        if let Some(capabilities) = capabilities {
            node.capabilities = capabilities;
        }
        self.state.update_node(node);

        self.membership
            .update_node()
            .await
            .context("Failed to announce metadata update")?;

        tracing::info!(cordoned, "Node metadata updated");
        Ok(())
    }

    /// HTTP endpoints of every healthy instance of a service
    pub fn get_service_endpoints(&self, service_name: &str) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .state
            .get_all_service_health()
            .into_iter()
            .filter(|h| h.service_name == service_name && h.healthy)
            .filter_map(|h| h.endpoints.get(HTTP_ENDPOINT).cloned())
            .collect();
        endpoints.sort();
        endpoints
    }
}
