//! Core types shared across Constellation components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::constants::SERVICE_KEY_SEPARATOR;

/// Metadata a node advertises about itself through gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Unique node name (cluster-wide key)
    pub name: String,

    /// Publicly reachable address
    pub public_ip: String,

    /// Address on the private overlay network
    pub overlay_ip: String,

    /// Placement priority (lower = preferred)
    pub priority: i32,

    /// Capability tags
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Last local update or accepted merge
    #[serde(default)]
    pub last_seen: DateTime<Utc>,

    /// Excluded from new traffic
    #[serde(default)]
    pub cordoned: bool,
}

impl NodeMetadata {
    pub fn new(name: impl Into<String>, public_ip: impl Into<String>, overlay_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_ip: public_ip.into(),
            overlay_ip: overlay_ip.into(),
            priority: 0,
            capabilities: Vec::new(),
            last_seen: Utc::now(),
            cordoned: false,
        }
    }

    /// Reduced form used when the full record does not fit the advertise budget
    pub fn minimal(&self) -> MinimalNodeMetadata {
        MinimalNodeMetadata {
            name: self.name.clone(),
            public_ip: self.public_ip.clone(),
            overlay_ip: self.overlay_ip.clone(),
            priority: self.priority,
        }
    }
}

/// Name, addresses, and priority only. Decodes as a [`NodeMetadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalNodeMetadata {
    pub name: String,
    pub public_ip: String,
    pub overlay_ip: String,
    pub priority: i32,
}

/// Health of one service instance on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub node_name: String,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,

    /// Protocol -> endpoint (e.g. "http" -> "10.0.0.3:8080")
    #[serde(default)]
    pub endpoints: HashMap<String, String>,

    /// Networks the instance is attached to
    #[serde(default)]
    pub networks: Vec<String>,
}

impl ServiceHealth {
    pub fn new(service_name: impl Into<String>, node_name: impl Into<String>, healthy: bool) -> Self {
        Self {
            service_name: service_name.into(),
            node_name: node_name.into(),
            healthy,
            checked_at: Utc::now(),
            endpoints: HashMap::new(),
            networks: Vec::new(),
        }
    }

    /// Map key: `{service}@{node}`
    pub fn key(&self) -> String {
        service_key(&self.service_name, &self.node_name)
    }
}

/// Build a service health key
pub fn service_key(service_name: &str, node_name: &str) -> String {
    format!("{service_name}{SERVICE_KEY_SEPARATOR}{node_name}")
}

/// Health of the per-node egress gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub node_name: String,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

impl GatewayHealth {
    pub fn new(node_name: impl Into<String>, healthy: bool) -> Self {
        Self {
            node_name: node_name.into(),
            healthy,
            checked_at: Utc::now(),
        }
    }
}

/// Singleton roles arbitrated through leases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseType {
    /// Load-balancer leader (owns the public ingress address)
    LbLeader,
    /// The only node allowed to write DNS records
    DnsWriter,
}

impl LeaseType {
    pub const ALL: [LeaseType; 2] = [LeaseType::LbLeader, LeaseType::DnsWriter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LbLeader => "lb_leader",
            Self::DnsWriter => "dns_writer",
        }
    }
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lb_leader" => Ok(Self::LbLeader),
            "dns_writer" => Ok(Self::DnsWriter),
            other => Err(format!("unknown lease type: {other}")),
        }
    }
}

/// Current holder of a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
    pub node_name: String,
    pub term: u64,
    pub lease_id: String,

    /// Log index at which the grant (or latest renewal) was applied
    pub acquired_at: u64,
}

impl Lease {
    /// Fencing token proving this grant
    pub fn fencing_token(&self) -> FencingToken {
        FencingToken {
            term: self.term,
            lease_id: self.lease_id.clone(),
        }
    }
}

/// Lease command action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseAction {
    Acquire,
    Release,
}

/// Acquire/release intent committed to the consensus log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCommand {
    pub action: LeaseAction,
    pub lease_type: LeaseType,
    pub node_name: String,
    pub lease_id: String,
    pub term: u64,
}

impl LeaseCommand {
    pub fn acquire(lease_type: LeaseType, node_name: impl Into<String>, lease_id: impl Into<String>, term: u64) -> Self {
        Self {
            action: LeaseAction::Acquire,
            lease_type,
            node_name: node_name.into(),
            lease_id: lease_id.into(),
            term,
        }
    }

    pub fn release(lease_type: LeaseType, node_name: impl Into<String>, lease_id: impl Into<String>, term: u64) -> Self {
        Self {
            action: LeaseAction::Release,
            lease_type,
            node_name: node_name.into(),
            lease_id: lease_id.into(),
            term,
        }
    }
}

/// Proof of lease ownership presented before external side effects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FencingToken {
    pub term: u64,
    pub lease_id: String,
}
