//! Gossip-replicated cluster state.
//!
//! Node metadata, per-service health, and gateway health, plus a version
//! counter bumped on every mutation. Replicas converge by last-writer-wins
//! merge on each entity's wall-clock timestamp.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use constellation_common::{GatewayHealth, NodeMetadata, ServiceHealth, service_key};

/// Canonical wire form of the cluster state.
///
/// Used as the gossip broadcast payload and the full-state exchange payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Node name -> metadata
    #[serde(default)]
    pub nodes: HashMap<String, NodeMetadata>,

    /// `service@node` -> health
    #[serde(default)]
    pub service_health: HashMap<String, ServiceHealth>,

    /// Node name -> gateway health
    #[serde(default)]
    pub gateway_health: HashMap<String, GatewayHealth>,

    #[serde(default)]
    pub version: u64,
}

impl StateSnapshot {
    /// Encode to the canonical JSON form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode cluster state")
    }

    /// Decode from the canonical JSON form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to decode cluster state")
    }
}

/// Shared cluster state. One lock guards every map and the version.
///
/// Getters return owned copies; to change an entity, copy it, modify the
/// copy, and pass it back through the matching `update_*` method.
#[derive(Debug, Default)]
pub struct ClusterState {
    inner: RwLock<StateSnapshot>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node, stamping `last_seen`
    pub fn update_node(&self, mut node: NodeMetadata) {
        node.last_seen = Utc::now();
        let mut inner = self.inner.write();
        inner.nodes.insert(node.name.clone(), node);
        inner.version += 1;
    }

    /// Accept a node record if it is absent or strictly newer than ours.
    /// Keeps the advertised `last_seen`. Returns whether it was taken.
    pub fn merge_node(&self, node: NodeMetadata) -> bool {
        let mut inner = self.inner.write();
        let newer = inner
            .nodes
            .get(&node.name)
            .is_none_or(|local| node.last_seen > local.last_seen);
        if newer {
            inner.nodes.insert(node.name.clone(), node);
            inner.version += 1;
        }
        newer
    }

    pub fn get_node(&self, name: &str) -> Option<NodeMetadata> {
        self.inner.read().nodes.get(name).cloned()
    }

    /// Remove a node along with its service and gateway health entries
    pub fn remove_node(&self, name: &str) {
        let mut inner = self.inner.write();
        inner.nodes.remove(name);
        inner.service_health.retain(|_, health| health.node_name != name);
        inner.gateway_health.remove(name);
        inner.version += 1;
    }

    /// Insert or replace a service health entry, stamping `checked_at`
    pub fn update_service_health(&self, mut health: ServiceHealth) {
        health.checked_at = Utc::now();
        let mut inner = self.inner.write();
        inner.service_health.insert(health.key(), health);
        inner.version += 1;
    }

    pub fn get_service_health(&self, service_name: &str, node_name: &str) -> Option<ServiceHealth> {
        self.inner
            .read()
            .service_health
            .get(&service_key(service_name, node_name))
            .cloned()
    }

    /// Names of nodes reporting `service_name` healthy, sorted
    pub fn get_healthy_service_nodes(&self, service_name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut nodes: Vec<String> = inner
            .service_health
            .values()
            .filter(|h| h.service_name == service_name && h.healthy)
            .map(|h| h.node_name.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Insert or replace a gateway health entry, stamping `checked_at`
    pub fn update_gateway_health(&self, mut health: GatewayHealth) {
        health.checked_at = Utc::now();
        let mut inner = self.inner.write();
        inner.gateway_health.insert(health.node_name.clone(), health);
        inner.version += 1;
    }

    pub fn get_gateway_health(&self, node_name: &str) -> Option<GatewayHealth> {
        self.inner.read().gateway_health.get(node_name).cloned()
    }

    pub fn get_all_nodes(&self) -> Vec<NodeMetadata> {
        let mut nodes: Vec<_> = self.inner.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn get_all_service_health(&self) -> Vec<ServiceHealth> {
        let mut all: Vec<_> = self.inner.read().service_health.values().cloned().collect();
        all.sort_by(|a, b| (&a.service_name, &a.node_name).cmp(&(&b.service_name, &b.node_name)));
        all
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Deep copy of the whole state
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().clone()
    }

    /// Encode the whole state in its canonical form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.inner.read().to_bytes()
    }

    /// Last-writer-wins merge of a peer's state.
    ///
    /// An incoming entity replaces the local one when the local copy is
    /// missing or the incoming timestamp is strictly later. Timestamps are
    /// taken as-is; merge never restamps.
    pub fn merge_state(&self, incoming: &StateSnapshot) {
        let mut inner = self.inner.write();
        let mut accepted = 0usize;

        for (name, node) in &incoming.nodes {
            let newer = inner
                .nodes
                .get(name)
                .is_none_or(|local| node.last_seen > local.last_seen);
            if newer {
                inner.nodes.insert(name.clone(), node.clone());
                accepted += 1;
            }
        }

        for (key, health) in &incoming.service_health {
            let newer = inner
                .service_health
                .get(key)
                .is_none_or(|local| health.checked_at > local.checked_at);
            if newer {
                inner.service_health.insert(key.clone(), health.clone());
                accepted += 1;
            }
        }

        for (name, health) in &incoming.gateway_health {
            let newer = inner
                .gateway_health
                .get(name)
                .is_none_or(|local| health.checked_at > local.checked_at);
            if newer {
                inner.gateway_health.insert(name.clone(), health.clone());
                accepted += 1;
            }
        }

        inner.version += 1;

        tracing::trace!(
            accepted,
            version = inner.version,
            "Merged remote cluster state"
        );
    }
}
