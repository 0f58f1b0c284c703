//! Application state and shared resources.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::AppConfig;
use crate::consensus::{ConsensusManager, LeaseManager};

/// Shared handles for the HTTP layer
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Gossip membership and replicated health state
    pub cluster: Arc<Cluster>,

    /// Replicated lease authority
    pub consensus: Arc<ConsensusManager>,

    pub leases: Arc<LeaseManager>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        cluster: Arc<Cluster>,
        consensus: Arc<ConsensusManager>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            consensus,
            leases,
        }
    }

    pub fn node_name(&self) -> &str {
        self.cluster.node_name()
    }
}
