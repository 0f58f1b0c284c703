//! Replicated log consensus.
//!
//! Leader election, log replication with majority commit, single-server
//! voter changes, snapshots with log compaction, and persistent storage.
//! Each node runs one event loop that owns all mutable consensus state;
//! peers and local callers reach it through a [`RaftHandle`].

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod log;
mod node;
pub mod rpc;
mod storage;
pub mod transport;

pub use log::{EntryPayload, LogEntry, RaftLog};
pub use node::{RaftHandle, RaftNode, RaftStatus, Role};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, JoinRequest,
    JoinResponse, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use storage::{FileStorage, HardState, MemStorage, RaftStorage, Snapshot};

use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;

use constellation_common::Result;

/// Node identifier (the node name)
pub type NodeId = String;

/// Election term
pub type Term = u64;

/// Position in the replicated log
pub type LogIndex = u64;

/// Voting members: node id -> transport address
pub type Voters = BTreeMap<NodeId, String>;

/// A deterministic state machine driven by committed log entries.
pub trait StateMachine: Send + Sync + 'static {
    /// Result handed back to the proposer of a command
    type Output: Send + 'static;

    /// Apply a committed command. Must be deterministic.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Self::Output;

    /// Serialize the full state for compaction or transfer
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the full state from a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// Consensus timing and sizing
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id
    pub node_id: NodeId,
    /// Transport address peers use to reach this node
    pub advertise_addr: String,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_entries_per_rpc: usize,
    /// Applied entries between snapshots
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_addr: String::new(),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(250),
            rpc_timeout: Duration::from_secs(2),
            max_entries_per_rpc: 256,
            snapshot_threshold: 1024,
        }
    }
}

impl RaftConfig {
    /// Random election timeout in `[min, max)`
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min + 1);
        Duration::from_millis(rand::rng().random_range(min..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout < config.election_timeout_max);
        }
    }

    #[test]
    fn test_degenerate_timeout_range() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(config.random_election_timeout(), Duration::from_millis(300));
    }
}
