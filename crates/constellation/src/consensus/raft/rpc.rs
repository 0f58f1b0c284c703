//! Consensus RPC messages and the transport seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use constellation_common::Result;

use super::{LogEntry, LogIndex, NodeId, Term, Voters};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Heartbeat (no entries) or log replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Leader's transport address, for redirecting joiners
    pub leader_addr: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Last index known to match the leader (valid when `success`)
    pub match_index: LogIndex,
    /// Where the leader should retry from (on failure)
    pub conflict_index: Option<LogIndex>,
}

/// Whole-snapshot transfer to a follower that fell behind compaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub leader_addr: String,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub voters: Voters,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Ask the leader to add a node as a voter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub accepted: bool,
    /// Leader address when the contacted node is not the leader
    pub leader_addr: Option<String>,
    pub error: Option<String>,
}

/// Outbound consensus transport. `target` is a peer's transport address.
#[async_trait]
pub trait RaftRpc: Send + Sync + 'static {
    async fn request_vote(&self, target: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

    async fn append_entries(&self, target: &str, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(&self, target: &str, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;

    async fn join(&self, target: &str, req: JoinRequest) -> Result<JoinResponse>;
}
