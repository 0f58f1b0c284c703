//! Shared constants for Constellation components.

/// Default gossip (membership) port
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Default consensus transport port
pub const DEFAULT_RAFT_PORT: u16 = 8300;

/// Default health endpoint listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default data directory for consensus storage
pub const DEFAULT_DATA_DIR: &str = "/var/lib/constellation";

/// Budget for the per-node metadata advertised through membership
pub const META_MAX_SIZE: usize = 512;

/// Budget for a single gossip broadcast datagram
pub const UDP_PACKET_BUDGET: usize = 1400;

/// Largest datagram accepted by the membership engine (push/pull carries full state)
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Broadcasts needing more chunks than this are not sent
pub const MAX_BROADCAST_CHUNKS: usize = 32;

/// Capacity of the gossip update notification queue
pub const NOTIFY_QUEUE_CAPACITY: usize = 100;

/// Graceful leave timeout (seconds)
pub const LEAVE_TIMEOUT_SECS: u64 = 5;

/// Lease commit timeout (seconds)
pub const LEASE_COMMIT_TIMEOUT_SECS: u64 = 5;

/// Lease monitor poll interval (seconds)
pub const LEASE_MONITOR_INTERVAL_SECS: u64 = 1;

/// Lease renewal interval (seconds)
pub const LEASE_RENEWAL_INTERVAL_SECS: u64 = 5;

/// How long a seeded node waits for a leader before falling back (seconds)
pub const LEADER_WAIT_SECS: u64 = 10;

/// Separator in service health keys: {service}@{node}
pub const SERVICE_KEY_SEPARATOR: char = '@';

/// Endpoint protocol used by service endpoint discovery
pub const HTTP_ENDPOINT: &str = "http";

/// Consensus transport paths
pub mod raft_paths {
    /// RequestVote RPC
    pub const REQUEST_VOTE: &str = "/raft/request_vote";

    /// AppendEntries RPC
    pub const APPEND_ENTRIES: &str = "/raft/append_entries";

    /// InstallSnapshot RPC
    pub const INSTALL_SNAPSHOT: &str = "/raft/install_snapshot";

    /// Voter join request
    pub const JOIN: &str = "/raft/join";
}
