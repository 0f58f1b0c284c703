//! Cluster membership and gossip-replicated state.
//!
//! Implements:
//! - Cluster state store with last-writer-wins merge
//! - Membership hooks (state delegate, membership events)
//! - SWIM-style UDP membership engine
//! - Gossip cluster orchestrator

mod delegate;
mod gossip;
mod membership;
mod state;

pub use delegate::{EventDelegate, GossipDelegate, MembershipEvents, StateDelegate, chunk_payload, encode_node_meta};
pub use gossip::{Cluster, GossipConfig};
pub use membership::{Member, MemberStatus, Membership, MembershipConfig};
pub use state::{ClusterState, StateSnapshot};
