//! Consensus-backed leases.
//!
//! Implements:
//! - Lease state machine (acquire/release with preemption and split-brain guard)
//! - Replicated log core with HTTP transport and on-disk storage
//! - Consensus manager (bootstrap, lease operations, transition callbacks)
//! - Lease manager (lease ids, terms, renewal, fencing tokens)

pub mod dispatch;
pub mod fsm;
pub mod leases;
pub mod manager;
pub mod raft;

pub use dispatch::CallbackStats;
pub use fsm::LeaseStateMachine;
pub use leases::LeaseManager;
pub use manager::{ConsensusConfig, ConsensusManager};
