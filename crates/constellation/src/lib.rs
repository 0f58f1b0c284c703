//! # Constellation
//!
//! Cluster coordination core: gossip-replicated membership and health
//! state, plus consensus-backed leases for singleton duties.
//!
//! ## Architecture
//! ```text
//! health reporters ──► Cluster ──► ClusterState ◄── gossip merge (peers)
//!
//! LeaseManager ──► ConsensusManager ──► replicated log ──► LeaseStateMachine
//!                        │
//!                        └──► lease / leadership callbacks
//! ```

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod routes;
pub mod state;
