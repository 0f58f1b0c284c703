//! Common error types for Constellation components.

use thiserror::Error;

use crate::types::LeaseType;

/// Result alias used by the authoritative (consensus and lease) paths
pub type Result<T> = std::result::Result<T, ConstellationError>;

/// Common errors across Constellation components
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConstellationError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed payload (peer message, log entry, snapshot)
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Operation requires the consensus leader
    #[error("not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// Another node already holds the lease at the requested term
    #[error("lease {lease_type} already held by {holder} at term {term}")]
    LeaseHeld {
        lease_type: LeaseType,
        holder: String,
        term: u64,
    },

    /// Release requested by a node that is not the exact current holder
    #[error("lease {lease_type} is held by {holder} at term {term}")]
    LeaseNotHeld {
        lease_type: LeaseType,
        holder: String,
        term: u64,
    },

    /// Persistent storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport failure talking to a peer
    #[error("Network error: {0}")]
    Network(String),

    /// Membership / cluster configuration error
    #[error("Membership error: {0}")]
    Membership(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Component is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConstellationError {
    /// Returns true if the caller may retry later (possibly against another node)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::Network(_) | Self::Timeout(_) | Self::Membership(_)
        )
    }

    /// Returns true for lease ownership conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::LeaseHeld { .. } | Self::LeaseNotHeld { .. })
    }
}

impl From<serde_json::Error> for ConstellationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<std::io::Error> for ConstellationError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ConstellationError::NotLeader { leader: None }.is_retryable());
        assert!(ConstellationError::Timeout("commit".into()).is_retryable());

        let held = ConstellationError::LeaseHeld {
            lease_type: LeaseType::DnsWriter,
            holder: "node-a".into(),
            term: 5,
        };
        assert!(held.is_conflict());
        assert!(!held.is_retryable());
        assert_eq!(
            held.to_string(),
            "lease dns_writer already held by node-a at term 5"
        );
    }

    #[test]
    fn test_not_leader_message() {
        let err = ConstellationError::NotLeader {
            leader: Some("10.0.0.2:7947".into()),
        };
        assert_eq!(err.to_string(), "not the leader (leader: 10.0.0.2:7947)");
    }
}
