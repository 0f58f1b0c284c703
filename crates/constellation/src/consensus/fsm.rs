//! Lease state machine.
//!
//! Tracks the current holder of each lease type. Mutated only by applying
//! committed log entries, in log order, so every replica agrees on who
//! holds what.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use constellation_common::{ConstellationError, Lease, LeaseAction, LeaseCommand, LeaseType, Result};

use super::raft::{LogIndex, StateMachine};

/// Result of applying one lease command: the resulting lease for an
/// acquire, `None` for a release.
pub type LeaseOutcome = Result<Option<Lease>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseSnapshot {
    leases: BTreeMap<LeaseType, Lease>,
}

/// Replicated lease table
#[derive(Debug, Default)]
pub struct LeaseStateMachine {
    leases: BTreeMap<LeaseType, Lease>,
}

impl LeaseStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_lease(&self, lease_type: LeaseType) -> Option<Lease> {
        self.leases.get(&lease_type).cloned()
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.leases.values().cloned().collect()
    }

    /// Apply a decoded command committed at `index`
    pub fn apply_command(&mut self, cmd: &LeaseCommand, index: LogIndex) -> LeaseOutcome {
        match cmd.action {
            LeaseAction::Acquire => self.acquire(cmd, index).map(Some),
            LeaseAction::Release => self.release(cmd).map(|()| None),
        }
    }

    fn acquire(&mut self, cmd: &LeaseCommand, index: LogIndex) -> Result<Lease> {
        if let Some(current) = self.leases.get(&cmd.lease_type) {
            if cmd.term < current.term {
                return Err(ConstellationError::LeaseHeld {
                    lease_type: cmd.lease_type,
                    holder: current.node_name.clone(),
                    term: current.term,
                });
            }
            if cmd.term == current.term && cmd.node_name != current.node_name {
                return Err(ConstellationError::LeaseHeld {
                    lease_type: cmd.lease_type,
                    holder: current.node_name.clone(),
                    term: current.term,
                });
            }
        }

        let lease = Lease {
            lease_type: cmd.lease_type,
            node_name: cmd.node_name.clone(),
            term: cmd.term,
            lease_id: cmd.lease_id.clone(),
            acquired_at: index,
        };

        match self.leases.insert(cmd.lease_type, lease.clone()) {
            Some(previous) if previous.node_name != lease.node_name || previous.term != lease.term => {
                tracing::info!(
                    lease = %lease.lease_type,
                    holder = %lease.node_name,
                    term = lease.term,
                    previous_holder = %previous.node_name,
                    previous_term = previous.term,
                    "Lease preempted"
                );
            }
            Some(_) => {
                tracing::trace!(lease = %lease.lease_type, term = lease.term, "Lease renewed");
            }
            None => {
                tracing::info!(
                    lease = %lease.lease_type,
                    holder = %lease.node_name,
                    term = lease.term,
                    "Lease granted"
                );
            }
        }

        Ok(lease)
    }

    fn release(&mut self, cmd: &LeaseCommand) -> Result<()> {
        let Some(current) = self.leases.get(&cmd.lease_type) else {
            return Ok(());
        };

        if current.node_name != cmd.node_name || current.term != cmd.term {
            return Err(ConstellationError::LeaseNotHeld {
                lease_type: cmd.lease_type,
                holder: current.node_name.clone(),
                term: current.term,
            });
        }

        self.leases.remove(&cmd.lease_type);
        tracing::info!(lease = %cmd.lease_type, holder = %cmd.node_name, term = cmd.term, "Lease released");
        Ok(())
    }
}

impl StateMachine for LeaseStateMachine {
    type Output = LeaseOutcome;

    fn apply(&mut self, index: LogIndex, command: &[u8]) -> LeaseOutcome {
        let cmd: LeaseCommand = match serde_json::from_slice(command) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed lease command");
                return Err(e.into());
            }
        };
        self.apply_command(&cmd, index)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = LeaseSnapshot {
            leases: self.leases.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let decoded: LeaseSnapshot = serde_json::from_slice(snapshot)?;
        self.leases = decoded.leases;
        tracing::info!(leases = self.leases.len(), "Lease state restored from snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(node: &str, term: u64) -> LeaseCommand {
        LeaseCommand::acquire(LeaseType::DnsWriter, node, format!("{node}-{term}"), term)
    }

    fn release(node: &str, term: u64) -> LeaseCommand {
        LeaseCommand::release(LeaseType::DnsWriter, node, format!("{node}-{term}"), term)
    }

    fn apply(fsm: &mut LeaseStateMachine, cmd: &LeaseCommand, index: u64) -> LeaseOutcome {
        let bytes = serde_json::to_vec(cmd).unwrap();
        fsm.apply(index, &bytes)
    }

    #[test]
    fn test_grant_when_unheld() {
        let mut fsm = LeaseStateMachine::new();
        let lease = apply(&mut fsm, &acquire("a", 1), 3).unwrap().unwrap();

        assert_eq!(lease.node_name, "a");
        assert_eq!(lease.term, 1);
        assert_eq!(lease.acquired_at, 3);
        assert_eq!(fsm.get_lease(LeaseType::DnsWriter), Some(lease));
        assert!(fsm.get_lease(LeaseType::LbLeader).is_none());
    }

    #[test]
    fn test_same_term_other_node_conflicts() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 5), 1).unwrap();

        let err = apply(&mut fsm, &acquire("b", 5), 2).unwrap_err();
        assert_eq!(
            err,
            ConstellationError::LeaseHeld {
                lease_type: LeaseType::DnsWriter,
                holder: "a".into(),
                term: 5,
            }
        );
        let lease = fsm.get_lease(LeaseType::DnsWriter).unwrap();
        assert_eq!((lease.node_name.as_str(), lease.term, lease.acquired_at), ("a", 5, 1));
    }

    #[test]
    fn test_higher_term_preempts() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 5), 1).unwrap();
        apply(&mut fsm, &acquire("b", 6), 2).unwrap();

        let lease = fsm.get_lease(LeaseType::DnsWriter).unwrap();
        assert_eq!(lease.node_name, "b");
        assert_eq!(lease.term, 6);
    }

    #[test]
    fn test_lower_term_rejected() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 5), 1).unwrap();
        assert!(apply(&mut fsm, &acquire("b", 4), 2).unwrap_err().is_conflict());
        assert!(apply(&mut fsm, &acquire("a", 4), 3).unwrap_err().is_conflict());
        assert_eq!(fsm.get_lease(LeaseType::DnsWriter).unwrap().term, 5);
    }

    #[test]
    fn test_same_holder_renews() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 2), 1).unwrap();
        let renewed = apply(&mut fsm, &acquire("a", 2), 9).unwrap().unwrap();

        assert_eq!(renewed.acquired_at, 9);
        assert_eq!(renewed.node_name, "a");
    }

    #[test]
    fn test_release_rules() {
        let mut fsm = LeaseStateMachine::new();
        assert_eq!(apply(&mut fsm, &release("a", 1), 1).unwrap(), None);

        apply(&mut fsm, &acquire("a", 3), 2).unwrap();
        assert!(apply(&mut fsm, &release("b", 3), 3).unwrap_err().is_conflict());
        assert!(apply(&mut fsm, &release("a", 2), 4).unwrap_err().is_conflict());
        assert!(fsm.get_lease(LeaseType::DnsWriter).is_some());

        apply(&mut fsm, &release("a", 3), 5).unwrap();
        assert!(fsm.get_lease(LeaseType::DnsWriter).is_none());
    }

    #[test]
    fn test_lease_types_are_independent() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 1), 1).unwrap();
        let lb = LeaseCommand::acquire(LeaseType::LbLeader, "b", "x", 1);
        apply(&mut fsm, &lb, 2).unwrap();

        assert_eq!(fsm.leases().len(), 2);
        assert_eq!(fsm.get_lease(LeaseType::LbLeader).unwrap().node_name, "b");
    }

    #[test]
    fn test_malformed_command() {
        let mut fsm = LeaseStateMachine::new();
        let err = fsm.apply(1, b"{\"action\":\"steal\"}").unwrap_err();
        assert!(matches!(err, ConstellationError::Encoding(_)));
        assert!(fsm.leases().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut fsm = LeaseStateMachine::new();
        apply(&mut fsm, &acquire("a", 4), 1).unwrap();
        apply(&mut fsm, &LeaseCommand::acquire(LeaseType::LbLeader, "b", "y", 2), 2).unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let mut restored = LeaseStateMachine::new();
        apply(&mut restored, &acquire("z", 99), 1).unwrap();
        restored.restore(&snapshot).unwrap();

        assert_eq!(restored.leases(), fsm.leases());
        assert!(restored.restore(b"garbage").is_err());
    }

    #[test]
    fn test_replicas_converge() {
        let commands = vec![
            acquire("a", 1),
            acquire("b", 1),
            acquire("b", 2),
            release("a", 1),
            acquire("b", 2),
            release("b", 2),
            acquire("c", 3),
        ];

        let mut first = LeaseStateMachine::new();
        let mut second = LeaseStateMachine::new();
        for (i, cmd) in commands.iter().enumerate() {
            let x = apply(&mut first, cmd, i as u64 + 1);
            let y = apply(&mut second, cmd, i as u64 + 1);
            assert_eq!(x, y);
        }
        assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
    }
}
