//! Lease manager: local lease bookkeeping and periodic renewal.
//!
//! Tracks the id and term of each lease this node acquired, renews them
//! while this node leads, and hands out fencing tokens to callers that
//! must prove ownership before acting.

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use constellation_common::{ConstellationError, FencingToken, Lease, LeaseType, Result};

use super::manager::ConsensusManager;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeldLease {
    lease_id: String,
    term: u64,
}

#[derive(Debug)]
struct LeaseBook {
    /// Last term handed out; only ever grows
    term: u64,
    held: HashMap<LeaseType, HeldLease>,
}

pub struct LeaseManager {
    consensus: Arc<ConsensusManager>,
    book: Mutex<LeaseBook>,
    renewal_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    renewal: SyncMutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    /// Create the manager and start its renewal loop
    pub fn start(consensus: Arc<ConsensusManager>, renewal_interval: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = Arc::new(Self {
            consensus,
            book: Mutex::new(LeaseBook {
                term: 1,
                held: HashMap::new(),
            }),
            renewal_interval,
            shutdown_tx,
            renewal: SyncMutex::new(None),
        });

        let task = tokio::spawn(renewal_loop(manager.clone(), manager.shutdown_tx.subscribe()));
        *manager.renewal.lock() = Some(task);
        manager
    }

    pub async fn acquire_lb_leader_lease(&self) -> Result<Lease> {
        self.acquire_lease(LeaseType::LbLeader).await
    }

    pub async fn acquire_dns_writer_lease(&self) -> Result<Lease> {
        self.acquire_lease(LeaseType::DnsWriter).await
    }

    /// Acquire `lease_type` with a fresh id and term, or renew it if already held
    pub async fn acquire_lease(&self, lease_type: LeaseType) -> Result<Lease> {
        let mut book = self.book.lock().await;

        if let Some(held) = book.held.get(&lease_type).cloned() {
            if self.verified(lease_type, &held) {
                return self
                    .consensus
                    .acquire_lease(lease_type, &held.lease_id, held.term)
                    .await
                    .inspect_err(|e| warn!(lease = %lease_type, error = %e, "Lease renewal failed"));
            }
            debug!(lease = %lease_type, "Dropping stale lease tracking");
            book.held.remove(&lease_type);
        }

        if !self.consensus.is_leader() {
            return Err(ConstellationError::NotLeader {
                leader: self.consensus.leader_id(),
            });
        }

        // past any term already granted, so a new leader can take over a stale holder's lease
        let observed = self.consensus.get_lease(lease_type).map_or(0, |lease| lease.term);
        book.term = book.term.max(observed) + 1;
        let held = HeldLease {
            lease_id: Uuid::new_v4().to_string(),
            term: book.term,
        };
        book.held.insert(lease_type, held.clone());

        match self.consensus.acquire_lease(lease_type, &held.lease_id, held.term).await {
            Ok(lease) => {
                info!(lease = %lease_type, term = held.term, lease_id = %held.lease_id, "Acquired lease");
                Ok(lease)
            }
            Err(e) => {
                book.held.remove(&lease_type);
                warn!(lease = %lease_type, term = held.term, error = %e, "Failed to acquire lease");
                Err(e)
            }
        }
    }

    /// Release a tracked lease. Untracked leases are already released.
    pub async fn release_lease(&self, lease_type: LeaseType) -> Result<()> {
        let mut book = self.book.lock().await;
        let Some(held) = book.held.get(&lease_type).cloned() else {
            return Ok(());
        };

        if !self.consensus.is_leader() {
            debug!(lease = %lease_type, "Not the leader, dropping local lease tracking");
            book.held.remove(&lease_type);
            return Ok(());
        }

        self.consensus.release_lease(lease_type, &held.lease_id, held.term).await?;
        book.held.remove(&lease_type);
        info!(lease = %lease_type, term = held.term, "Released lease");
        Ok(())
    }

    /// Tracked locally and confirmed by the replicated state
    pub async fn has_lease(&self, lease_type: LeaseType) -> bool {
        let book = self.book.lock().await;
        book.held
            .get(&lease_type)
            .is_some_and(|held| self.verified(lease_type, held))
    }

    /// `(term, lease_id)` of a lease this node verifiably holds
    pub async fn get_lease_fencing_token(&self, lease_type: LeaseType) -> Result<FencingToken> {
        let book = self.book.lock().await;
        let current = self.consensus.get_lease(lease_type);

        match (book.held.get(&lease_type), current) {
            (Some(held), Some(lease))
                if lease.node_name == self.consensus.node_name() && lease.lease_id == held.lease_id =>
            {
                Ok(lease.fencing_token())
            }
            (_, Some(lease)) => Err(ConstellationError::LeaseNotHeld {
                lease_type,
                holder: lease.node_name,
                term: lease.term,
            }),
            (_, None) => Err(ConstellationError::LeaseNotHeld {
                lease_type,
                holder: "nobody".into(),
                term: 0,
            }),
        }
    }

    fn verified(&self, lease_type: LeaseType, held: &HeldLease) -> bool {
        self.consensus
            .get_lease(lease_type)
            .is_some_and(|lease| lease.node_name == self.consensus.node_name() && lease.lease_id == held.lease_id)
    }

    /// Renew every verified lease. The book is only locked to read the
    /// tracked set and to prune failures, never across a proposal.
    async fn renew_all(&self) {
        let tracked: Vec<(LeaseType, HeldLease)> = {
            let book = self.book.lock().await;
            book.held.iter().map(|(t, h)| (*t, h.clone())).collect()
        };

        let mut failed = Vec::new();
        for (lease_type, held) in tracked {
            if !self.consensus.is_leader() || !self.verified(lease_type, &held) {
                continue;
            }
            match self.consensus.acquire_lease(lease_type, &held.lease_id, held.term).await {
                Ok(_) => trace!(lease = %lease_type, term = held.term, "Renewed lease"),
                Err(e) => {
                    warn!(lease = %lease_type, error = %e, "Lease renewal failed, dropping local tracking");
                    failed.push((lease_type, held));
                }
            }
        }
        if failed.is_empty() {
            return;
        }

        let mut book = self.book.lock().await;
        for (lease_type, held) in failed {
            // re-acquired meanwhile
            if book.held.get(&lease_type) == Some(&held) {
                book.held.remove(&lease_type);
            }
        }
    }

    /// Stop renewing and try to release every tracked lease
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.renewal.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut book = self.book.lock().await;
        for (lease_type, held) in book.held.drain() {
            match self.consensus.release_lease(lease_type, &held.lease_id, held.term).await {
                Ok(()) => info!(lease = %lease_type, "Released lease on shutdown"),
                Err(e) => warn!(lease = %lease_type, error = %e, "Failed to release lease on shutdown"),
            }
        }
    }
}

async fn renewal_loop(manager: Arc<LeaseManager>, mut shutdown: broadcast::Receiver<()>) {
    let period = manager.renewal_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => manager.renew_all().await,
            _ = shutdown.recv() => break,
        }
    }
    debug!("Lease renewal loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::manager::tests::{launch, single_leader, test_config};
    use crate::consensus::raft::rpc::testing::LocalNetwork;
    use crate::consensus::manager::ConsensusConfig;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_first_acquire_uses_term_two() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));

        let lease = leases.acquire_dns_writer_lease().await.unwrap();
        assert_eq!(lease.term, 2);
        assert_eq!(lease.node_name, "node-1");
        assert!(leases.has_lease(LeaseType::DnsWriter).await);

        let token = leases.get_lease_fencing_token(LeaseType::DnsWriter).await.unwrap();
        assert_eq!(token, lease.fencing_token());
    }

    #[tokio::test]
    async fn test_reacquire_renews_with_same_term_and_id() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));

        let first = leases.acquire_lb_leader_lease().await.unwrap();
        let again = leases.acquire_lb_leader_lease().await.unwrap();
        assert_eq!((again.term, &again.lease_id), (first.term, &first.lease_id));
        assert!(again.acquired_at > first.acquired_at);
    }

    #[tokio::test]
    async fn test_terms_are_never_reused() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));

        let dns = leases.acquire_dns_writer_lease().await.unwrap();
        let lb = leases.acquire_lb_leader_lease().await.unwrap();
        assert_eq!((dns.term, lb.term), (2, 3));

        assert_ok!(leases.release_lease(LeaseType::DnsWriter).await);
        assert!(consensus.get_lease(LeaseType::DnsWriter).is_none());
        assert!(leases.has_lease(LeaseType::LbLeader).await);

        let dns = leases.acquire_dns_writer_lease().await.unwrap();
        assert_eq!(dns.term, 4);

        // the lb lease still releases with the term it was granted at
        assert_ok!(leases.release_lease(LeaseType::LbLeader).await);
        assert!(consensus.get_lease(LeaseType::LbLeader).is_none());
    }

    #[tokio::test]
    async fn test_follower_cannot_acquire() {
        let network = LocalNetwork::new();
        let leader = launch(&network, test_config("first"));
        assert_ok!(leader.bootstrap().await);
        assert!(leader.raft().wait_for_leader(Duration::from_secs(3)).await.is_some());
        let follower = launch(
            &network,
            ConsensusConfig {
                seeds: vec!["first:8300".into()],
                ..test_config("second")
            },
        );
        assert_ok!(follower.bootstrap().await);

        let leases = LeaseManager::start(follower, Duration::from_secs(60));
        let err = leases.acquire_dns_writer_lease().await.unwrap_err();
        assert!(matches!(err, ConstellationError::NotLeader { .. }));
        assert!(!leases.has_lease(LeaseType::DnsWriter).await);
        assert_err!(leases.get_lease_fencing_token(LeaseType::DnsWriter).await);
        assert_ok!(leases.release_lease(LeaseType::DnsWriter).await);
    }

    #[tokio::test]
    async fn test_superseded_lease_is_reclaimed_above_observed_term() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));
        let original = leases.acquire_dns_writer_lease().await.unwrap();

        assert_ok!(consensus.acquire_lease(LeaseType::DnsWriter, "intruder", 50).await);
        assert!(!leases.has_lease(LeaseType::DnsWriter).await);
        let err = leases.get_lease_fencing_token(LeaseType::DnsWriter).await.unwrap_err();
        assert!(matches!(err, ConstellationError::LeaseNotHeld { term: 50, .. }));

        let lease = leases.acquire_dns_writer_lease().await.unwrap();
        assert_eq!(lease.term, 51);
        assert_ne!(lease.lease_id, original.lease_id);
        assert!(leases.has_lease(LeaseType::DnsWriter).await);

        // the counter keeps climbing from there
        let lb = leases.acquire_lb_leader_lease().await.unwrap();
        assert_eq!(lb.term, 52);
    }

    #[tokio::test]
    async fn test_failed_acquire_rolls_back_tracking() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));
        consensus.raft().shutdown().await;

        assert_err!(leases.acquire_dns_writer_lease().await);
        assert!(leases.book.lock().await.held.is_empty());
        assert_err!(leases.get_lease_fencing_token(LeaseType::DnsWriter).await);
    }

    #[tokio::test]
    async fn test_renewal_loop_refreshes_held_leases() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_millis(100));
        let lease = leases.acquire_dns_writer_lease().await.unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        let current = consensus.get_lease(LeaseType::DnsWriter).unwrap();
        assert_eq!((current.term, &current.lease_id), (lease.term, &lease.lease_id));
        assert!(current.acquired_at > lease.acquired_at);
    }

    #[tokio::test]
    async fn test_renewal_in_flight_does_not_block_callers() {
        let network = LocalNetwork::new();
        let leader = launch(&network, test_config("first"));
        assert_ok!(leader.bootstrap().await);
        assert!(leader.raft().wait_for_leader(Duration::from_secs(3)).await.is_some());
        let follower = launch(
            &network,
            ConsensusConfig {
                seeds: vec!["first:8300".into()],
                ..test_config("second")
            },
        );
        assert_ok!(follower.bootstrap().await);

        let leases = LeaseManager::start(leader.clone(), Duration::from_secs(60));
        assert_ok!(leases.acquire_dns_writer_lease().await);

        // without a quorum the renewal waits out the commit timeout
        network.disconnect("second:8300");
        let renewal = tokio::spawn({
            let leases = leases.clone();
            async move { leases.renew_all().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!renewal.is_finished());

        let held = tokio::time::timeout(Duration::from_millis(500), leases.has_lease(LeaseType::DnsWriter)).await;
        assert!(assert_ok!(held));

        assert_ok!(renewal.await);
        assert!(leases.book.lock().await.held.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let consensus = single_leader("node-1").await;
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));
        assert_ok!(leases.acquire_dns_writer_lease().await);
        assert_ok!(leases.acquire_lb_leader_lease().await);

        leases.shutdown().await;
        assert!(consensus.get_all_leases().is_empty());
        assert!(!leases.has_lease(LeaseType::DnsWriter).await);
    }
}
