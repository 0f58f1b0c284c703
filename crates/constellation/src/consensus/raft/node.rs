//! Consensus node event loop.
//!
//! [`RaftNode`] owns the log, the hard state and all leader bookkeeping.
//! Local callers and the transport talk to it through a [`RaftHandle`];
//! outbound RPCs run on spawned tasks that report back over an internal
//! channel, so the loop itself never waits on the network.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use constellation_common::{ConstellationError, Result};

use super::rpc::*;
use super::{
    EntryPayload, HardState, LogEntry, LogIndex, NodeId, RaftConfig, RaftLog, RaftStorage, Snapshot, StateMachine,
    Term, Voters,
};

const REQUEST_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, published after every loop iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub voters: Voters,
}

impl RaftStatus {
    fn initial(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: Role::Follower,
            term: 0,
            leader_id: None,
            leader_addr: None,
            commit_index: 0,
            last_applied: 0,
            voters: Voters::new(),
        }
    }

    pub fn is_voter(&self) -> bool {
        self.voters.contains_key(&self.node_id)
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Request<O> {
    Propose {
        data: Vec<u8>,
        respond: Reply<Result<O>>,
    },
    AddVoter {
        id: NodeId,
        addr: String,
        respond: Reply<Result<()>>,
    },
    Bootstrap {
        voters: Voters,
        respond: Reply<Result<()>>,
    },
    RequestVote {
        req: RequestVoteRequest,
        respond: Reply<RequestVoteResponse>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        respond: Reply<AppendEntriesResponse>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        respond: Reply<Result<InstallSnapshotResponse>>,
    },
    Shutdown,
}

/// Replies to RPCs this node sent, tagged with the term they were sent in
enum Event {
    Vote {
        term: Term,
        from: NodeId,
        resp: Result<RequestVoteResponse>,
    },
    Append {
        term: Term,
        peer: NodeId,
        resp: Result<AppendEntriesResponse>,
    },
    Snapshot {
        term: Term,
        peer: NodeId,
        last_included_index: LogIndex,
        resp: Result<InstallSnapshotResponse>,
    },
}

/// Cloneable entry point to a running node
pub struct RaftHandle<O> {
    node_id: NodeId,
    tx: mpsc::Sender<Request<O>>,
    status: watch::Receiver<RaftStatus>,
}

impl<O> Clone for RaftHandle<O> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            tx: self.tx.clone(),
            status: self.status.clone(),
        }
    }
}

impl<O: Send + 'static> RaftHandle<O> {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request<O>) -> Result<T> {
        let (respond, rx) = oneshot::channel();
        self.tx.send(make(respond)).await.map_err(|_| ConstellationError::Shutdown)?;
        rx.await.map_err(|_| ConstellationError::Shutdown)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append a command and wait until it is committed and applied
    pub async fn propose(&self, data: Vec<u8>, timeout: Duration) -> Result<O> {
        match tokio::time::timeout(timeout, self.call(|respond| Request::Propose { data, respond })).await {
            Ok(result) => result?,
            Err(_) => Err(ConstellationError::Timeout(format!(
                "command not committed within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Add (or re-address) a voter. Leader only; returns once committed.
    pub async fn add_voter(&self, id: impl Into<NodeId>, addr: impl Into<String>) -> Result<()> {
        let (id, addr) = (id.into(), addr.into());
        self.call(|respond| Request::AddVoter { id, addr, respond }).await?
    }

    /// Seed an empty node with an initial voter set
    pub async fn bootstrap(&self, voters: Voters) -> Result<()> {
        self.call(|respond| Request::Bootstrap { voters, respond }).await?
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|respond| Request::RequestVote { req, respond }).await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|respond| Request::AppendEntries { req, respond }).await
    }

    /// Fails when the snapshot could not be persisted or applied
    pub async fn install_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.call(|respond| Request::InstallSnapshot { req, respond }).await?
    }

    /// Serve a peer's join request: add it if we lead, otherwise point it at the leader
    pub async fn handle_join(&self, req: JoinRequest) -> JoinResponse {
        let status = self.status();
        if status.role != Role::Leader {
            return JoinResponse {
                accepted: false,
                leader_addr: status.leader_addr,
                error: Some("not the leader".into()),
            };
        }

        info!(peer = %req.node_id, addr = %req.addr, "Adding voter on join request");
        match self.add_voter(req.node_id, req.addr).await {
            Ok(()) => JoinResponse {
                accepted: true,
                leader_addr: self.status().leader_addr,
                error: None,
            },
            Err(e) => JoinResponse {
                accepted: false,
                leader_addr: self.status().leader_addr,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Current leader's id and transport address, if known
    pub fn leader(&self) -> Option<(NodeId, String)> {
        let status = self.status.borrow();
        status.leader_id.clone().zip(status.leader_addr.clone())
    }

    /// Wait until some leader is known
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<RaftStatus> {
        let mut rx = self.status.clone();
        let wait = async move {
            rx.wait_for(|s| s.leader_id.is_some())
                .await
                .map(|status| (*status).clone())
                .ok()
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    inflight: bool,
}

/// A single consensus participant
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    storage: Arc<dyn RaftStorage>,
    rpc: Arc<dyn RaftRpc>,
    state_machine: Arc<RwLock<S>>,

    log: RaftLog,
    hard: HardState,
    role: Role,
    leader_id: Option<NodeId>,
    leader_addr: Option<String>,
    voters: Voters,
    /// Voters covered by the latest snapshot
    snapshot_voters: Voters,
    commit_index: LogIndex,
    last_applied: LogIndex,

    votes: HashSet<NodeId>,
    progress: HashMap<NodeId, Progress>,
    proposals: BTreeMap<LogIndex, (Term, Reply<Result<S::Output>>)>,
    voter_changes: BTreeMap<LogIndex, (Term, Reply<Result<()>>)>,
    election_deadline: Instant,

    events: mpsc::UnboundedSender<Event>,
    status_tx: watch::Sender<RaftStatus>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Recover state from `storage` and start the event loop.
    pub fn spawn(
        config: RaftConfig,
        storage: Arc<dyn RaftStorage>,
        rpc: Arc<dyn RaftRpc>,
        state_machine: Arc<RwLock<S>>,
    ) -> Result<RaftHandle<S::Output>> {
        let hard = storage.load_hard_state()?;
        let entries = storage.load_entries()?;
        let (log, snapshot_voters) = match storage.load_snapshot()? {
            Some(snapshot) => {
                state_machine.write().restore(&snapshot.data)?;
                let log = RaftLog::restore(snapshot.last_included_index, snapshot.last_included_term, entries)?;
                (log, snapshot.voters)
            }
            None => (RaftLog::restore(0, 0, entries)?, Voters::new()),
        };

        let (tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RaftStatus::initial(config.node_id.clone()));

        let applied = log.snapshot_index();
        let mut node = Self {
            election_deadline: Instant::now() + config.random_election_timeout(),
            config,
            storage,
            rpc,
            state_machine,
            log,
            hard,
            role: Role::Follower,
            leader_id: None,
            leader_addr: None,
            voters: Voters::new(),
            snapshot_voters,
            commit_index: applied,
            last_applied: applied,
            votes: HashSet::new(),
            progress: HashMap::new(),
            proposals: BTreeMap::new(),
            voter_changes: BTreeMap::new(),
            events,
            status_tx,
        };
        node.refresh_voters();
        node.publish_status();

        info!(
            node = %node.config.node_id,
            term = node.hard.current_term,
            last_index = node.log.last_index(),
            voters = node.voters.len(),
            "Consensus node starting"
        );

        let handle = RaftHandle {
            node_id: node.config.node_id.clone(),
            tx,
            status,
        };
        tokio::spawn(node.run(requests, events_rx));
        Ok(handle)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request<S::Output>>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let leading = self.role == Role::Leader;

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = heartbeat.tick(), if leading => self.replicate_all(),
                _ = tokio::time::sleep_until(self.election_deadline), if !leading => self.on_election_timeout(),
            }

            self.apply_committed();
            self.maybe_snapshot();
            self.publish_status();
        }

        self.fail_pending(ConstellationError::Shutdown);
        info!(node = %self.config.node_id, "Consensus node stopped");
    }

    fn handle_request(&mut self, request: Request<S::Output>) {
        match request {
            Request::Propose { data, respond } => self.propose(data, respond),
            Request::AddVoter { id, addr, respond } => self.add_voter(id, addr, respond),
            Request::Bootstrap { voters, respond } => {
                let _ = respond.send(self.bootstrap(voters));
            }
            Request::RequestVote { req, respond } => {
                let _ = respond.send(self.handle_request_vote(req));
            }
            Request::AppendEntries { req, respond } => {
                let _ = respond.send(self.handle_append_entries(req));
            }
            Request::InstallSnapshot { req, respond } => {
                let _ = respond.send(self.handle_install_snapshot(req));
            }
            Request::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Vote { term, from, resp } => self.on_vote(term, from, resp),
            Event::Append { term, peer, resp } => self.on_append(term, peer, resp),
            Event::Snapshot {
                term,
                peer,
                last_included_index,
                resp,
            } => self.on_snapshot(term, peer, last_included_index, resp),
        }
    }

    // ----- local requests -----

    fn propose(&mut self, data: Vec<u8>, respond: Reply<Result<S::Output>>) {
        if self.role != Role::Leader {
            let _ = respond.send(Err(self.not_leader()));
            return;
        }

        match self.append_local(EntryPayload::Command(data)) {
            Ok(index) => {
                self.proposals.insert(index, (self.hard.current_term, respond));
                self.replicate_all();
                self.advance_commit();
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    fn add_voter(&mut self, id: NodeId, addr: String, respond: Reply<Result<()>>) {
        if self.role != Role::Leader {
            let _ = respond.send(Err(self.not_leader()));
            return;
        }
        if self.voters.get(&id) == Some(&addr) {
            let _ = respond.send(Ok(()));
            return;
        }
        if self.membership_change_pending() {
            let _ = respond.send(Err(ConstellationError::Membership(
                "another membership change is in progress".into(),
            )));
            return;
        }

        let mut voters = self.voters.clone();
        voters.insert(id.clone(), addr.clone());
        match self.append_local(EntryPayload::Membership(voters)) {
            Ok(index) => {
                info!(peer = %id, addr = %addr, index, "Proposed voter addition");
                self.voter_changes.insert(index, (self.hard.current_term, respond));
                self.refresh_voters();
                self.replicate_all();
                self.advance_commit();
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    fn bootstrap(&mut self, voters: Voters) -> Result<()> {
        if !self.voters.is_empty() || self.log.last_index() > 0 {
            if self.voters.contains_key(&self.config.node_id) {
                return Ok(());
            }
            return Err(ConstellationError::Membership(
                "node already holds consensus state".into(),
            ));
        }
        if !voters.contains_key(&self.config.node_id) {
            return Err(ConstellationError::Config(
                "bootstrap voter set must include this node".into(),
            ));
        }

        if self.hard.current_term < 1 {
            self.hard.current_term = 1;
            self.hard.voted_for = None;
            self.persist_hard_state()?;
        }
        let entry = LogEntry::new(1, 1, EntryPayload::Membership(voters));
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.append(entry)?;
        self.commit_index = 1;
        self.refresh_voters();

        info!(node = %self.config.node_id, voters = self.voters.len(), "Bootstrapped consensus cluster");
        if self.voters.len() == 1 {
            self.election_deadline = Instant::now();
        }
        Ok(())
    }

    // ----- elections -----

    fn on_election_timeout(&mut self) {
        self.reset_election_deadline();
        if !self.voters.contains_key(&self.config.node_id) {
            return;
        }
        self.start_election();
    }

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.hard.current_term += 1;
        self.hard.voted_for = Some(self.config.node_id.clone());
        self.leader_id = None;
        self.leader_addr = None;
        if let Err(e) = self.persist_hard_state() {
            error!(error = %e, "Failed to persist vote, abandoning election");
            self.role = Role::Follower;
            return;
        }

        let term = self.hard.current_term;
        self.votes = HashSet::from([self.config.node_id.clone()]);
        info!(node = %self.config.node_id, term, "Starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let req = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for (peer, addr) in self.peers() {
            let rpc = self.rpc.clone();
            let events = self.events.clone();
            let req = req.clone();
            let limit = self.config.rpc_timeout;
            tokio::spawn(async move {
                let resp = with_timeout(limit, rpc.request_vote(&addr, req)).await;
                let _ = events.send(Event::Vote { term, from: peer, resp });
            });
        }
    }

    fn on_vote(&mut self, term: Term, from: NodeId, resp: Result<RequestVoteResponse>) {
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                debug!(peer = %from, error = %e, "Vote request failed");
                return;
            }
        };
        if resp.term > self.hard.current_term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Candidate || term != self.hard.current_term || !resp.vote_granted {
            return;
        }

        self.votes.insert(from);
        let granted = self.votes.iter().filter(|id| self.voters.contains_key(*id)).count();
        if granted >= self.quorum() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.config.node_id.clone());
        self.leader_addr = Some(self.config.advertise_addr.clone());
        self.progress.clear();
        self.ensure_progress();

        info!(node = %self.config.node_id, term = self.hard.current_term, "Became leader");

        if let Err(e) = self.append_local(EntryPayload::Blank) {
            error!(error = %e, "Failed to append leader blank entry");
        }
        self.replicate_all();
        self.advance_commit();
    }

    /// Adopt `term` (if newer) and fall back to follower
    fn become_follower(&mut self, term: Term) {
        if term > self.hard.current_term {
            self.hard.current_term = term;
            self.hard.voted_for = None;
            self.leader_id = None;
            self.leader_addr = None;
            if let Err(e) = self.persist_hard_state() {
                error!(error = %e, term, "Failed to persist term");
            }
        }
        if self.role == Role::Leader {
            info!(node = %self.config.node_id, term, "Stepping down as leader");
            let leader = self.leader_id.clone().filter(|id| id != &self.config.node_id);
            self.leader_id = leader;
            self.fail_pending(ConstellationError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }
        self.role = Role::Follower;
        self.votes.clear();
    }

    // ----- replication (leader side) -----

    fn replicate_all(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        for (peer, addr) in self.peers() {
            self.replicate_to(peer, addr);
        }
    }

    fn replicate_to(&mut self, peer: NodeId, addr: String) {
        let next = match self.progress.get(&peer) {
            Some(p) if !p.inflight => p.next_index,
            _ => return,
        };
        if next <= self.log.snapshot_index() {
            self.send_snapshot(peer, addr);
            return;
        }

        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            self.send_snapshot(peer, addr);
            return;
        };

        let req = AppendEntriesRequest {
            term: self.hard.current_term,
            leader_id: self.config.node_id.clone(),
            leader_addr: self.config.advertise_addr.clone(),
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, self.config.max_entries_per_rpc),
            leader_commit: self.commit_index,
        };
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = true;
        }

        let term = self.hard.current_term;
        let rpc = self.rpc.clone();
        let events = self.events.clone();
        let limit = self.config.rpc_timeout;
        tokio::spawn(async move {
            let resp = with_timeout(limit, rpc.append_entries(&addr, req)).await;
            let _ = events.send(Event::Append { term, peer, resp });
        });
    }

    fn send_snapshot(&mut self, peer: NodeId, addr: String) {
        let snapshot = match self.storage.load_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                error!(peer = %peer, "Peer needs compacted entries but no snapshot is stored");
                return;
            }
            Err(e) => {
                error!(peer = %peer, error = %e, "Failed to load snapshot for transfer");
                return;
            }
        };
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = true;
        }

        debug!(peer = %peer, index = snapshot.last_included_index, "Sending snapshot");
        let term = self.hard.current_term;
        let last_included_index = snapshot.last_included_index;
        let req = InstallSnapshotRequest {
            term,
            leader_id: self.config.node_id.clone(),
            leader_addr: self.config.advertise_addr.clone(),
            last_included_index,
            last_included_term: snapshot.last_included_term,
            voters: snapshot.voters,
            data: snapshot.data,
        };
        let rpc = self.rpc.clone();
        let events = self.events.clone();
        let limit = self.config.rpc_timeout;
        tokio::spawn(async move {
            let resp = with_timeout(limit, rpc.install_snapshot(&addr, req)).await;
            let _ = events.send(Event::Snapshot {
                term,
                peer,
                last_included_index,
                resp,
            });
        });
    }

    fn on_append(&mut self, term: Term, peer: NodeId, resp: Result<AppendEntriesResponse>) {
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = false;
        }
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Append entries failed");
                return;
            }
        };
        if resp.term > self.hard.current_term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Leader || term != self.hard.current_term {
            return;
        }

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&peer) else {
            return;
        };
        let resend = if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index);
            progress.next_index = progress.match_index + 1;
            progress.next_index <= last_index
        } else {
            let previous = progress.next_index;
            let fallback = previous.saturating_sub(1);
            progress.next_index = resp.conflict_index.unwrap_or(fallback).clamp(1, last_index + 1);
            progress.next_index < previous
        };

        if resp.success {
            self.advance_commit();
        }
        if resend {
            if let Some(addr) = self.voters.get(&peer).cloned() {
                self.replicate_to(peer, addr);
            }
        }
    }

    fn on_snapshot(
        &mut self,
        term: Term,
        peer: NodeId,
        last_included_index: LogIndex,
        resp: Result<InstallSnapshotResponse>,
    ) {
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = false;
        }
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Snapshot transfer failed");
                return;
            }
        };
        if resp.term > self.hard.current_term {
            self.become_follower(resp.term);
            return;
        }
        if self.role != Role::Leader || term != self.hard.current_term {
            return;
        }

        if let Some(p) = self.progress.get_mut(&peer) {
            p.match_index = p.match_index.max(last_included_index);
            p.next_index = p.match_index + 1;
        }
        self.advance_commit();
        if let Some(addr) = self.voters.get(&peer).cloned() {
            self.replicate_to(peer, addr);
        }
    }

    /// Commit the highest current-term index stored on a majority of voters
    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let quorum = self.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index && self.log.term_at(index) == Some(self.hard.current_term) {
            let acks = self
                .voters
                .keys()
                .filter(|id| {
                    *id == &self.config.node_id || self.progress.get(*id).is_some_and(|p| p.match_index >= index)
                })
                .count();
            if acks >= quorum {
                debug!(commit_index = index, "Advanced commit index");
                self.commit_index = index;
                return;
            }
            index -= 1;
        }
    }

    // ----- incoming RPCs (follower side) -----

    fn handle_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        if req.term > self.hard.current_term {
            self.become_follower(req.term);
        }

        let mut vote_granted = req.term == self.hard.current_term
            && self.hard.voted_for.as_ref().is_none_or(|id| id == &req.candidate_id)
            && self.log.is_up_to_date(req.last_log_index, req.last_log_term);

        if vote_granted {
            self.hard.voted_for = Some(req.candidate_id.clone());
            match self.persist_hard_state() {
                Ok(()) => self.reset_election_deadline(),
                Err(e) => {
                    error!(error = %e, "Failed to persist vote");
                    vote_granted = false;
                }
            }
        }

        debug!(candidate = %req.candidate_id, term = req.term, vote_granted, "Handled vote request");
        RequestVoteResponse {
            term: self.hard.current_term,
            vote_granted,
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let term = self.hard.current_term;
        let reject = |term: Term, conflict_index: Option<LogIndex>| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if req.term < term {
            return reject(term, None);
        }
        if req.term > term || self.role != Role::Follower {
            self.become_follower(req.term);
        }
        let term = self.hard.current_term;
        self.follow(&req.leader_id, &req.leader_addr);

        if req.prev_log_index < self.log.snapshot_index() {
            return reject(term, Some(self.log.last_index() + 1));
        }
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict = match self.log.term_at(req.prev_log_index) {
                None => self.log.last_index() + 1,
                Some(conflict_term) => {
                    let mut index = req.prev_log_index;
                    while index > self.log.first_index() && self.log.term_at(index - 1) == Some(conflict_term) {
                        index -= 1;
                    }
                    index
                }
            };
            return reject(term, Some(conflict));
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if fresh.is_empty() {
                match self.log.term_at(entry.index) {
                    Some(existing) if existing == entry.term => continue,
                    Some(_) => {
                        if let Err(e) = self.storage.truncate_from(entry.index) {
                            error!(error = %e, index = entry.index, "Failed to truncate conflicting entries");
                            return reject(term, None);
                        }
                        self.log.truncate_from(entry.index);
                    }
                    None => {}
                }
            }
            fresh.push(entry);
        }

        if !fresh.is_empty() {
            if let Err(e) = self.storage.append_entries(&fresh) {
                error!(error = %e, count = fresh.len(), "Failed to persist replicated entries");
                return reject(term, Some(self.log.last_index() + 1));
            }
            for entry in fresh {
                if let Err(e) = self.log.append(entry) {
                    error!(error = %e, "Replicated entry rejected by local log");
                    break;
                }
            }
        }
        self.refresh_voters();

        let commit = req.leader_commit.min(match_index);
        if commit > self.commit_index {
            self.commit_index = commit;
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index,
            conflict_index: None,
        }
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        if req.term < self.hard.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.hard.current_term,
            });
        }
        if req.term > self.hard.current_term || self.role != Role::Follower {
            self.become_follower(req.term);
        }
        self.follow(&req.leader_id, &req.leader_addr);

        if req.last_included_index > self.commit_index {
            if let Err(e) = self.install_snapshot(req) {
                error!(error = %e, "Failed to install snapshot");
                return Err(e);
            }
        }
        Ok(InstallSnapshotResponse {
            term: self.hard.current_term,
        })
    }

    fn install_snapshot(&mut self, req: InstallSnapshotRequest) -> Result<()> {
        let snapshot = Snapshot {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            voters: req.voters,
            data: req.data,
        };
        let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);

        // Durable before anything in memory moves
        self.storage.save_snapshot(&snapshot)?;
        if self.log.matches(index, term) {
            self.log.compact(index, term);
        } else {
            self.storage.truncate_from(0)?;
            self.log.reset(index, term);
        }
        self.state_machine.write().restore(&snapshot.data)?;

        self.snapshot_voters = snapshot.voters;
        self.last_applied = index;
        self.commit_index = self.commit_index.max(index);
        self.refresh_voters();

        info!(index, term, "Installed snapshot from leader");
        Ok(())
    }

    // ----- applying and compaction -----

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                warn!(index, "Committed entry missing from log");
                break;
            };

            match entry.payload {
                EntryPayload::Command(data) => {
                    let output = self.state_machine.write().apply(index, &data);
                    if let Some((term, respond)) = self.proposals.remove(&index) {
                        let _ = if term == entry.term {
                            respond.send(Ok(output))
                        } else {
                            respond.send(Err(self.not_leader()))
                        };
                    }
                }
                EntryPayload::Membership(_) => {
                    if let Some((term, respond)) = self.voter_changes.remove(&index) {
                        let _ = if term == entry.term {
                            respond.send(Ok(()))
                        } else {
                            respond.send(Err(self.not_leader()))
                        };
                    }
                }
                EntryPayload::Blank => {}
            }
            self.last_applied = index;
        }
    }

    fn maybe_snapshot(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.last_applied.saturating_sub(self.log.snapshot_index()) < threshold {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            warn!(error = %e, "Snapshot failed");
        }
    }

    fn take_snapshot(&mut self) -> Result<()> {
        let index = self.last_applied;
        let term = self
            .log
            .term_at(index)
            .ok_or_else(|| ConstellationError::Internal(format!("no term for applied index {index}")))?;
        let voters = self
            .log
            .membership_at(index)
            .map(|(_, voters)| voters)
            .unwrap_or_else(|| self.snapshot_voters.clone());
        let data = self.state_machine.read().snapshot()?;

        self.storage.save_snapshot(&Snapshot {
            last_included_index: index,
            last_included_term: term,
            voters: voters.clone(),
            data,
        })?;
        self.log.compact(index, term);
        self.snapshot_voters = voters;

        info!(index, term, "Compacted consensus log");
        Ok(())
    }

    // ----- helpers -----

    fn append_local(&mut self, payload: EntryPayload) -> Result<LogIndex> {
        let entry = LogEntry::new(self.hard.current_term, self.log.last_index() + 1, payload);
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.log.append(entry)?;
        Ok(index)
    }

    fn follow(&mut self, leader_id: &str, leader_addr: &str) {
        if self.leader_id.as_deref() != Some(leader_id) {
            info!(leader = %leader_id, term = self.hard.current_term, "Following leader");
        }
        self.leader_id = Some(leader_id.to_string());
        self.leader_addr = Some(leader_addr.to_string());
        self.reset_election_deadline();
    }

    fn refresh_voters(&mut self) {
        self.voters = self
            .log
            .latest_membership()
            .map(|(_, voters)| voters)
            .unwrap_or_else(|| self.snapshot_voters.clone());
        if self.role == Role::Leader {
            self.ensure_progress();
        }
    }

    fn ensure_progress(&mut self) {
        let next_index = self.log.last_index() + 1;
        for (peer, _) in self.peers() {
            self.progress.entry(peer).or_insert(Progress {
                next_index,
                match_index: 0,
                inflight: false,
            });
        }
    }

    fn membership_change_pending(&self) -> bool {
        self.log
            .latest_membership()
            .is_some_and(|(index, _)| index > self.commit_index)
    }

    fn peers(&self) -> Vec<(NodeId, String)> {
        self.voters
            .iter()
            .filter(|(id, _)| *id != &self.config.node_id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn not_leader(&self) -> ConstellationError {
        ConstellationError::NotLeader {
            leader: self.leader_id.clone(),
        }
    }

    fn fail_pending(&mut self, err: ConstellationError) {
        for (_, (_, respond)) in std::mem::take(&mut self.proposals) {
            let _ = respond.send(Err(err.clone()));
        }
        for (_, (_, respond)) in std::mem::take(&mut self.voter_changes) {
            let _ = respond.send(Err(err.clone()));
        }
    }

    fn persist_hard_state(&self) -> Result<()> {
        self.storage.save_hard_state(&self.hard)
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.config.node_id.clone(),
            role: self.role,
            term: self.hard.current_term,
            leader_id: self.leader_id.clone(),
            leader_addr: self.leader_addr.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            voters: self.voters.clone(),
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(ConstellationError::Timeout(format!(
            "rpc timed out after {}ms",
            limit.as_millis()
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::raft::rpc::testing::{LocalNetwork, LocalRpc};
    use crate::consensus::raft::{FileStorage, MemStorage};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Recorder {
        applied: Vec<Vec<u8>>,
    }

    impl StateMachine for Recorder {
        type Output = usize;

        fn apply(&mut self, _index: LogIndex, command: &[u8]) -> usize {
            self.applied.push(command.to_vec());
            self.applied.len()
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.applied)?)
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.applied = serde_json::from_slice(snapshot)?;
            Ok(())
        }
    }

    struct TestNode {
        handle: RaftHandle<usize>,
        sm: Arc<RwLock<Recorder>>,
    }

    fn addr(id: &str) -> String {
        format!("{id}:8300")
    }

    fn config(id: &str) -> RaftConfig {
        RaftConfig {
            node_id: id.to_string(),
            advertise_addr: addr(id),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(40),
            rpc_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn voters(ids: &[&str]) -> Voters {
        ids.iter().map(|id| (id.to_string(), addr(id))).collect()
    }

    fn spawn(network: &Arc<LocalNetwork<usize>>, config: RaftConfig, storage: Arc<dyn RaftStorage>) -> TestNode {
        let sm = Arc::new(RwLock::new(Recorder::default()));
        let rpc = Arc::new(LocalRpc {
            local_addr: config.advertise_addr.clone(),
            network: network.clone(),
        });
        let advertise = config.advertise_addr.clone();
        let handle = RaftNode::spawn(config, storage, rpc, sm.clone()).unwrap();
        network.register(&advertise, handle.clone());
        TestNode { handle, sm }
    }

    fn spawn_mem(network: &Arc<LocalNetwork<usize>>, id: &str) -> TestNode {
        spawn(network, config(id), Arc::new(MemStorage::new()))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn cluster(network: &Arc<LocalNetwork<usize>>, ids: &[&str]) -> Vec<TestNode> {
        let nodes: Vec<TestNode> = ids.iter().map(|id| spawn_mem(network, id)).collect();
        for node in &nodes {
            assert_ok!(node.handle.bootstrap(voters(ids)).await);
        }
        nodes
    }

    fn leader_of(nodes: &[TestNode]) -> Option<usize> {
        nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.handle.is_leader())
            .max_by_key(|(_, n)| n.handle.status().term)
            .map(|(i, _)| i)
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_commits() {
        let network = LocalNetwork::new();
        let node = spawn_mem(&network, "n1");
        assert_ok!(node.handle.bootstrap(voters(&["n1"])).await);

        let status = node.handle.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        assert_eq!(status.leader_id.as_deref(), Some("n1"));
        assert!(status.is_voter());

        let applied = node.handle.propose(b"one".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(node.sm.read().applied, vec![b"one".to_vec()]);

        node.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let network = LocalNetwork::new();
        let node = spawn_mem(&network, "n1");
        assert_ok!(node.handle.bootstrap(voters(&["n1"])).await);
        assert_ok!(node.handle.bootstrap(voters(&["n1"])).await);

        let other = spawn_mem(&network, "n2");
        let err = other.handle.bootstrap(voters(&["n1"])).await.unwrap_err();
        assert!(matches!(err, ConstellationError::Config(_)));
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let network = LocalNetwork::new();
        let node = spawn_mem(&network, "lonely");

        let err = node.handle.propose(b"x".to_vec(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ConstellationError::NotLeader { leader: None });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_three_nodes_elect_and_replicate() {
        let network = LocalNetwork::new();
        let nodes = cluster(&network, &["a", "b", "c"]).await;

        assert!(eventually(|| leader_of(&nodes).is_some()).await);
        let leader = leader_of(&nodes).unwrap();
        let leader_id = nodes[leader].handle.node_id().to_string();

        for i in 0..5u8 {
            assert_ok!(nodes[leader].handle.propose(vec![i], Duration::from_secs(2)).await);
        }

        assert!(eventually(|| nodes.iter().all(|n| n.sm.read().applied.len() == 5)).await);
        for node in &nodes {
            assert_eq!(node.sm.read().applied, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
            assert_eq!(node.handle.status().leader_id.as_deref(), Some(leader_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_partitioned_leader_is_replaced() {
        let network = LocalNetwork::new();
        let nodes = cluster(&network, &["a", "b", "c"]).await;
        assert!(eventually(|| leader_of(&nodes).is_some()).await);

        let old = leader_of(&nodes).unwrap();
        let old_term = nodes[old].handle.status().term;
        network.disconnect(&addr(nodes[old].handle.node_id()));

        let stranded = nodes[old].handle.propose(b"lost".to_vec(), Duration::from_millis(500)).await;
        assert_err!(stranded);

        let others: Vec<&TestNode> = nodes.iter().enumerate().filter(|(i, _)| *i != old).map(|(_, n)| n).collect();
        assert!(eventually(|| others.iter().any(|n| n.handle.is_leader() && n.handle.status().term > old_term)).await);

        let new_leader = others.iter().find(|n| n.handle.is_leader()).unwrap();
        assert_ok!(new_leader.handle.propose(b"kept".to_vec(), Duration::from_secs(2)).await);

        network.reconnect(&addr(nodes[old].handle.node_id()));
        assert!(eventually(|| !nodes[old].handle.is_leader()).await);
        assert!(eventually(|| nodes[old].sm.read().applied == vec![b"kept".to_vec()]).await);
    }

    #[tokio::test]
    async fn test_join_adds_voter_and_catches_up_via_snapshot() {
        let network = LocalNetwork::new();
        let first = spawn(
            &network,
            RaftConfig {
                snapshot_threshold: 3,
                ..config("first")
            },
            Arc::new(MemStorage::new()),
        );
        assert_ok!(first.handle.bootstrap(voters(&["first"])).await);
        assert!(first.handle.wait_for_leader(Duration::from_secs(3)).await.is_some());

        for i in 0..6u8 {
            assert_ok!(first.handle.propose(vec![i], Duration::from_secs(1)).await);
        }

        let second = spawn_mem(&network, "second");
        let refused = second
            .handle
            .handle_join(JoinRequest {
                node_id: "x".into(),
                addr: addr("x"),
            })
            .await;
        assert!(!refused.accepted);

        let resp = first
            .handle
            .handle_join(JoinRequest {
                node_id: "second".into(),
                addr: addr("second"),
            })
            .await;
        assert!(resp.accepted, "join refused: {:?}", resp.error);
        assert_eq!(resp.leader_addr, Some(addr("first")));

        assert!(eventually(|| second.sm.read().applied.len() == 6).await);
        assert!(eventually(|| second.handle.status().is_voter()).await);
        assert_eq!(second.handle.status().leader_id.as_deref(), Some("first"));
    }

    /// Memory storage whose snapshot writes can be made to fail
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemStorage,
        fail_snapshots: std::sync::atomic::AtomicBool,
    }

    impl RaftStorage for FlakyStorage {
        fn load_hard_state(&self) -> Result<HardState> {
            self.inner.load_hard_state()
        }

        fn save_hard_state(&self, state: &HardState) -> Result<()> {
            self.inner.save_hard_state(state)
        }

        fn load_entries(&self) -> Result<Vec<LogEntry>> {
            self.inner.load_entries()
        }

        fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
            self.inner.append_entries(entries)
        }

        fn truncate_from(&self, index: LogIndex) -> Result<()> {
            self.inner.truncate_from(index)
        }

        fn load_snapshot(&self) -> Result<Option<Snapshot>> {
            self.inner.load_snapshot()
        }

        fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            if self.fail_snapshots.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ConstellationError::Storage("disk full".into()));
            }
            self.inner.save_snapshot(snapshot)
        }
    }

    #[tokio::test]
    async fn test_failed_snapshot_install_leaves_state_untouched() {
        let network = LocalNetwork::new();
        let storage = Arc::new(FlakyStorage::default());
        storage.fail_snapshots.store(true, std::sync::atomic::Ordering::SeqCst);
        let node = spawn(&network, config("n2"), storage.clone());

        let applied = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let req = InstallSnapshotRequest {
            term: 1,
            leader_id: "n1".into(),
            leader_addr: addr("n1"),
            last_included_index: 3,
            last_included_term: 1,
            voters: voters(&["n1", "n2"]),
            data: serde_json::to_vec(&applied).unwrap(),
        };

        // The leader sees the same error through its transport
        let rpc = LocalRpc {
            local_addr: addr("n1"),
            network: network.clone(),
        };
        assert_err!(rpc.install_snapshot(&addr("n2"), req.clone()).await);

        let status = node.handle.status();
        assert_eq!(status.commit_index, 0);
        assert_eq!(status.last_applied, 0);
        assert!(node.sm.read().applied.is_empty());
        assert!(assert_ok!(storage.load_snapshot()).is_none());

        storage.fail_snapshots.store(false, std::sync::atomic::Ordering::SeqCst);
        let resp = assert_ok!(node.handle.install_snapshot(req).await);
        assert_eq!(resp.term, 1);

        assert!(eventually(|| node.handle.status().last_applied == 3).await);
        assert_eq!(node.handle.status().commit_index, 3);
        assert_eq!(node.sm.read().applied, applied);
        assert_eq!(assert_ok!(storage.load_snapshot()).unwrap().last_included_index, 3);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let network = LocalNetwork::new();

        let node = spawn(&network, config("n1"), Arc::new(FileStorage::open(dir.path()).unwrap()));
        assert_ok!(node.handle.bootstrap(voters(&["n1"])).await);
        assert!(node.handle.wait_for_leader(Duration::from_secs(3)).await.is_some());
        assert_ok!(node.handle.propose(b"durable".to_vec(), Duration::from_secs(1)).await);
        let term = node.handle.status().term;
        node.handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let restarted = spawn(&network, config("n1"), Arc::new(FileStorage::open(dir.path()).unwrap()));
        assert!(eventually(|| restarted.handle.status().is_voter()).await);
        assert!(restarted.handle.wait_for_leader(Duration::from_secs(3)).await.is_some());
        assert!(eventually(|| restarted.sm.read().applied == vec![b"durable".to_vec()]).await);
        assert!(restarted.handle.status().term > term);
    }
}
