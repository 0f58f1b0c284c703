//! SWIM-style membership over UDP.
//!
//! Each node probes one random member per probe interval; a member that
//! misses its ack is suspected, and declared dead once suspected for
//! `suspicion_mult` probe intervals. Delegate broadcasts are pushed to a few
//! random members every gossip interval, split into ordered chunks that the
//! receiver reassembles. Full state and member lists are exchanged on join
//! and periodically (push/pull) for anti-entropy.

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};

use constellation_common::constants::{
    MAX_BROADCAST_CHUNKS, MAX_DATAGRAM_SIZE, META_MAX_SIZE, UDP_PACKET_BUDGET,
};

use super::delegate::{EventDelegate, GossipDelegate};

/// Incomplete chunk sets are discarded after this long
const PARTIAL_TTL: Duration = Duration::from_secs(10);

/// Dead or departed members are not re-learned second-hand for this long
const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Fixed bincode framing around a broadcast chunk, excluding the sender name
const BROADCAST_FRAME_OVERHEAD: usize = 32;

/// Membership engine configuration
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// Unique node name
    pub name: String,
    /// Local bind address
    pub bind_addr: SocketAddr,
    /// Address peers should use to reach us (defaults to the bound address)
    pub advertise_addr: Option<SocketAddr>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    /// Members receiving each broadcast
    pub gossip_nodes: usize,
    /// Probe intervals a suspect survives before it is declared dead
    pub suspicion_mult: u32,
    pub push_pull_interval: Duration,
    /// Bound on a join/push-pull round trip
    pub connect_timeout: Duration,
    pub meta_max_size: usize,
    pub packet_budget: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            advertise_addr: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            meta_max_size: META_MAX_SIZE,
            packet_budget: UDP_PACKET_BUDGET,
        }
    }
}

/// A cluster member as seen by the delegates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    /// Metadata advertised by the member
    pub meta: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Suspect,
}

#[derive(Clone, Debug)]
struct MemberState {
    member: Member,
    incarnation: u64,
    status: MemberStatus,
    suspect_since: Option<Instant>,
}

/// How a node describes itself on the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeAnnounce {
    name: String,
    addr: SocketAddr,
    incarnation: u64,
    meta: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Ping {
        seq: u32,
        from: NodeAnnounce,
    },
    Ack {
        seq: u32,
        from: NodeAnnounce,
    },
    Broadcast {
        from: String,
        seq: u32,
        part: u16,
        total: u16,
        payload: Vec<u8>,
    },
    PushPull {
        seq: u32,
        from: NodeAnnounce,
        join: bool,
        reply: bool,
        members: Vec<NodeAnnounce>,
        state: Vec<u8>,
    },
    Leave {
        name: String,
        incarnation: u64,
    },
}

struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

enum Change {
    Joined(Member),
    Updated(Member),
}

/// Running membership engine
pub struct Membership<D: GossipDelegate, E: EventDelegate> {
    config: MembershipConfig,
    local_addr: SocketAddr,
    socket: UdpSocket,
    delegate: Arc<D>,
    events: Arc<E>,
    members: RwLock<HashMap<String, MemberState>>,
    tombstones: Mutex<HashMap<String, (u64, Instant)>>,
    local_meta: RwLock<Vec<u8>>,
    incarnation: AtomicU64,
    seq: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    partials: Mutex<HashMap<(String, u32), Partial>>,
    left: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl<D: GossipDelegate, E: EventDelegate> Membership<D, E> {
    /// Bind the socket, register the local node, and start the background loops
    pub async fn create(config: MembershipConfig, delegate: Arc<D>, events: Arc<E>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind membership socket on {}", config.bind_addr))?;
        let bound = socket.local_addr().context("Failed to read bound address")?;

        let local_addr = match config.advertise_addr {
            Some(mut addr) => {
                if addr.port() == 0 {
                    addr.set_port(bound.port());
                }
                addr
            }
            None => bound,
        };

        let meta = delegate.node_meta(config.meta_max_size);
        let (shutdown_tx, _) = broadcast::channel(1);

        let this = Arc::new(Self {
            local_addr,
            socket,
            delegate,
            events,
            members: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            local_meta: RwLock::new(meta.clone()),
            incarnation: AtomicU64::new(0),
            seq: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            partials: Mutex::new(HashMap::new()),
            left: AtomicBool::new(false),
            shutdown_tx,
            config,
        });

        let local = Member {
            name: this.config.name.clone(),
            addr: local_addr,
            meta,
        };
        this.members.write().insert(
            local.name.clone(),
            MemberState {
                member: local.clone(),
                incarnation: 0,
                status: MemberStatus::Alive,
                suspect_since: None,
            },
        );
        this.events.notify_join(&local);

        tokio::spawn(this.clone().run_receiver(this.shutdown_tx.subscribe()));
        tokio::spawn(this.clone().run_prober(this.shutdown_tx.subscribe()));
        tokio::spawn(this.clone().run_gossiper(this.shutdown_tx.subscribe()));
        tokio::spawn(this.clone().run_push_pull(this.shutdown_tx.subscribe()));

        tracing::info!(
            node = %this.config.name,
            bind = %bound,
            advertise = %local_addr,
            "Membership engine started"
        );

        Ok(this)
    }

    /// Address advertised to peers
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live members (alive or suspect), including the local node
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.read().values().map(|s| s.member.clone()).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    pub fn num_members(&self) -> usize {
        self.members.read().len()
    }

    pub fn member_status(&self, name: &str) -> Option<MemberStatus> {
        self.members.read().get(name).map(|s| s.status)
    }

    /// Exchange full state with each seed. Returns how many answered.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut contacted = 0;

        for seed in seeds {
            let addr = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        tracing::warn!(seed = %seed, "Seed resolved to no addresses");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "Failed to resolve seed");
                    continue;
                }
            };

            if addr == self.local_addr {
                continue;
            }

            match self.push_pull(addr, true).await {
                Ok(()) => contacted += 1,
                Err(e) => tracing::warn!(seed = %seed, error = %e, "Seed did not answer"),
            }
        }

        if contacted == 0 && !seeds.is_empty() {
            bail!("none of {} seed nodes answered", seeds.len());
        }
        Ok(contacted)
    }

    /// Re-read local metadata from the delegate and announce it to every member
    pub async fn update_node(&self) -> Result<()> {
        let meta = self.delegate.node_meta(self.config.meta_max_size);
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.local_meta.write() = meta.clone();
        if let Some(local) = self.members.write().get_mut(&self.config.name) {
            local.member.meta = meta;
            local.incarnation = incarnation;
        }

        let ping = Message::Ping {
            seq: self.next_seq(),
            from: self.announce(),
        };
        for addr in self.peer_addrs() {
            if let Err(e) = self.send(&ping, addr).await {
                tracing::debug!(peer = %addr, error = %e, "Failed to announce metadata update");
            }
        }
        Ok(())
    }

    /// Tell every member we are leaving
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let msg = Message::Leave {
            name: self.config.name.clone(),
            incarnation: self.incarnation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let peers = self.peer_addrs();

        tokio::time::timeout(timeout, async {
            for addr in peers {
                if let Err(e) = self.send(&msg, addr).await {
                    tracing::warn!(peer = %addr, error = %e, "Failed to send leave");
                }
            }
        })
        .await
        .map_err(|_| anyhow!("leave did not complete within {timeout:?}"))?;

        tracing::info!(node = %self.config.name, "Left cluster");
        Ok(())
    }

    /// Stop all background loops
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // === Background loops ===

    async fn run_receiver(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => tracing::warn!(error = %e, "Membership receive error"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Membership receiver shutting down");
                    break;
                }
            }
        }
    }

    async fn run_prober(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_round().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_gossiper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.gossip_round().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_push_pull(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.push_pull_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.left.load(Ordering::SeqCst) {
                        continue;
                    }
                    let Some(target) = self.random_peers(1).pop() else { continue };
                    if let Err(e) = self.push_pull(target.addr, false).await {
                        tracing::debug!(peer = %target.name, error = %e, "Periodic push/pull failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    // === Rounds ===

    async fn probe_round(&self) {
        if self.left.load(Ordering::SeqCst) {
            return;
        }
        self.reap_suspects();
        self.expire_partials();
        self.tombstones.lock().retain(|_, (_, at)| at.elapsed() < TOMBSTONE_TTL);

        let Some(target) = self.random_peers(1).pop() else {
            return;
        };

        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let ping = Message::Ping {
            seq,
            from: self.announce(),
        };
        if let Err(e) = self.send(&ping, target.addr).await {
            tracing::debug!(peer = %target.name, error = %e, "Failed to send ping");
        }

        let acked = matches!(tokio::time::timeout(self.config.probe_timeout, rx).await, Ok(Ok(())));
        self.pending.lock().remove(&seq);

        if !acked {
            self.suspect(&target.name);
        }
    }

    async fn gossip_round(&self) {
        if self.left.load(Ordering::SeqCst) {
            return;
        }
        let targets = self.random_peers(self.config.gossip_nodes);
        if targets.is_empty() {
            return;
        }

        let chunks = self
            .delegate
            .get_broadcasts(self.broadcast_overhead(), self.config.packet_budget);
        if chunks.is_empty() {
            return;
        }

        let seq = self.next_seq();
        let total = chunks.len() as u16;
        let mut datagrams = Vec::with_capacity(chunks.len());
        for (part, payload) in chunks.into_iter().enumerate() {
            let msg = Message::Broadcast {
                from: self.config.name.clone(),
                seq,
                part: part as u16,
                total,
                payload,
            };
            match bincode::serialize(&msg) {
                Ok(bytes) => datagrams.push(bytes),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode broadcast");
                    return;
                }
            }
        }

        for target in targets {
            for datagram in &datagrams {
                if let Err(e) = self.socket.send_to(datagram, target.addr).await {
                    tracing::debug!(peer = %target.name, error = %e, "Failed to send broadcast");
                    break;
                }
            }
        }
    }

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let msg = Message::PushPull {
            seq,
            from: self.announce(),
            join,
            reply: true,
            members: self.announces(),
            state: self.delegate.local_state(join),
        };

        let sent = self.send(&msg, addr).await;
        let answered = match sent {
            Ok(()) => tokio::time::timeout(self.config.connect_timeout, rx).await,
            Err(e) => {
                self.pending.lock().remove(&seq);
                return Err(e);
            }
        };
        self.pending.lock().remove(&seq);

        match answered {
            Ok(Ok(())) => Ok(()),
            _ => bail!("no push/pull reply from {addr} within {:?}", self.config.connect_timeout),
        }
    }

    // === Inbound ===

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let msg: Message = match bincode::deserialize(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(addr = %from, error = %e, "Invalid membership message");
                return;
            }
        };

        match msg {
            Message::Ping { seq, from: sender } => {
                let reply_to = sender.addr;
                self.observe(sender, true);
                let ack = Message::Ack {
                    seq,
                    from: self.announce(),
                };
                if let Err(e) = self.send(&ack, reply_to).await {
                    tracing::debug!(peer = %reply_to, error = %e, "Failed to send ack");
                }
            }
            Message::Ack { seq, from: sender } => {
                self.observe(sender, true);
                self.resolve(seq);
            }
            Message::Broadcast {
                from: sender,
                seq,
                part,
                total,
                payload,
            } => {
                if sender == self.config.name {
                    return;
                }
                if let Some(full) = self.reassemble(sender, seq, part, total, payload) {
                    self.delegate.notify_msg(&full);
                }
            }
            Message::PushPull {
                seq,
                from: sender,
                join,
                reply,
                members,
                state,
            } => {
                let reply_to = sender.addr;
                self.observe(sender, true);
                for announce in members {
                    self.observe(announce, false);
                }
                self.delegate.merge_remote_state(&state, join);

                if reply {
                    let answer = Message::PushPull {
                        seq,
                        from: self.announce(),
                        join,
                        reply: false,
                        members: self.announces(),
                        state: self.delegate.local_state(join),
                    };
                    if let Err(e) = self.send(&answer, reply_to).await {
                        tracing::warn!(peer = %reply_to, error = %e, "Failed to answer push/pull");
                    }
                } else {
                    self.resolve(seq);
                }
            }
            Message::Leave { name, incarnation } => {
                if name == self.config.name {
                    return;
                }
                self.tombstones.lock().insert(name.clone(), (incarnation, Instant::now()));
                let removed = self.members.write().remove(&name);
                if let Some(state) = removed {
                    self.events.notify_leave(&state.member);
                }
            }
        }
    }

    /// Record what a node says about itself (`direct`) or what a peer says about it
    fn observe(&self, announce: NodeAnnounce, direct: bool) {
        if announce.name == self.config.name {
            return;
        }

        if !direct {
            let tombstones = self.tombstones.lock();
            if let Some((incarnation, _)) = tombstones.get(&announce.name) {
                if announce.incarnation <= *incarnation {
                    return;
                }
            }
        } else {
            self.tombstones.lock().remove(&announce.name);
        }

        let change = {
            let mut members = self.members.write();
            match members.get_mut(&announce.name) {
                None => {
                    let member = Member {
                        name: announce.name.clone(),
                        addr: announce.addr,
                        meta: announce.meta,
                    };
                    members.insert(
                        announce.name,
                        MemberState {
                            member: member.clone(),
                            incarnation: announce.incarnation,
                            status: MemberStatus::Alive,
                            suspect_since: None,
                        },
                    );
                    Some(Change::Joined(member))
                }
                Some(state) => {
                    if direct {
                        state.status = MemberStatus::Alive;
                        state.suspect_since = None;
                    }
                    if announce.incarnation > state.incarnation {
                        let changed = state.member.meta != announce.meta || state.member.addr != announce.addr;
                        state.incarnation = announce.incarnation;
                        state.member.meta = announce.meta;
                        state.member.addr = announce.addr;
                        changed.then(|| Change::Updated(state.member.clone()))
                    } else {
                        None
                    }
                }
            }
        };

        match change {
            Some(Change::Joined(member)) => self.events.notify_join(&member),
            Some(Change::Updated(member)) => self.events.notify_update(&member),
            None => {}
        }
    }

    fn resolve(&self, seq: u32) {
        if let Some(tx) = self.pending.lock().remove(&seq) {
            let _ = tx.send(());
        }
    }

    fn suspect(&self, name: &str) {
        let mut members = self.members.write();
        if let Some(state) = members.get_mut(name) {
            if state.status == MemberStatus::Alive {
                state.status = MemberStatus::Suspect;
                state.suspect_since = Some(Instant::now());
                tracing::warn!(node = %name, "Member suspected (missed probe)");
            }
        }
    }

    fn reap_suspects(&self) {
        let timeout = self.config.probe_interval * self.config.suspicion_mult.max(1);
        let dead: Vec<MemberState> = {
            let mut members = self.members.write();
            let names: Vec<String> = members
                .values()
                .filter(|s| s.suspect_since.is_some_and(|since| since.elapsed() >= timeout))
                .map(|s| s.member.name.clone())
                .collect();
            names.iter().filter_map(|name| members.remove(name)).collect()
        };

        for state in dead {
            tracing::warn!(node = %state.member.name, "Member declared dead");
            self.tombstones
                .lock()
                .insert(state.member.name.clone(), (state.incarnation, Instant::now()));
            self.events.notify_leave(&state.member);
        }
    }

    fn reassemble(&self, from: String, seq: u32, part: u16, total: u16, payload: Vec<u8>) -> Option<Vec<u8>> {
        if total == 1 && part == 0 {
            return Some(payload);
        }
        if total == 0 || part >= total || total as usize > MAX_BROADCAST_CHUNKS {
            tracing::warn!(peer = %from, part, total, "Invalid broadcast chunk");
            return None;
        }

        let key = (from, seq);
        let mut partials = self.partials.lock();
        let entry = partials.entry(key.clone()).or_insert_with(|| Partial {
            parts: vec![None; total as usize],
            received: 0,
            started: Instant::now(),
        });

        if entry.parts.len() != total as usize {
            tracing::warn!(peer = %key.0, seq, "Broadcast chunk count changed mid-stream");
            partials.remove(&key);
            return None;
        }

        let slot = &mut entry.parts[part as usize];
        if slot.is_none() {
            *slot = Some(payload);
            entry.received += 1;
        }

        if entry.received < entry.parts.len() {
            return None;
        }

        let complete = partials.remove(&key)?;
        Some(complete.parts.into_iter().flatten().flatten().collect())
    }

    fn expire_partials(&self) {
        self.partials.lock().retain(|(from, seq), partial| {
            let keep = partial.started.elapsed() < PARTIAL_TTL;
            if !keep {
                tracing::debug!(peer = %from, seq, "Discarding incomplete broadcast");
            }
            keep
        });
    }

    // === Helpers ===

    fn announce(&self) -> NodeAnnounce {
        NodeAnnounce {
            name: self.config.name.clone(),
            addr: self.local_addr,
            incarnation: self.incarnation.load(Ordering::SeqCst),
            meta: self.local_meta.read().clone(),
        }
    }

    fn announces(&self) -> Vec<NodeAnnounce> {
        self.members
            .read()
            .values()
            .filter(|s| s.member.name != self.config.name)
            .map(|s| NodeAnnounce {
                name: s.member.name.clone(),
                addr: s.member.addr,
                incarnation: s.incarnation,
                meta: s.member.meta.clone(),
            })
            .collect()
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.members
            .read()
            .values()
            .filter(|s| s.member.name != self.config.name)
            .map(|s| s.member.addr)
            .collect()
    }

    fn random_peers(&self, n: usize) -> Vec<Member> {
        let peers: Vec<Member> = self
            .members
            .read()
            .values()
            .filter(|s| s.member.name != self.config.name)
            .map(|s| s.member.clone())
            .collect();
        let mut rng = rand::rng();
        peers.choose_multiple(&mut rng, n).cloned().collect()
    }

    fn broadcast_overhead(&self) -> usize {
        BROADCAST_FRAME_OVERHEAD + self.config.name.len()
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn send(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let bytes = bincode::serialize(msg).context("Failed to encode membership message")?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            bail!("membership message too large ({} bytes)", bytes.len());
        }
        self.socket
            .send_to(&bytes, addr)
            .await
            .with_context(|| format!("Failed to send to {addr}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Vec<u8>>>,
        joined: Mutex<Vec<String>>,
        left: Mutex<Vec<String>>,
    }

    impl GossipDelegate for Recorder {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }
        fn notify_msg(&self, msg: &[u8]) {
            self.messages.lock().push(msg.to_vec());
        }
        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn local_state(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }
        fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
    }

    impl EventDelegate for Recorder {
        fn notify_join(&self, member: &Member) {
            self.joined.lock().push(member.name.clone());
        }
        fn notify_leave(&self, member: &Member) {
            self.left.lock().push(member.name.clone());
        }
        fn notify_update(&self, _member: &Member) {}
    }

    fn test_config(name: &str) -> MembershipConfig {
        MembershipConfig {
            name: name.to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            gossip_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn engine(name: &str) -> (Arc<Membership<Recorder, Recorder>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let membership = Membership::create(test_config(name), recorder.clone(), recorder.clone())
            .await
            .unwrap();
        (membership, recorder)
    }

    #[tokio::test]
    async fn test_reassemble_out_of_order() {
        let (m, _) = engine("node-a").await;

        assert!(m.reassemble("peer".into(), 7, 2, 3, b"ef".to_vec()).is_none());
        assert!(m.reassemble("peer".into(), 7, 0, 3, b"ab".to_vec()).is_none());
        assert!(m.reassemble("peer".into(), 7, 0, 3, b"ab".to_vec()).is_none());
        let full = m.reassemble("peer".into(), 7, 1, 3, b"cd".to_vec()).unwrap();
        assert_eq!(full, b"abcdef");

        assert_eq!(m.reassemble("peer".into(), 8, 0, 1, b"x".to_vec()).unwrap(), b"x");
        assert!(m.reassemble("peer".into(), 9, 3, 3, b"x".to_vec()).is_none());
        m.shutdown();
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let (a, a_events) = engine("node-a").await;
        let (b, b_events) = engine("node-b").await;

        let contacted = b.join(&[a.local_addr().to_string()]).await.unwrap();
        assert_eq!(contacted, 1);
        assert_eq!(a.num_members(), 2);
        assert_eq!(b.num_members(), 2);
        assert!(a_events.joined.lock().contains(&"node-b".to_string()));
        assert!(b_events.joined.lock().contains(&"node-a".to_string()));

        b.leave(Duration::from_secs(1)).await.unwrap();
        for _ in 0..50 {
            if a.num_members() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.num_members(), 1);
        assert!(a_events.left.lock().contains(&"node-b".to_string()));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let (a, _) = engine("node-a").await;
        let (b, _) = engine("node-b").await;
        let dead_addr = b.local_addr().to_string();
        b.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = a.join(&[dead_addr]).await;
        assert!(result.is_err());
        assert_eq!(a.num_members(), 1);
        a.shutdown();
    }

    #[tokio::test]
    async fn test_silent_member_declared_dead() {
        let (a, a_events) = engine("node-a").await;
        let (b, _) = engine("node-b").await;
        b.join(&[a.local_addr().to_string()]).await.unwrap();
        b.shutdown();

        for _ in 0..100 {
            if a.num_members() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.num_members(), 1);
        assert!(a_events.left.lock().contains(&"node-b".to_string()));
        a.shutdown();
    }
}
