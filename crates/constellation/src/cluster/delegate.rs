//! Membership hooks bridging [`ClusterState`] to the membership engine.
//!
//! The engine calls a [`GossipDelegate`] to advertise the local node,
//! produce and consume broadcasts, and exchange full state, and an
//! [`EventDelegate`] when members join, leave, or change metadata.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use constellation_common::NodeMetadata;
use constellation_common::constants::{MAX_BROADCAST_CHUNKS, NOTIFY_QUEUE_CAPACITY};

use super::membership::Member;
use super::state::{ClusterState, StateSnapshot};

/// Data hooks invoked by the membership engine
pub trait GossipDelegate: Send + Sync + 'static {
    /// Metadata advertised for the local node, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A complete broadcast payload arrived from a peer
    fn notify_msg(&self, msg: &[u8]);

    /// Ordered chunks of the next outgoing broadcast.
    /// Each chunk is at most `limit - overhead` bytes.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for a push/pull exchange
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Full remote state received in a push/pull exchange
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change hooks
pub trait EventDelegate: Send + Sync + 'static {
    fn notify_join(&self, member: &Member);
    fn notify_leave(&self, member: &Member);
    fn notify_update(&self, member: &Member);
}

/// Gossip hooks backed by the shared cluster state
pub struct StateDelegate {
    node_name: String,
    state: Arc<ClusterState>,
    updates: ArrayQueue<StateSnapshot>,
    dropped_updates: AtomicU64,
}

impl StateDelegate {
    pub fn new(node_name: impl Into<String>, state: Arc<ClusterState>) -> Self {
        Self::with_capacity(node_name, state, NOTIFY_QUEUE_CAPACITY)
    }

    pub fn with_capacity(node_name: impl Into<String>, state: Arc<ClusterState>, capacity: usize) -> Self {
        Self {
            node_name: node_name.into(),
            state,
            updates: ArrayQueue::new(capacity.max(1)),
            dropped_updates: AtomicU64::new(0),
        }
    }

    /// Next state received from a peer, if any
    pub fn next_update(&self) -> Option<StateSnapshot> {
        self.updates.pop()
    }

    /// Updates discarded because the queue was full
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    fn decode_and_merge(&self, buf: &[u8], source: &str) -> Option<StateSnapshot> {
        match StateSnapshot::from_bytes(buf) {
            Ok(remote) => {
                self.state.merge_state(&remote);
                Some(remote)
            }
            Err(e) => {
                tracing::warn!(source, error = %e, bytes = buf.len(), "Dropping undecodable gossip payload");
                None
            }
        }
    }
}

/// Encode advertised metadata, degrading full -> minimal -> empty.
pub fn encode_node_meta(node: &NodeMetadata, limit: usize) -> Vec<u8> {
    match serde_json::to_vec(node) {
        Ok(full) if full.len() <= limit => return full,
        Ok(full) => {
            tracing::debug!(size = full.len(), limit, "Node metadata over budget, trying minimal form");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode node metadata"),
    }

    match serde_json::to_vec(&node.minimal()) {
        Ok(minimal) if minimal.len() <= limit => minimal,
        Ok(minimal) => {
            tracing::warn!(size = minimal.len(), limit, "Minimal node metadata over budget, advertising none");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode minimal node metadata");
            Vec::new()
        }
    }
}

/// Split a payload into ordered chunks of at most `limit - overhead` bytes.
/// Returns nothing if there is no room per chunk or too many chunks would be needed.
pub fn chunk_payload(payload: &[u8], overhead: usize, limit: usize) -> Vec<Vec<u8>> {
    let chunk_size = limit.saturating_sub(overhead);
    if chunk_size == 0 {
        tracing::warn!(overhead, limit, "No room for broadcast payload");
        return Vec::new();
    }

    let chunks = payload.len().div_ceil(chunk_size);
    if chunks > MAX_BROADCAST_CHUNKS {
        tracing::warn!(
            size = payload.len(),
            chunks,
            max = MAX_BROADCAST_CHUNKS,
            "Cluster state too large to broadcast"
        );
        return Vec::new();
    }

    payload.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

impl GossipDelegate for StateDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        match self.state.get_node(&self.node_name) {
            Some(node) => encode_node_meta(&node, limit),
            None => Vec::new(),
        }
    }

    fn notify_msg(&self, msg: &[u8]) {
        if msg.is_empty() {
            return;
        }

        let Some(remote) = self.decode_and_merge(msg, "broadcast") else {
            return;
        };

        if self.updates.push(remote).is_err() {
            let dropped = self.dropped_updates.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped, "Update queue full, dropping notification");
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let payload = match self.state.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode cluster state for broadcast");
                return Vec::new();
            }
        };

        if payload.len() + overhead <= limit {
            return vec![payload];
        }
        chunk_payload(&payload, overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.state.to_bytes().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode cluster state for push/pull");
            Vec::new()
        })
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }
        if self.decode_and_merge(buf, "push_pull").is_some() {
            tracing::debug!(join, "Merged full state from peer");
        }
    }
}

/// Membership events applied to the shared cluster state.
///
/// Advertised metadata is merged last-writer-wins on its own `last_seen`,
/// so a minimal record never displaces a fuller one learned through gossip.
/// The local node's entry is owned by this process and is never replaced.
pub struct MembershipEvents {
    node_name: String,
    state: Arc<ClusterState>,
}

impl MembershipEvents {
    pub fn new(node_name: impl Into<String>, state: Arc<ClusterState>) -> Self {
        Self {
            node_name: node_name.into(),
            state,
        }
    }

    fn apply_meta(&self, member: &Member, event: &'static str) {
        if member.name == self.node_name {
            return;
        }
        if member.meta.is_empty() {
            tracing::debug!(node = %member.name, event, "Member advertised no metadata");
            return;
        }

        let node = match serde_json::from_slice::<NodeMetadata>(&member.meta) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(node = %member.name, event, error = %e, "Failed to decode member metadata");
                return;
            }
        };
        if node.name != member.name {
            tracing::warn!(node = %member.name, advertised = %node.name, event, "Member metadata names another node");
            return;
        }

        if self.state.merge_node(node) {
            tracing::debug!(node = %member.name, event, "Applied member metadata");
        } else {
            tracing::trace!(node = %member.name, event, "Member metadata older than local record");
        }
    }
}

impl EventDelegate for MembershipEvents {
    fn notify_join(&self, member: &Member) {
        tracing::info!(node = %member.name, addr = %member.addr, "Node joined");
        self.apply_meta(member, "join");
    }

    fn notify_leave(&self, member: &Member) {
        tracing::info!(node = %member.name, addr = %member.addr, "Node left");
        self.state.remove_node(&member.name);
    }

    fn notify_update(&self, member: &Member) {
        self.apply_meta(member, "update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use constellation_common::ServiceHealth;

    fn member(name: &str, meta: Vec<u8>) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            meta,
        }
    }

    fn local(capabilities: usize) -> (Arc<ClusterState>, StateDelegate) {
        let state = Arc::new(ClusterState::new());
        let mut node = NodeMetadata::new("node-1", "203.0.113.1", "100.64.0.1");
        node.capabilities = (0..capabilities).map(|i| format!("capability-{i:04}")).collect();
        state.update_node(node);
        let delegate = StateDelegate::new("node-1", state.clone());
        (state, delegate)
    }

    #[test]
    fn test_node_meta_full_when_it_fits() {
        let (_, delegate) = local(2);
        let meta = delegate.node_meta(512);
        let decoded: NodeMetadata = serde_json::from_slice(&meta).unwrap();
        assert_eq!(decoded.capabilities.len(), 2);
    }

    #[test]
    fn test_node_meta_degrades_to_minimal() {
        let (_, delegate) = local(100);
        let meta = delegate.node_meta(512);
        assert!(!meta.is_empty());
        assert!(meta.len() <= 512);

        let decoded: NodeMetadata = serde_json::from_slice(&meta).unwrap();
        assert_eq!(decoded.name, "node-1");
        assert!(decoded.capabilities.is_empty());
    }

    #[test]
    fn test_node_meta_empty_when_nothing_fits() {
        let (_, delegate) = local(100);
        assert!(delegate.node_meta(16).is_empty());
    }

    #[test]
    fn test_notify_msg_merges_and_queues() {
        let (state, delegate) = local(0);
        let peer = ClusterState::new();
        peer.update_node(NodeMetadata::new("node-2", "a", "b"));
        peer.update_service_health(ServiceHealth::new("web", "node-2", true));

        delegate.notify_msg(&peer.to_bytes().unwrap());

        assert!(state.get_node("node-2").is_some());
        assert!(state.get_service_health("web", "node-2").is_some());
        let update = delegate.next_update().unwrap();
        assert!(update.nodes.contains_key("node-2"));
        assert!(delegate.next_update().is_none());
    }

    #[test]
    fn test_notify_msg_drops_when_queue_full() {
        let state = Arc::new(ClusterState::new());
        let delegate = StateDelegate::with_capacity("node-1", state, 2);
        let payload = ClusterState::new().to_bytes().unwrap();

        for _ in 0..5 {
            delegate.notify_msg(&payload);
        }

        assert_eq!(delegate.dropped_updates(), 3);
        assert!(delegate.next_update().is_some());
        assert!(delegate.next_update().is_some());
        assert!(delegate.next_update().is_none());
    }

    #[test]
    fn test_notify_msg_ignores_garbage() {
        let (state, delegate) = local(0);
        let version = state.version();
        delegate.notify_msg(b"{not json");
        assert_eq!(state.version(), version);
        assert!(delegate.next_update().is_none());
    }

    #[test]
    fn test_broadcast_single_when_it_fits() {
        let (state, delegate) = local(0);
        let chunks = delegate.get_broadcasts(10, 1400);
        assert_eq!(chunks, vec![state.to_bytes().unwrap()]);
    }

    #[test]
    fn test_broadcast_chunks_are_ordered_and_bounded() {
        let (state, delegate) = local(40);
        let chunks = delegate.get_broadcasts(50, 200);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 150));
        assert_eq!(chunks.concat(), state.to_bytes().unwrap());
    }

    #[test]
    fn test_broadcast_nothing_when_no_room() {
        let (_, delegate) = local(40);
        assert!(delegate.get_broadcasts(200, 200).is_empty());
        assert!(delegate.get_broadcasts(0, 8).is_empty());
    }

    #[test]
    fn test_push_pull_round_trip() {
        let (_, delegate) = local(0);
        let other_state = Arc::new(ClusterState::new());
        let other = StateDelegate::new("node-2", other_state.clone());

        other.merge_remote_state(&delegate.local_state(true), true);
        assert!(other_state.get_node("node-1").is_some());
    }

    #[test]
    fn test_membership_events() {
        let state = Arc::new(ClusterState::new());
        let events = MembershipEvents::new("node-1", state.clone());

        let mut node = NodeMetadata::new("node-2", "a", "b");
        node.last_seen = Utc::now();
        events.notify_join(&member("node-2", serde_json::to_vec(&node).unwrap()));
        assert!(state.get_node("node-2").is_some());

        let mut cordoned = node.clone();
        cordoned.cordoned = true;
        cordoned.last_seen = node.last_seen + chrono::Duration::seconds(1);
        events.notify_update(&member("node-2", serde_json::to_vec(&cordoned).unwrap()));
        assert!(state.get_node("node-2").unwrap().cordoned);

        state.update_service_health(ServiceHealth::new("web", "node-2", true));
        events.notify_leave(&member("node-2", Vec::new()));
        assert!(state.get_node("node-2").is_none());
        assert!(state.get_service_health("web", "node-2").is_none());
    }

    #[test]
    fn test_join_with_bad_meta_is_ignored() {
        let state = Arc::new(ClusterState::new());
        let events = MembershipEvents::new("node-1", state.clone());
        events.notify_join(&member("node-3", b"\x00\x01".to_vec()));
        assert!(state.get_node("node-3").is_none());
    }

    #[test]
    fn test_local_meta_is_not_reapplied() {
        let (state, delegate) = local(60);
        let before = state.get_node("node-1").unwrap();
        let events = MembershipEvents::new("node-1", state.clone());

        let meta = delegate.node_meta(512);
        let advertised: NodeMetadata = serde_json::from_slice(&meta).unwrap();
        assert!(advertised.capabilities.is_empty());

        events.notify_join(&member("node-1", meta.clone()));
        events.notify_update(&member("node-1", meta));
        assert_eq!(state.get_node("node-1").unwrap(), before);
    }

    #[test]
    fn test_minimal_meta_does_not_override_gossiped_record() {
        let mut full = NodeMetadata::new("node-2", "203.0.113.2", "100.64.0.2");
        full.cordoned = true;
        full.capabilities = (0..60).map(|i| format!("capability-{i:04}")).collect();
        let owner = ClusterState::new();
        owner.update_node(full.clone());
        let full = owner.get_node("node-2").unwrap();

        let state = Arc::new(ClusterState::new());
        let events = MembershipEvents::new("node-1", state.clone());
        state.merge_state(&owner.snapshot());

        let meta = encode_node_meta(&full, 512);
        assert!(serde_json::from_slice::<NodeMetadata>(&meta).unwrap().capabilities.is_empty());
        events.notify_join(&member("node-2", meta.clone()));
        events.notify_update(&member("node-2", meta));
        state.merge_state(&owner.snapshot());

        let node = state.get_node("node-2").unwrap();
        assert!(node.cordoned);
        assert_eq!(node.capabilities.len(), 60);
        assert_eq!(node, full);
    }

    #[test]
    fn test_minimal_meta_seeds_unknown_node() {
        let state = Arc::new(ClusterState::new());
        let events = MembershipEvents::new("node-1", state.clone());
        let mut full = NodeMetadata::new("node-2", "203.0.113.2", "100.64.0.2");
        full.capabilities = (0..60).map(|i| format!("capability-{i:04}")).collect();

        events.notify_join(&member("node-2", encode_node_meta(&full, 512)));
        let seeded = state.get_node("node-2").unwrap();
        assert_eq!(seeded.overlay_ip, "100.64.0.2");

        let owner = ClusterState::new();
        owner.update_node(full);
        state.merge_state(&owner.snapshot());
        assert_eq!(state.get_node("node-2").unwrap().capabilities.len(), 60);
    }

    #[test]
    fn test_meta_for_another_name_is_ignored() {
        let state = Arc::new(ClusterState::new());
        let events = MembershipEvents::new("node-1", state.clone());
        let node = NodeMetadata::new("node-9", "a", "b");
        events.notify_join(&member("node-2", serde_json::to_vec(&node).unwrap()));
        assert!(state.get_node("node-2").is_none());
        assert!(state.get_node("node-9").is_none());
    }
}
