//! Liveness and replication tracking for the peers of one group.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::id::NodeId;

/// What we know about one peer: when we last heard from it and the highest
/// log index it has acknowledged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStatus {
    pub last_seen: Option<Instant>,
    pub last_index: u64,
}

/// Public snapshot of a peer, as returned by `RaftNode::peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    pub current: bool,
    pub last_seen: Option<Instant>,
    pub last_index: u64,
}

/// Map of peer id to [`PeerStatus`]. The local node tracks itself as well so
/// membership broadcasts carry the full set. Peers are never removed, only
/// replaced wholesale when the leader publishes a new peer state.
#[derive(Debug)]
pub(crate) struct PeerTracker {
    self_id: NodeId,
    peers: HashMap<NodeId, PeerStatus>,
}

impl PeerTracker {
    pub fn new(self_id: NodeId) -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            self_id,
            PeerStatus {
                last_seen: Some(Instant::now()),
                last_index: 0,
            },
        );
        PeerTracker { self_id, peers }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Register a peer we know about but have not heard from yet.
    pub fn insert_silent(&mut self, id: NodeId) {
        self.peers.entry(id).or_default();
    }

    /// Record contact from a peer, inserting it if unknown.
    pub fn track(&mut self, id: NodeId) {
        self.peers.entry(id).or_default().last_seen = Some(Instant::now());
    }

    /// Record the highest index a peer has replicated.
    pub fn observe_index(&mut self, id: NodeId, index: u64) {
        if let Some(ps) = self.peers.get_mut(&id) {
            if index > ps.last_index {
                ps.last_index = index;
            }
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&PeerStatus> {
        self.peers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn names(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Replace the tracked set with the leader's authoritative view.
    pub fn reset_from(&mut self, peers: &[NodeId]) {
        self.peers.clear();
        for &id in peers {
            self.peers.insert(id, PeerStatus::default());
        }
    }

    pub fn seen_within(&self, id: NodeId, interval: Duration) -> bool {
        self.peers
            .get(&id)
            .and_then(|ps| ps.last_seen)
            .map(|seen| seen.elapsed() <= interval)
            .unwrap_or(false)
    }

    fn live_count(&self, interval: Duration) -> usize {
        // We always count ourselves.
        1 + self
            .peers
            .iter()
            .filter(|(id, _)| **id != self.self_id)
            .filter(|(id, _)| self.seen_within(**id, interval))
            .count()
    }

    pub fn have_quorum(&self, quorum: usize, interval: Duration) -> bool {
        self.live_count(interval) >= quorum
    }

    pub fn lost_quorum(&self, quorum: usize, interval: Duration) -> bool {
        !self.have_quorum(quorum, interval)
    }

    /// Whether any peer has replicated less than `index`.
    pub fn any_behind(&self, index: u64) -> bool {
        self.peers
            .iter()
            .any(|(&id, ps)| id != self.self_id && ps.last_index < index)
    }

    /// A live peer suitable as a leadership-transfer target.
    pub fn transfer_candidate(&self, freshness: Duration) -> Option<NodeId> {
        self.peers
            .keys()
            .find(|&&id| id != self.self_id && self.seen_within(id, freshness))
            .copied()
    }

    pub fn infos(&self, leader: Option<NodeId>, applied: u64) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(&id, ps)| PeerInfo {
                id,
                current: Some(id) == leader || ps.last_index >= applied,
                last_seen: ps.last_seen,
                last_index: ps.last_index,
            })
            .collect()
    }
}
