//! Volatile per-node consensus state and the pure decision helpers on it.
//!
//! Everything here is mutated only by the node's main loop (or by public API
//! calls holding the state write lock); the async plumbing lives in
//! [`crate::node`].

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::id::NodeId;
use crate::peers::PeerTracker;
use crate::wire::VoteRequest;

/// Role of a node within its group.
///
/// `Observer` follows the same transition rules as `Follower`; making it
/// non-voting is future work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Observer,
    Closed,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "FOLLOWER"),
            RaftRole::Candidate => write!(f, "CANDIDATE"),
            RaftRole::Leader => write!(f, "LEADER"),
            RaftRole::Observer => write!(f, "OBSERVER"),
            RaftRole::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Peers that have acknowledged one proposed index, together with the term
/// the entry was proposed in. Commit only advances through quorum counting
/// when that term is still the current one.
#[derive(Debug)]
pub(crate) struct AckSet {
    pub term: u64,
    pub peers: HashSet<NodeId>,
}

/// Follower-side catch-up session: the target (cterm, cindex) we must reach,
/// progress tracking for stall detection, and the inbox subscription task.
#[derive(Debug)]
pub(crate) struct Catchup {
    /// Distinguishes this session's inbox traffic from stale sessions.
    pub id: u64,
    pub cterm: u64,
    pub cindex: u64,
    /// Last pindex observed from a live leader append-entry.
    pub pindex: u64,
    /// Live leader append-entries seen without pindex advancing.
    pub hbs: u32,
    pub cancel: CancellationToken,
}

const MAX_CATCHUP_HBS: u32 = 3;

#[derive(Debug)]
pub(crate) struct RaftState {
    pub role: RaftRole,
    pub term: u64,
    pub vote: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub pterm: u64,
    pub pindex: u64,
    pub commit: u64,
    pub applied: u64,
    /// WAL sequence of the latest snapshot entry; compaction target.
    pub sindex: u64,
    pub cluster_size: usize,
    pub quorum: usize,
    pub peers: PeerTracker,
    pub acks: HashMap<u64, AckSet>,
    /// Last time we broadcast an append-entry (leader).
    pub active: Instant,
    pub elect_deadline: tokio::time::Instant,
    pub paused: bool,
    /// Commit high-water mark parked while apply is paused.
    pub hcommit: u64,
    pub catchup: Option<Catchup>,
    /// Leader-side catch-up sessions, keyed by peer, fed with ack indexes.
    pub progress: HashMap<NodeId, mpsc::Sender<u64>>,
}

impl RaftState {
    pub fn new(self_id: NodeId, cluster_size: usize) -> Self {
        RaftState {
            role: RaftRole::Follower,
            term: 0,
            vote: None,
            leader: None,
            pterm: 0,
            pindex: 0,
            commit: 0,
            applied: 0,
            sindex: 0,
            cluster_size,
            quorum: cluster_size / 2 + 1,
            peers: PeerTracker::new(self_id),
            acks: HashMap::new(),
            active: Instant::now(),
            elect_deadline: tokio::time::Instant::now(),
            paused: false,
            hcommit: 0,
            catchup: None,
            progress: HashMap::new(),
        }
    }

    /// Update the cluster size and quorum together.
    pub fn set_cluster_size(&mut self, size: usize) {
        self.cluster_size = size;
        self.quorum = size / 2 + 1;
    }

    pub fn won_election(&self, votes: usize) -> bool {
        votes >= self.quorum
    }

    /// The one path to a granted vote: the candidate's log must reach ours
    /// and we must not have voted for anyone else this term.
    pub fn grants_vote(&self, vr: &VoteRequest) -> bool {
        vr.last_index >= self.pindex && (self.vote.is_none() || self.vote == Some(vr.candidate))
    }

    /// Whether the follower catch-up session has reached its target.
    pub fn catchup_done(&self) -> bool {
        match &self.catchup {
            Some(cs) => self.pterm >= cs.cterm && self.pindex >= cs.cindex,
            None => true,
        }
    }

    /// Called on each live leader append-entry while catching up. Stalled
    /// means several arrived without our pindex moving.
    pub fn catchup_stalled(&mut self) -> bool {
        let pindex = self.pindex;
        let Some(cs) = self.catchup.as_mut() else {
            return false;
        };
        if cs.pindex == pindex {
            cs.hbs += 1;
        } else {
            cs.pindex = pindex;
            cs.hbs = 0;
        }
        cs.hbs >= MAX_CATCHUP_HBS
    }

    /// Current means fully applied and either leading or recently in touch
    /// with a leader we are not behind.
    pub fn is_current(&self, hb_interval: Duration) -> bool {
        if self.commit != self.applied {
            return false;
        }
        if self.role == RaftRole::Leader {
            return true;
        }
        if !self.catchup_done() {
            return false;
        }
        match self.leader {
            Some(leader) if leader != self.peers.self_id() => {
                self.peers.seen_within(leader, 2 * hb_interval)
            }
            _ => false,
        }
    }
}
