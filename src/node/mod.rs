//! The per-group consensus node: construction, lifecycle and public API.
//!
//! Each node runs one role-dispatched main loop (see [`run`]) that is the
//! only mutator of the replicated-log positions. Producers (transport
//! callbacks, the upper layer) talk to the loop over bounded channels and
//! short critical sections on the state lock.

mod catchup;
mod replication;
mod run;

use std::fs;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::id::NodeId;
use crate::peers::PeerInfo;
use crate::state::{RaftRole, RaftState};
use crate::storage::{self, Wal, WalState};
use crate::timer::random_timeout;
use crate::transport::{Subjects, Transport};
use crate::wire::{
    AppendEntry, AppendEntryResponse, Entry, PeerState, VoteRequest, VoteResponse,
};

/// How long a proposal will wait for paused proposals to resume.
const PROPOSE_WAIT: Duration = Duration::from_millis(422);

const VOTE_REQ_QUEUE: usize = 4;
const VOTE_RESP_QUEUE: usize = 8;
const APPEND_RESP_QUEUE: usize = 256;
const APPEND_QUEUE: usize = 512;
const STEPDOWN_QUEUE: usize = 4;

/// A committed batch handed to the upper-layer state machine. `index` is the
/// WAL sequence of the batch; entries within it share the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: u64,
    pub entries: Vec<Entry>,
}

/// Events delivered on the apply channel, in strictly increasing index
/// order. `ReplayComplete` marks the end of the startup replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    Committed(CommittedEntry),
    ReplayComplete,
}

/// Snapshot of the node's log positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub term: u64,
    pub pterm: u64,
    pub pindex: u64,
    pub commit: u64,
    pub applied: u64,
}

/// Where an append-entry came from. Replayed and catch-up frames skip the
/// liveness bookkeeping that applies to fresh traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendSource {
    Live,
    Catchup(u64),
    Replay,
}

pub(crate) struct InboundAppend {
    pub ae: AppendEntry,
    pub source: AppendSource,
}

/// Receiver ends owned by the main loop.
pub(crate) struct LoopRx {
    pub append: mpsc::Receiver<InboundAppend>,
    pub vote_req: mpsc::Receiver<VoteRequest>,
    pub vote_resp: mpsc::Receiver<VoteResponse>,
    pub resp: mpsc::Receiver<AppendEntryResponse>,
    pub prop: mpsc::Receiver<Entry>,
    pub stepdown: mpsc::Receiver<Option<NodeId>>,
}

pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) cfg: RaftConfig,
    pub(crate) wal: Arc<dyn Wal>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) subjects: Subjects,
    pub(crate) state: RwLock<RaftState>,

    pub(crate) apply_tx: mpsc::Sender<ApplyEvent>,
    pub(crate) lead_tx: watch::Sender<bool>,
    pub(crate) prop_tx: mpsc::Sender<Entry>,
    pub(crate) stepdown_tx: mpsc::Sender<Option<NodeId>>,
    pub(crate) append_tx: mpsc::Sender<InboundAppend>,
    vote_req_tx: mpsc::Sender<VoteRequest>,
    vote_resp_tx: mpsc::Sender<VoteResponse>,
    resp_tx: mpsc::Sender<AppendEntryResponse>,
    props_paused: watch::Sender<bool>,

    /// Wakes the main loop after an out-of-loop election timer reset.
    pub(crate) elect_kick: Notify,
    pub(crate) quit: CancellationToken,
    pub(crate) catchup_seq: AtomicU64,
    pub(crate) span: tracing::Span,
}

/// Handle to one consensus group. Cheap to clone; the node itself lives on
/// its spawned tasks until stopped or deleted.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<NodeInner>,
}

impl RaftNode {
    /// Bring up a group member from its durable state.
    ///
    /// Reads the peer-state and term/vote files from `cfg.store_dir`
    /// (bootstrap the directory first with [`crate::storage::bootstrap_group`]),
    /// replays the WAL through the regular append-entry path, subscribes the
    /// group subjects and spawns the main loop. The returned receiver yields
    /// committed entries; it starts with the replayed backlog followed by
    /// [`ApplyEvent::ReplayComplete`].
    pub async fn start(
        cfg: RaftConfig,
        id: NodeId,
        wal: Arc<dyn Wal>,
        transport: Arc<dyn Transport>,
    ) -> Result<(RaftNode, mpsc::Receiver<ApplyEvent>)> {
        cfg.validate()?;
        let ps = storage::read_peer_state(&cfg.store_dir)?;
        if ps.cluster_size < 2 {
            return Err(RaftError::ClusterTooSmall);
        }
        let (term, vote) = storage::read_term_vote(&cfg.store_dir)?;

        let wal_state = wal.state();
        let replay_len = if wal_state.last_seq >= wal_state.first_seq {
            (wal_state.last_seq - wal_state.first_seq + 1) as usize
        } else {
            0
        };
        // Replay pushes onto the apply channel before anyone can drain it,
        // so make sure the backlog fits.
        let (apply_tx, apply_rx) = mpsc::channel(cfg.apply_queue.max(replay_len + 1));

        let (prop_tx, prop_rx) = mpsc::channel(cfg.proposal_queue);
        let (stepdown_tx, stepdown_rx) = mpsc::channel(STEPDOWN_QUEUE);
        let (append_tx, append_rx) = mpsc::channel(APPEND_QUEUE);
        let (vote_req_tx, vote_req_rx) = mpsc::channel(VOTE_REQ_QUEUE);
        let (vote_resp_tx, vote_resp_rx) = mpsc::channel(VOTE_RESP_QUEUE);
        let (resp_tx, resp_rx) = mpsc::channel(APPEND_RESP_QUEUE);

        let mut st = RaftState::new(id, ps.cluster_size as usize);
        st.term = term;
        st.vote = vote;
        for &peer in &ps.peers {
            if peer != id {
                st.peers.insert_silent(peer);
            }
        }

        let span = tracing::info_span!("raft", group = %cfg.group, id = %id);
        let subjects = Subjects::new(&cfg.cluster, &cfg.group);
        let inner = Arc::new(NodeInner {
            id,
            subjects,
            wal,
            transport,
            state: RwLock::new(st),
            apply_tx,
            lead_tx: watch::channel(false).0,
            prop_tx,
            stepdown_tx,
            append_tx,
            vote_req_tx,
            vote_resp_tx,
            resp_tx,
            props_paused: watch::channel(false).0,
            elect_kick: Notify::new(),
            quit: CancellationToken::new(),
            catchup_seq: AtomicU64::new(0),
            span,
            cfg,
        });

        if replay_len > 0 {
            inner.replay(&wal_state).await?;
        }
        // Tell the upper layer replay is done.
        let _ = inner.apply_tx.try_send(ApplyEvent::ReplayComplete);

        inner.spawn_subscriptions();
        {
            let mut st = inner.state.write().await;
            inner.reset_election_timeout(&mut st);
        }

        let rx = LoopRx {
            append: append_rx,
            vote_req: vote_req_rx,
            vote_resp: vote_resp_rx,
            resp: resp_rx,
            prop: prop_rx,
            stepdown: stepdown_rx,
        };
        let loop_inner = Arc::clone(&inner);
        let span = inner.span.clone();
        tokio::spawn(async move { run::run(loop_inner, rx).await }.instrument(span));

        inner.span.in_scope(|| info!("started"));
        Ok((RaftNode { inner }, apply_rx))
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn group(&self) -> &str {
        &self.inner.cfg.group
    }

    pub async fn role(&self) -> RaftRole {
        self.inner.state.read().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.state.read().await.role == RaftRole::Leader
    }

    /// The group's current leader, if one is known.
    pub async fn group_leader(&self) -> Option<NodeId> {
        self.inner.state.read().await.leader
    }

    /// Whether this node has heard from a quorum recently. Meaningful on
    /// leaders and former leaders.
    pub async fn have_quorum(&self) -> bool {
        let st = self.inner.state.read().await;
        st.peers
            .have_quorum(st.quorum, self.inner.cfg.lost_quorum_interval)
    }

    /// Leader, or an up-to-date follower in touch with the leader.
    pub async fn is_current(&self) -> bool {
        let st = self.inner.state.read().await;
        st.is_current(self.inner.cfg.heartbeat_interval)
    }

    pub async fn position(&self) -> LogPosition {
        let st = self.inner.state.read().await;
        LogPosition {
            term: st.term,
            pterm: st.pterm,
            pindex: st.pindex,
            commit: st.commit,
            applied: st.applied,
        }
    }

    pub async fn cluster_size(&self) -> usize {
        self.inner.state.read().await.cluster_size
    }

    pub async fn quorum_size(&self) -> usize {
        self.inner.state.read().await.quorum
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let st = self.inner.state.read().await;
        st.peers.infos(st.leader, st.applied)
    }

    /// Entry count and byte size of the group's WAL.
    pub fn size(&self) -> (u64, u64) {
        let state = self.inner.wal.state();
        (state.entries, state.bytes)
    }

    /// Leadership notifications: `true` when this node becomes leader,
    /// `false` when it loses leadership or the quorum. Only the latest
    /// unread value is retained.
    pub fn leader_changes(&self) -> watch::Receiver<bool> {
        self.inner.lead_tx.subscribe()
    }

    /// Token cancelled when the node shuts down.
    pub fn quit_token(&self) -> CancellationToken {
        self.inner.quit.clone()
    }

    /// Propose an opaque entry to the group. Leader only.
    pub async fn propose(&self, data: Bytes) -> Result<()> {
        {
            let st = self.inner.state.read().await;
            match st.role {
                RaftRole::Closed => return Err(RaftError::Closed),
                RaftRole::Leader => {}
                _ => {
                    debug!("proposal ignored, not leader");
                    return Err(RaftError::NotLeader);
                }
            }
        }
        self.inner.wait_if_proposals_paused().await?;
        self.inner
            .prop_tx
            .try_send(Entry::normal(data))
            .map_err(|_| {
                debug!("proposal failed, queue full");
                RaftError::ProposalFailed
            })
    }

    /// Send a proposal to the group's leader, whoever that is. On the leader
    /// this is the same as [`propose`](Self::propose).
    pub async fn forward_proposal(&self, data: Bytes) -> Result<()> {
        if self.is_leader().await {
            return self.propose(data).await;
        }
        self.inner
            .transport
            .publish(&self.inner.subjects.propose, "", data);
        Ok(())
    }

    /// Stop accepting proposals until [`resume_proposals`](Self::resume_proposals).
    pub fn pause_proposals(&self) {
        self.inner.props_paused.send_replace(true);
    }

    pub fn resume_proposals(&self) {
        self.inner.props_paused.send_replace(false);
    }

    /// Propose adding a peer to the group. Leader only.
    pub async fn propose_add_peer(&self, peer: NodeId) -> Result<()> {
        self.inner.propose_add_peer(peer).await
    }

    /// Reserved. Removal semantics are not defined in this version.
    pub async fn propose_remove_peer(&self, _peer: NodeId) -> Result<()> {
        Err(RaftError::RemovePeerUnsupported)
    }

    /// Replicate a state-machine snapshot. Leader only, and the node must be
    /// current; pause proposals around taking the snapshot.
    pub async fn snapshot(&self, snap: Bytes) -> Result<()> {
        {
            let st = self.inner.state.read().await;
            debug!(bytes = snap.len(), applied = st.applied, "snapshot requested");
            if st.role != RaftRole::Leader {
                return Err(RaftError::NotLeader);
            }
            if !st.is_current(self.inner.cfg.heartbeat_interval) {
                return Err(RaftError::NotCurrent);
            }
        }
        self.inner
            .prop_tx
            .try_send(Entry::snapshot(snap))
            .map_err(|_| RaftError::ProposalFailed)
    }

    /// Confirm that the state machine has applied everything up to `index`.
    /// Reaching the snapshot index compacts the WAL behind it.
    pub async fn applied(&self, index: u64) {
        let mut st = self.inner.state.write().await;
        if index <= st.applied {
            return;
        }
        st.applied = index;
        if index > 0 && index == st.sindex {
            debug!(index, "snapshot entry applied, compacting log");
            if let Err(err) = self.inner.wal.compact(index) {
                warn!(error = %err, "log compaction failed");
            }
        }
    }

    /// Compact the WAL below `index`. Non-leaders compact at will. A leader
    /// only checks that every peer has replicated past `index`; its own log
    /// is compacted through [`applied`](Self::applied) at the snapshot
    /// index.
    pub async fn compact(&self, index: u64) -> Result<()> {
        let st = self.inner.state.read().await;
        if st.role == RaftRole::Leader {
            if st.peers.any_behind(index) {
                return Err(RaftError::PeersNotCurrent);
            }
            return Ok(());
        }
        self.inner.wal.compact(index)?;
        Ok(())
    }

    /// Park commit advancement; committed entries stop flowing to the apply
    /// channel until [`resume_apply`](Self::resume_apply).
    pub async fn pause_apply(&self) {
        let mut st = self.inner.state.write().await;
        st.paused = true;
        st.hcommit = st.commit;
    }

    pub async fn resume_apply(&self) {
        let mut st = self.inner.state.write().await;
        if st.hcommit > st.commit {
            for index in (st.commit + 1)..=st.hcommit {
                if self.inner.apply_commit(&mut st, index).is_err() {
                    break;
                }
            }
        }
        st.paused = false;
        st.hcommit = 0;
    }

    /// Step down as leader, transferring leadership to a live follower when
    /// one is available.
    pub async fn step_down(&self) -> Result<()> {
        {
            let mut st = self.inner.state.write().await;
            if st.role != RaftRole::Leader {
                return Err(RaftError::NotLeader);
            }
            debug!("being asked to stepdown");
            let freshness = 2 * self.inner.cfg.heartbeat_interval;
            if let Some(peer) = st.peers.transfer_candidate(freshness) {
                debug!(peer = %peer, "selected peer for leader transfer");
                self.inner
                    .send_append_entry(&mut st, vec![Entry::leader_transfer(peer)]);
            }
        }
        self.inner
            .stepdown_tx
            .try_send(None)
            .map_err(|_| RaftError::StepdownFailed)
    }

    /// Ask this node to start a leadership vote shortly.
    pub async fn campaign(&self) -> Result<()> {
        let mut st = self.inner.state.write().await;
        self.inner.campaign_now(&mut st)
    }

    /// Shut the node down, preserving durable state.
    pub async fn stop(&self) {
        self.inner.shutdown(false).await;
    }

    /// Shut the node down and erase its durable state.
    pub async fn delete(&self) {
        self.inner.shutdown(true).await;
    }
}

impl NodeInner {
    /// Rebuild pterm/pindex, membership and the commit position by running
    /// every stored frame through the regular append-entry path.
    async fn replay(self: &Arc<Self>, wal_state: &WalState) -> Result<()> {
        let mut st = self.state.write().await;
        let first = self
            .load_entry(wal_state.first_seq)
            .map_err(|_| RaftError::EntryLoadFailed)?;
        st.pterm = first.pterm;
        st.pindex = first.pindex;
        if first.commit > 0 {
            st.commit = first.commit;
        }
        for seq in wal_state.first_seq..=wal_state.last_seq {
            let ae = self
                .load_entry(seq)
                .map_err(|_| RaftError::EntryLoadFailed)?;
            self.process_append_entry(&mut st, ae, AppendSource::Replay);
        }
        Ok(())
    }

    fn spawn_subscriptions(self: &Arc<Self>) {
        self.spawn_sub(&self.subjects.vote, |inner, payload, reply| {
            let Some(vr) = VoteRequest::decode(&payload, reply) else {
                warn!("received malformed vote request");
                return;
            };
            if inner.vote_req_tx.try_send(vr).is_err() {
                warn!("failed to place vote request on channel");
            }
        });

        self.spawn_sub(&self.subjects.vote_reply, |inner, payload, _| {
            let Some(vr) = VoteResponse::decode(&payload) else {
                warn!("received malformed vote response");
                return;
            };
            if inner.vote_resp_tx.try_send(vr).is_err() {
                warn!("failed to place vote response on channel");
            }
        });

        self.spawn_sub(&self.subjects.append_reply, |inner, payload, reply| {
            let Some(ar) = AppendEntryResponse::decode(&payload, reply) else {
                warn!("received malformed append entry response");
                return;
            };
            if inner.resp_tx.try_send(ar).is_err() {
                warn!("failed to place append entry response on channel");
            }
        });

        // Append-entries are processed in order with backpressure; dropping
        // one would force the follower into a needless catch-up.
        let mut rx = self.transport.subscribe(&self.subjects.append);
        let inner = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = inner.quit.cancelled() => return,
                        msg = rx.recv() => {
                            let Some(d) = msg else { return };
                            let Some(ae) = AppendEntry::decode(d.payload, &d.reply) else { continue };
                            let inbound = InboundAppend { ae, source: AppendSource::Live };
                            if inner.append_tx.send(inbound).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn spawn_sub<F>(self: &Arc<Self>, subject: &str, handler: F)
    where
        F: Fn(&NodeInner, Bytes, &str) + Send + 'static,
    {
        let mut rx = self.transport.subscribe(subject);
        let inner = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = inner.quit.cancelled() => return,
                        msg = rx.recv() => {
                            let Some(d) = msg else { return };
                            handler(&inner, d.payload, &d.reply);
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn wait_if_proposals_paused(&self) -> Result<()> {
        let mut paused = self.props_paused.subscribe();
        if !*paused.borrow() {
            return Ok(());
        }
        debug!("proposals paused, will wait");
        tokio::select! {
            _ = self.quit.cancelled() => Err(RaftError::ProposalFailed),
            res = tokio::time::timeout(PROPOSE_WAIT, paused.wait_for(|p| !*p)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(RaftError::ProposalFailed),
                Err(_) => Err(RaftError::ProposalsPaused),
            },
        }
    }

    pub(crate) async fn propose_add_peer(&self, peer: NodeId) -> Result<()> {
        if self.state.read().await.role != RaftRole::Leader {
            return Err(RaftError::NotLeader);
        }
        self.prop_tx
            .try_send(Entry::add_peer(peer))
            .map_err(|_| RaftError::ProposalFailed)
    }

    pub(crate) fn reset_election_timeout(&self, st: &mut RaftState) {
        st.elect_deadline = tokio::time::Instant::now()
            + random_timeout(self.cfg.election_timeout_min, self.cfg.election_timeout_max);
    }

    /// Shorten the election timer so we campaign soon.
    pub(crate) fn campaign_now(&self, st: &mut RaftState) -> Result<()> {
        debug!("starting campaign");
        if st.role == RaftRole::Leader {
            return Err(RaftError::AlreadyLeader);
        }
        st.elect_deadline = tokio::time::Instant::now()
            + random_timeout(self.cfg.campaign_timeout_min, self.cfg.campaign_timeout_max);
        self.elect_kick.notify_one();
        Ok(())
    }

    pub(crate) fn write_term_vote(&self, st: &RaftState) {
        if let Err(err) = storage::write_term_vote(&self.cfg.store_dir, st.term, st.vote) {
            warn!(error = %err, "failed to persist term/vote");
        }
    }

    pub(crate) fn write_peer_state_file(&self, st: &RaftState) {
        let ps = PeerState {
            cluster_size: st.cluster_size as u32,
            peers: st.peers.names(),
        };
        if let Err(err) = storage::write_peer_state(&self.cfg.store_dir, &ps) {
            warn!(error = %err, "failed to persist peer state");
        }
    }

    pub(crate) fn send_reply(&self, subject: &str, payload: Bytes) {
        if !subject.is_empty() {
            self.transport.publish(subject, "", payload);
        }
    }

    pub(crate) fn update_lead_change(&self, is_leader: bool) {
        self.lead_tx.send_replace(is_leader);
    }

    pub(crate) fn attempt_stepdown(&self, new_leader: Option<NodeId>) {
        if self.stepdown_tx.try_send(new_leader).is_err() {
            debug!("failed to place stepdown signal");
        }
    }

    async fn shutdown(&self, should_delete: bool) {
        {
            let mut st = self.state.write().await;
            if st.role == RaftRole::Closed {
                return;
            }
            st.role = RaftRole::Closed;
            if let Some(cs) = st.catchup.take() {
                cs.cancel.cancel();
            }
        }
        self.quit.cancel();

        if should_delete {
            for file in [storage::PEER_STATE_FILE, storage::TERM_VOTE_FILE] {
                let _ = fs::remove_file(self.cfg.store_dir.join(file));
            }
            if let Err(err) = self.wal.delete() {
                warn!(error = %err, "failed to delete WAL");
            }
            self.span.in_scope(|| info!("deleted"));
        } else {
            if let Err(err) = self.wal.stop() {
                warn!(error = %err, "failed to stop WAL");
            }
            self.span.in_scope(|| info!("shutdown"));
        }
    }
}
