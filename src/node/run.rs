//! The role-dispatched main loop and elections.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::id::NodeId;
use crate::state::{RaftRole, RaftState};
use crate::wire::{Entry, EntryType, VoteRequest, VoteResponse};

use super::replication::MAX_PROPOSAL_BATCH;
use super::{LoopRx, NodeInner};

/// Drive the node until it closes. The current role picks which select arms
/// are live; transitions return to this dispatcher.
pub(crate) async fn run(inner: Arc<NodeInner>, mut rx: LoopRx) {
    loop {
        if inner.quit.is_cancelled() {
            return;
        }
        let role = inner.state.read().await.role;
        match role {
            RaftRole::Follower | RaftRole::Observer => inner.run_as_follower(&mut rx).await,
            RaftRole::Candidate => inner.run_as_candidate(&mut rx).await,
            RaftRole::Leader => inner.run_as_leader(&mut rx).await,
            RaftRole::Closed => return,
        }
    }
}

impl NodeInner {
    async fn run_as_follower(self: &Arc<Self>, rx: &mut LoopRx) {
        loop {
            let deadline = self.state.read().await.elect_deadline;
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = time::sleep_until(deadline) => {
                    self.switch_to_candidate().await;
                    return;
                }
                _ = self.elect_kick.notified() => {}
                Some(inbound) = rx.append.recv() => {
                    let mut st = self.state.write().await;
                    self.process_append_entry(&mut st, inbound.ae, inbound.source);
                }
                Some(vr) = rx.vote_req.recv() => {
                    let mut st = self.state.write().await;
                    self.process_vote_request(&mut st, vr);
                }
                Some(new_leader) = rx.stepdown.recv() => {
                    self.switch_to_follower(new_leader).await;
                    return;
                }
                // Not meaningful outside candidacy / leadership.
                Some(_) = rx.vote_resp.recv() => {}
                Some(_) = rx.resp.recv() => {}
            }
        }
    }

    async fn run_as_candidate(self: &Arc<Self>, rx: &mut LoopRx) {
        // Drain responses from any previous election.
        while rx.vote_resp.try_recv().is_ok() {}

        self.request_vote().await;
        let mut votes: usize = 1; // our own

        loop {
            let deadline = self.state.read().await.elect_deadline;
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = time::sleep_until(deadline) => {
                    // Nobody won; try again in a fresh term.
                    self.switch_to_candidate().await;
                    return;
                }
                _ = self.elect_kick.notified() => {}
                Some(vresp) = rx.vote_resp.recv() => {
                    let mut st = self.state.write().await;
                    st.peers.track(vresp.peer);
                    if vresp.term > st.term {
                        st.term = vresp.term;
                        st.vote = None;
                        self.write_term_vote(&st);
                        drop(st);
                        self.switch_to_follower(None).await;
                        return;
                    }
                    if vresp.granted && vresp.term == st.term {
                        votes += 1;
                        debug!(votes, needed = st.quorum, "received vote");
                        if st.won_election(votes) {
                            drop(st);
                            self.switch_to_leader().await;
                            return;
                        }
                    }
                }
                Some(vr) = rx.vote_req.recv() => {
                    let mut st = self.state.write().await;
                    self.process_vote_request(&mut st, vr);
                }
                Some(inbound) = rx.append.recv() => {
                    let mut st = self.state.write().await;
                    self.process_append_entry(&mut st, inbound.ae, inbound.source);
                }
                Some(new_leader) = rx.stepdown.recv() => {
                    self.switch_to_follower(new_leader).await;
                    return;
                }
                Some(_) = rx.resp.recv() => {}
            }
        }
    }

    async fn run_as_leader(self: &Arc<Self>, rx: &mut LoopRx) {
        // Accept forwarded proposals only while leading.
        let forward = self.spawn_proposal_forwarder();
        {
            let mut st = self.state.write().await;
            self.send_peer_state(&mut st);
        }

        let mut heartbeat = time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = heartbeat.tick() => {
                    let mut st = self.state.write().await;
                    if st.active.elapsed() > self.cfg.heartbeat_interval {
                        self.send_heartbeat(&mut st);
                    }
                    if st.peers.lost_quorum(st.quorum, self.cfg.lost_quorum_interval) {
                        warn!("lost quorum, stepping down");
                        drop(st);
                        self.switch_to_follower(None).await;
                        break;
                    }
                }
                Some(first) = rx.prop.recv() => {
                    let (batch, carry) = gather_batch(first, &mut rx.prop);
                    let mut st = self.state.write().await;
                    self.send_append_entry(&mut st, batch);
                    if let Some(control) = carry {
                        self.send_append_entry(&mut st, vec![control]);
                    }
                }
                Some(vresp) = rx.vote_resp.recv() => {
                    let mut st = self.state.write().await;
                    if vresp.term > st.term {
                        drop(st);
                        self.switch_to_follower(None).await;
                        break;
                    }
                    let _ = self.track_peer(&mut st, vresp.peer);
                }
                Some(vr) = rx.vote_req.recv() => {
                    let mut st = self.state.write().await;
                    self.process_vote_request(&mut st, vr);
                }
                Some(inbound) = rx.append.recv() => {
                    let mut st = self.state.write().await;
                    self.process_append_entry(&mut st, inbound.ae, inbound.source);
                }
                Some(ar) = rx.resp.recv() => {
                    let mut st = self.state.write().await;
                    let _ = self.track_peer(&mut st, ar.peer);
                    if ar.success {
                        self.track_response(&mut st, &ar);
                    } else if !ar.reply.is_empty() {
                        self.catchup_follower(&mut st, &ar);
                    }
                }
                Some(new_leader) = rx.stepdown.recv() => {
                    self.switch_to_follower(new_leader).await;
                    break;
                }
            }
        }
        forward.abort();
    }

    fn spawn_proposal_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.transport.subscribe(&self.subjects.propose);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                if inner.prop_tx.try_send(Entry::normal(d.payload)).is_err() {
                    warn!("dropping forwarded proposal, queue full");
                }
            }
        })
    }

    /// Vote for ourselves and broadcast the request.
    async fn request_vote(&self) {
        let mut st = self.state.write().await;
        if st.role != RaftRole::Candidate {
            return;
        }
        st.vote = Some(self.id);
        self.write_term_vote(&st);
        let vr = VoteRequest {
            term: st.term,
            last_term: st.pterm,
            last_index: st.pindex,
            candidate: self.id,
            reply: String::new(),
        };
        drop(st);

        debug!(term = vr.term, "sending out vote request");
        self.transport
            .publish(&self.subjects.vote, &self.subjects.vote_reply, vr.encode());
    }

    pub(crate) fn process_vote_request(&self, st: &mut RaftState, vr: VoteRequest) {
        debug!(candidate = %vr.candidate, term = vr.term, "received a vote request");
        let mut resp = VoteResponse {
            term: st.term,
            peer: self.id,
            granted: false,
        };

        if self.track_peer(st, vr.candidate).is_err() {
            self.send_reply(&vr.reply, resp.encode());
            return;
        }

        // Ignore if we are newer.
        if vr.term < st.term {
            self.send_reply(&vr.reply, resp.encode());
            return;
        }

        if vr.term > st.term {
            st.term = vr.term;
            st.vote = None;
            self.write_term_vote(st);
            if st.role == RaftRole::Candidate {
                debug!(term = vr.term, "stepping down from candidate, higher term");
                self.attempt_stepdown(None);
            }
        }

        if st.grants_vote(&vr) {
            resp.granted = true;
            st.vote = Some(vr.candidate);
            self.write_term_vote(st);
            self.reset_election_timeout(st);
        }
        resp.term = st.term;
        debug!(granted = resp.granted, "sending vote response");
        self.send_reply(&vr.reply, resp.encode());
    }

    pub(crate) async fn switch_to_follower(&self, leader: Option<NodeId>) {
        info!(leader = %leader.map(|l| l.to_string()).unwrap_or_default(), "switching to follower");
        let mut st = self.state.write().await;
        st.leader = leader;
        self.switch_state(&mut st, RaftRole::Follower);
    }

    async fn switch_to_candidate(&self) {
        let mut st = self.state.write().await;
        if st.role != RaftRole::Candidate {
            info!(term = st.term + 1, "switching to candidate");
        } else if st.peers.lost_quorum(st.quorum, self.cfg.lost_quorum_interval) {
            // Let the upper layers alert on a lost quorum.
            self.update_lead_change(false);
        }
        st.term += 1;
        st.leader = None;
        self.switch_state(&mut st, RaftRole::Candidate);
    }

    async fn switch_to_leader(&self) {
        info!("switching to leader");
        let mut st = self.state.write().await;
        st.leader = Some(self.id);
        self.switch_state(&mut st, RaftRole::Leader);
    }

    fn switch_state(&self, st: &mut RaftState, role: RaftRole) {
        if st.role == RaftRole::Closed {
            return;
        }
        self.reset_election_timeout(st);
        if st.role == RaftRole::Leader && role != RaftRole::Leader {
            st.acks.clear();
            self.update_lead_change(false);
        } else if role == RaftRole::Leader && st.role != RaftRole::Leader {
            self.update_lead_change(true);
        }
        st.role = role;
        st.vote = None;
        self.write_term_vote(st);
    }
}

/// Coalesce contiguous normal proposals into one batch. A control entry
/// never shares a batch with normals; it is carried over to its own frame.
fn gather_batch(first: Entry, prop: &mut mpsc::Receiver<Entry>) -> (Vec<Entry>, Option<Entry>) {
    let mut batch = vec![first];
    let mut carry = None;
    if batch[0].kind == EntryType::Normal {
        let mut size = batch[0].data.len() + 1;
        while size < MAX_PROPOSAL_BATCH {
            match prop.try_recv() {
                Ok(e) if e.kind == EntryType::Normal => {
                    size += e.data.len() + 1;
                    batch.push(e);
                }
                Ok(e) => {
                    carry = Some(e);
                    break;
                }
                Err(_) => break,
            }
        }
    }
    (batch, carry)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn normal(data: &'static [u8]) -> Entry {
        Entry::normal(Bytes::from_static(data))
    }

    #[test]
    fn test_gather_batch_coalesces_normals() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.try_send(normal(b"b")).unwrap();
        tx.try_send(normal(b"c")).unwrap();

        let (batch, carry) = gather_batch(normal(b"a"), &mut rx);
        assert_eq!(batch.len(), 3);
        assert!(carry.is_none());
    }

    #[test]
    fn test_gather_batch_respects_size_cap() {
        let (tx, mut rx) = mpsc::channel(16);
        let big = Entry::normal(Bytes::from(vec![0u8; MAX_PROPOSAL_BATCH]));
        tx.try_send(normal(b"next")).unwrap();

        let (batch, carry) = gather_batch(big, &mut rx);
        assert_eq!(batch.len(), 1);
        assert!(carry.is_none());
        // The queued entry is still there for the next round.
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_gather_batch_carries_control_entries() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.try_send(normal(b"b")).unwrap();
        tx.try_send(Entry::snapshot(Bytes::from_static(b"snap"))).unwrap();
        tx.try_send(normal(b"late")).unwrap();

        let (batch, carry) = gather_batch(normal(b"a"), &mut rx);
        assert_eq!(batch.len(), 2);
        assert_eq!(carry.unwrap().kind, EntryType::Snapshot);
        // Entries after the control stay queued.
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_gather_batch_control_first_never_coalesces() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.try_send(normal(b"b")).unwrap();

        let snap = Entry::snapshot(Bytes::from_static(b"snap"));
        let (batch, carry) = gather_batch(snap, &mut rx);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, EntryType::Snapshot);
        assert!(carry.is_none());
        assert!(rx.try_recv().is_ok());
    }
}
