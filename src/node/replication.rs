//! Log replication: append-entry processing, WAL storage, ack tracking and
//! commit advancement.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{RaftError, Result};
use crate::id::{NodeId, ID_LEN};
use crate::state::{AckSet, RaftRole, RaftState};
use crate::storage::WalError;
use crate::wire::{AppendEntry, AppendEntryResponse, Entry, EntryType, PeerState};

use super::{AppendSource, ApplyEvent, CommittedEntry, NodeInner};

/// Contiguous normal proposals are coalesced up to this many bytes per
/// append-entry.
pub(crate) const MAX_PROPOSAL_BATCH: usize = 256 * 1024;

impl NodeInner {
    pub(crate) fn load_entry(&self, seq: u64) -> std::result::Result<AppendEntry, WalError> {
        let frame = self.wal.load(seq)?;
        AppendEntry::decode(frame, "").ok_or(WalError::Corrupt)
    }

    pub(crate) fn load_first_entry(&self) -> std::result::Result<AppendEntry, WalError> {
        self.load_entry(self.wal.state().first_seq)
    }

    /// Record contact from a peer. A leader that has already registered a
    /// full cluster treats an extra peer as unknown (it joins through
    /// catch-up and an `AddPeer` entry instead).
    pub(crate) fn track_peer(&self, st: &mut RaftState, peer: NodeId) -> Result<()> {
        let mut announce = false;
        if st.role == RaftRole::Leader && !st.peers.contains(peer) {
            if st.peers.len() >= st.cluster_size {
                debug!(peer = %peer, "leader detected an unknown peer");
                return Err(RaftError::UnknownPeer);
            }
            announce = true;
        }
        st.peers.track(peer);
        if announce {
            self.send_peer_state(st);
        }
        Ok(())
    }

    /// Build, store and broadcast an append-entry with our current log
    /// position. An empty batch is a heartbeat.
    pub(crate) fn send_append_entry(&self, st: &mut RaftState, entries: Vec<Entry>) {
        let mut ae = AppendEntry::new(self.id, st.term, st.commit, st.pterm, st.pindex, entries);
        let buf = ae.encode();
        if !ae.entries.is_empty() {
            match self.store_to_wal(st, &ae) {
                Ok(()) => {}
                Err(WalError::Closed) => return,
                Err(err) => panic!("error storing append entry: {}", err),
            }
            // We count as the first ack toward commit.
            st.acks.insert(
                st.pindex,
                AckSet {
                    term: ae.term,
                    peers: HashSet::from([self.id]),
                },
            );
            if ae.entries.iter().any(|e| e.kind == EntryType::Snapshot) {
                st.sindex = st.pindex;
            }
            st.active = Instant::now();
        }
        self.transport
            .publish(&self.subjects.append, &self.subjects.append_reply, buf);
    }

    pub(crate) fn send_heartbeat(&self, st: &mut RaftState) {
        self.send_append_entry(st, Vec::new());
    }

    /// Broadcast our authoritative membership as a replicated entry.
    pub(crate) fn send_peer_state(&self, st: &mut RaftState) {
        let ps = PeerState {
            cluster_size: st.cluster_size as u32,
            peers: st.peers.names(),
        };
        self.send_append_entry(st, vec![Entry::new(EntryType::PeerState, ps.encode())]);
    }

    fn store_to_wal(&self, st: &mut RaftState, ae: &AppendEntry) -> std::result::Result<(), WalError> {
        let (seq, _ts) = self.wal.store(&ae.raw)?;
        if ae.pindex != seq - 1 {
            // The WAL and the replicated state have diverged; continuing
            // would corrupt the group.
            panic!(
                "append entry stored at wrong index, pindex {} seq {}",
                ae.pindex, seq
            );
        }
        st.pterm = ae.term;
        st.pindex = seq;
        Ok(())
    }

    /// The one processing path for append-entries: live traffic, catch-up
    /// inbox traffic and startup replay all come through here.
    pub(crate) fn process_append_entry(
        self: &Arc<Self>,
        st: &mut RaftState,
        ae: AppendEntry,
        source: AppendSource,
    ) {
        if st.role == RaftRole::Closed {
            return;
        }

        // A candidate seeing traffic from a legitimate leader converts.
        if st.role == RaftRole::Candidate {
            debug!(leader = %ae.leader, "received append entry as candidate, stepping down");
            st.term = ae.term;
            st.vote = None;
            self.write_term_vote(st);
            self.attempt_stepdown(Some(ae.leader));
        }

        let is_new = match source {
            AppendSource::Replay => false,
            AppendSource::Live => true,
            AppendSource::Catchup(session) => match &st.catchup {
                Some(cs) if cs.id == session => false,
                // Traffic raced the teardown of a cancelled session.
                _ => return,
            },
        };

        if is_new {
            self.reset_election_timeout(st);
            if !ae.leader.is_empty() {
                st.peers.track(ae.leader);
            }
        }

        if is_new && ae.term < st.term {
            debug!(term = ae.term, current = st.term, "ignoring append entry from old term");
            return;
        }

        // While a catch-up is in flight, live append-entries only feed stall
        // detection until the session target is reached.
        if st.catchup.is_some() && is_new {
            if st.catchup_done() {
                self.cancel_catchup(st);
            } else {
                if st.catchup_stalled() {
                    debug!("catchup may be stalled, will request again");
                    let inbox = self.create_catchup(st, &ae);
                    let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, false);
                    self.transport.publish(&ae.reply, &inbox, ar.encode());
                }
                return;
            }
        }

        if ae.term > st.term {
            st.term = ae.term;
            st.vote = None;
            self.write_term_vote(st);
            if !matches!(st.role, RaftRole::Follower | RaftRole::Observer) {
                debug!(role = %st.role, leader = %ae.leader, "higher term append entry, stepping down");
                self.attempt_stepdown(Some(ae.leader));
            }
        }

        if st.leader != Some(ae.leader) && matches!(st.role, RaftRole::Follower | RaftRole::Observer)
        {
            debug!(leader = %ae.leader, "updating leader");
            st.leader = Some(ae.leader);
            st.vote = None;
            self.write_term_vote(st);
            if is_new {
                self.reset_election_timeout(st);
                self.update_lead_change(false);
            }
        }

        if ae.pterm != st.pterm || ae.pindex != st.pindex {
            if matches!(source, AppendSource::Replay) {
                panic!(
                    "replayed entry does not match log position, ae {}/{} ours {}/{}",
                    ae.pterm, ae.pindex, st.pterm, st.pindex
                );
            }
            // A snapshot heading a catch-up stream resets our log wholesale.
            if st.catchup.is_some()
                && ae.entries.first().map(|e| e.kind) == Some(EntryType::Snapshot)
            {
                debug!(new_first = ae.pindex + 1, "snapshot while catching up, resetting log");
                if let Err(err) = self.wal.compact(ae.pindex + 1) {
                    warn!(error = %err, "failed to reset log for snapshot");
                }
                st.pindex = ae.pindex;
                st.commit = ae.pindex;
            } else {
                debug!(
                    ae_pterm = ae.pterm,
                    ae_pindex = ae.pindex,
                    pterm = st.pterm,
                    pindex = st.pindex,
                    "append entry did not match"
                );
                st.term = st.pterm;
                let inbox = self.create_catchup(st, &ae);
                let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, false);
                self.transport.publish(&ae.reply, &inbox, ar.encode());
                return;
            }
        }

        if !ae.entries.is_empty() {
            if matches!(source, AppendSource::Replay) {
                // Replay trusts the stored frame; the WAL already holds it.
                st.pterm = ae.term;
                st.pindex = ae.pindex + 1;
            } else {
                match self.store_to_wal(st, &ae) {
                    Ok(()) => {}
                    Err(WalError::Closed) => return,
                    Err(err) => {
                        debug!(error = %err, "error storing append entry");
                    }
                }
            }

            for e in &ae.entries {
                match e.kind {
                    EntryType::LeaderTransfer => {
                        if is_new && NodeId::from_bytes(&e.data) == self.id {
                            debug!("leader transfer addressed to us");
                            let _ = self.campaign_now(st);
                        }
                    }
                    EntryType::AddPeer => {
                        if e.data.len() == ID_LEN {
                            st.peers.track(NodeId::from_bytes(&e.data));
                        }
                    }
                    EntryType::Snapshot => {
                        if ae.pindex + 1 > st.sindex {
                            st.sindex = ae.pindex + 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        if ae.commit > st.commit {
            if st.paused {
                st.hcommit = ae.commit;
                debug!(commit = ae.commit, "apply paused, parking commit");
            } else {
                for index in (st.commit + 1)..=ae.commit {
                    if self.apply_commit(st, index).is_err() {
                        break;
                    }
                }
            }
        }

        if !ae.reply.is_empty() {
            let ar = AppendEntryResponse::new(st.pterm, st.pindex, self.id, true);
            self.send_reply(&ae.reply, ar.encode());
        }
    }

    /// Handle a successful ack from a follower: replication bookkeeping,
    /// catch-up progress, and quorum-driven commit advancement.
    pub(crate) fn track_response(&self, st: &mut RaftState, ar: &AppendEntryResponse) {
        st.peers.observe_index(ar.peer, ar.index);

        if let Some(updates) = st.progress.get(&ar.peer) {
            if updates.try_send(ar.index).is_err() {
                debug!(peer = %ar.peer, "catchup session not accepting index updates");
            }
        }

        if ar.index <= st.commit {
            return;
        }

        let mut have_quorum = false;
        if let Some(acks) = st.acks.get_mut(&ar.index) {
            // Only entries proposed in the current term advance commit by
            // counting; older entries commit as a side effect.
            if acks.term == st.term {
                acks.peers.insert(ar.peer);
                have_quorum = acks.peers.len() >= st.quorum;
            }
        }
        if have_quorum {
            for index in (st.commit + 1)..=ar.index {
                if self.apply_commit(st, index).is_err() {
                    break;
                }
            }
            // Idle leaders push the new commit index out right away.
            if self.prop_tx.capacity() == self.prop_tx.max_capacity() {
                self.send_heartbeat(st);
            }
        }
    }

    /// Advance commit to `index` and route the stored entries: user entries
    /// to the apply channel, membership entries applied here. A full apply
    /// channel rolls commit back; the next append-entry or ack retries.
    pub(crate) fn apply_commit(&self, st: &mut RaftState, index: u64) -> Result<()> {
        if index <= st.commit {
            debug!(index, "ignoring apply commit, already processed");
            return Ok(());
        }
        let original = st.commit;
        st.commit = index;

        if st.role == RaftRole::Leader {
            st.acks.remove(&index);
        }

        let ae = match self.load_entry(index) {
            Ok(ae) => ae,
            Err(err) => {
                debug!(index, error = %err, "error loading entry to apply");
                st.commit = original;
                return Err(RaftError::EntryLoadFailed);
            }
        };

        let mut committed = Vec::new();
        for e in ae.entries {
            match e.kind {
                EntryType::Normal | EntryType::Snapshot => committed.push(e),
                EntryType::PeerState => {
                    match PeerState::decode(&e.data) {
                        Ok(ps) => self.process_peer_state(st, &ps),
                        Err(err) => debug!(error = %err, "ignoring corrupt peer state entry"),
                    }
                }
                EntryType::AddPeer => {
                    let peer = NodeId::from_bytes(&e.data);
                    if !st.peers.contains(peer) {
                        debug!(
                            peer = %peer,
                            size = st.cluster_size + 1,
                            "added peer, expanding cluster"
                        );
                        st.set_cluster_size(st.cluster_size + 1);
                        st.peers.track(peer);
                    }
                    self.write_peer_state_file(st);
                }
                EntryType::RemovePeer | EntryType::LeaderTransfer => {}
            }
        }

        if !committed.is_empty() {
            let event = ApplyEvent::Committed(CommittedEntry {
                index,
                entries: committed,
            });
            if self.apply_tx.try_send(event).is_err() {
                debug!(index, "failed to place committed entry onto apply channel");
                st.commit = original;
                return Err(RaftError::FailedToApply);
            }
        } else {
            // Nothing user-visible in this batch.
            st.applied = index;
        }
        Ok(())
    }

    /// Adopt the leader's view of the membership.
    fn process_peer_state(&self, st: &mut RaftState, ps: &PeerState) {
        st.set_cluster_size(ps.cluster_size as usize);
        st.peers.reset_from(&ps.peers);
        debug!(size = st.cluster_size, "updated peers from leader");
        self.write_peer_state_file(st);
    }
}
