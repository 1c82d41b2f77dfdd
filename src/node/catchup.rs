//! Out-of-band catch-up of lagging followers over private inboxes.
//!
//! Leader side: one task per lagging peer streams historical frames with a
//! bounded number of outstanding bytes, replenished by the follower's acks.
//! Follower side: a catch-up session is a fresh inbox whose traffic funnels
//! into the regular append-entry path, plus stall detection that re-requests
//! when the leader goes quiet.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use crate::id::NodeId;
use crate::state::{Catchup, RaftRole, RaftState};
use crate::storage::WalError;
use crate::transport::new_inbox;
use crate::wire::{AppendEntry, AppendEntryResponse};

use super::{AppendSource, InboundAppend, NodeInner};

/// Cap on un-acked catch-up bytes in flight to one follower.
const MAX_CATCHUP_OUTSTANDING: usize = 48 * 1024 * 1024;

/// A session with no follower acks for this long is abandoned.
const CATCHUP_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);

const CATCHUP_LEADER_CHECK: Duration = Duration::from_millis(100);

/// How many unread index updates a leader-side session may buffer.
const CATCHUP_INDEX_UPDATES: usize = 1024;

impl NodeInner {
    /// Start (or restart) a follower-side catch-up session targeting the
    /// position carried by `ae`. Returns the session inbox to hand to the
    /// leader in our negative ack.
    pub(crate) fn create_catchup(self: &Arc<Self>, st: &mut RaftState, ae: &AppendEntry) -> String {
        if let Some(old) = st.catchup.take() {
            old.cancel.cancel();
        }
        let session = self.catchup_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let inbox = new_inbox();
        let cancel = self.quit.child_token();

        let mut rx = self.transport.subscribe(&inbox);
        let inner = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        msg = rx.recv() => {
                            let Some(d) = msg else { return };
                            let Some(cae) = AppendEntry::decode(d.payload, &d.reply) else {
                                continue;
                            };
                            let inbound = InboundAppend {
                                ae: cae,
                                source: AppendSource::Catchup(session),
                            };
                            if inner.append_tx.send(inbound).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        );

        st.catchup = Some(Catchup {
            id: session,
            cterm: ae.pterm,
            cindex: ae.pindex,
            pindex: st.pindex,
            hbs: 0,
            cancel,
        });
        inbox
    }

    pub(crate) fn cancel_catchup(&self, st: &mut RaftState) {
        debug!("cancelling catchup, we are up to date");
        if let Some(cs) = st.catchup.take() {
            cs.cancel.cancel();
        }
    }

    /// Leader side: a negative ack arrived; start streaming history to the
    /// follower's private inbox.
    pub(crate) fn catchup_follower(self: &Arc<Self>, st: &mut RaftState, ar: &AppendEntryResponse) {
        debug!(peer = %ar.peer, index = ar.index, "being asked to catch up follower");
        if st.progress.contains_key(&ar.peer) {
            debug!(peer = %ar.peer, "existing catchup session");
            return;
        }
        // Start right after the follower's last entry, falling back to our
        // first record when that has been compacted away.
        let ae = match self
            .load_entry(ar.index + 1)
            .or_else(|_| self.load_first_entry())
        {
            Ok(ae) => ae,
            Err(err) => {
                debug!(error = %err, "could not find a starting entry for catchup");
                return;
            }
        };
        if ae.pindex != ar.index || ae.pterm != ar.term {
            debug!(peer = %ar.peer, "first catchup entry does not match follower position");
        }

        let (tx, rx) = mpsc::channel(CATCHUP_INDEX_UPDATES);
        let _ = tx.try_send(ae.pindex);
        st.progress.insert(ar.peer, tx);

        let inner = Arc::clone(self);
        let peer = ar.peer;
        let subject = ar.reply.clone();
        let span = self.span.clone();
        tokio::spawn(async move { inner.run_catchup(peer, subject, rx).await }.instrument(span));
    }

    async fn run_catchup(self: Arc<Self>, peer: NodeId, subject: String, mut updates: mpsc::Receiver<u64>) {
        debug!(peer = %peer, "running catchup");
        let reply = self.subjects.append_reply.clone();

        let mut next: u64 = 0;
        let mut total: usize = 0;
        let mut outstanding: HashMap<u64, usize> = HashMap::new();

        let idle = tokio::time::sleep(CATCHUP_ACTIVITY_TIMEOUT);
        tokio::pin!(idle);
        let mut leader_check = tokio::time::interval(CATCHUP_LEADER_CHECK);

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = leader_check.tick() => {
                    if self.state.read().await.role != RaftRole::Leader {
                        debug!(peer = %peer, "catchup cancelled, no longer leader");
                        break;
                    }
                }
                _ = &mut idle => {
                    debug!(peer = %peer, "catchup stalled");
                    break;
                }
                maybe = updates.recv() => {
                    let Some(index) = maybe else { break };
                    idle.as_mut().reset(tokio::time::Instant::now() + CATCHUP_ACTIVITY_TIMEOUT);
                    if let Some(size) = outstanding.remove(&index) {
                        total = total.saturating_sub(size);
                    }
                    if index >= self.state.read().await.pindex {
                        debug!(peer = %peer, "finished catching up");
                        break;
                    }
                    if next < index {
                        next = index;
                    }
                    while total <= MAX_CATCHUP_OUTSTANDING {
                        next += 1;
                        match self.load_entry(next) {
                            Ok(ae) => {
                                outstanding.insert(next, ae.raw.len());
                                total += ae.raw.len();
                                self.transport.publish(&subject, &reply, ae.raw.clone());
                            }
                            Err(WalError::Eof) => break,
                            Err(err) => {
                                debug!(seq = next, error = %err, "error loading catchup entry");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Session teardown: a finished catch-up for a peer we do not track
        // yet means a new member, so propose it into the group.
        let known = {
            let mut st = self.state.write().await;
            st.progress.remove(&peer);
            st.peers.contains(peer)
        };
        if !known {
            debug!(peer = %peer, "catchup done for new peer, proposing add");
            if let Err(err) = self.propose_add_peer(peer).await {
                debug!(peer = %peer, error = %err, "could not propose new peer");
            }
        }
    }
}
