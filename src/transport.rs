//! Thin adapter over the host's subject-addressed pub/sub fabric.
//!
//! The consensus core only needs fire-and-forget publish plus per-subject
//! subscriptions; everything else (routing, connectivity, retransmission) is
//! the fabric's problem. [`MemoryBus`] is an in-process fabric for tests and
//! the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;

pub const VOTE_SUBJECT: &str = "$NRG.V";
pub const APPEND_SUBJECT: &str = "$NRG.E";
pub const PROPOSAL_SUBJECT: &str = "$NRG.P";
pub const REPLY_SUBJECT: &str = "$NRG.R";

const INBOX_SUFFIX_LEN: usize = 12;

/// One message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub reply: String,
    pub payload: Bytes,
}

/// Contract the host's messaging fabric must satisfy. Publishing never
/// blocks; subscriptions end when the receiver is dropped.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, subject: &str, reply: &str, payload: Bytes);

    fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<Delivery>;
}

/// The per-group subjects a node publishes to and listens on.
#[derive(Debug, Clone)]
pub struct Subjects {
    /// Vote requests for the group.
    pub vote: String,
    /// This node's vote-response inbox.
    pub vote_reply: String,
    /// Append-entries for the group.
    pub append: String,
    /// This node's append-response inbox.
    pub append_reply: String,
    /// Proposal forwarding for non-leaders.
    pub propose: String,
}

impl Subjects {
    pub fn new(cluster: &str, group: &str) -> Self {
        Subjects {
            vote: format!("{}.{}.{}", VOTE_SUBJECT, cluster, group),
            vote_reply: new_inbox(),
            append: format!("{}.{}.{}", APPEND_SUBJECT, cluster, group),
            append_reply: new_inbox(),
            propose: format!("{}.{}", PROPOSAL_SUBJECT, group),
        }
    }
}

/// Mint a fresh reply inbox.
pub fn new_inbox() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..INBOX_SUFFIX_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect();
    format!("{}.{}", REPLY_SUBJECT, suffix)
}

/// In-process pub/sub fabric. Each node attaches through a named
/// [`BusEndpoint`]; tests can cut and heal links between endpoints to
/// simulate partitions.
pub struct MemoryBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    subs: HashMap<String, Vec<BusSub>>,
    cuts: HashSet<(String, String)>,
}

struct BusSub {
    endpoint: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBus {
            inner: Mutex::new(BusInner {
                subs: HashMap::new(),
                cuts: HashSet::new(),
            }),
        })
    }

    /// Attach a named endpoint to the bus.
    pub fn endpoint(self: &Arc<Self>, name: impl Into<String>) -> BusEndpoint {
        BusEndpoint {
            name: name.into(),
            bus: Arc::clone(self),
        }
    }

    /// Drop all traffic between two endpoints, in both directions.
    pub fn cut(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.cuts.insert((a.to_string(), b.to_string()));
        inner.cuts.insert((b.to_string(), a.to_string()));
    }

    /// Restore traffic between two endpoints.
    pub fn heal(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.cuts.remove(&(a.to_string(), b.to_string()));
        inner.cuts.remove(&(b.to_string(), a.to_string()));
    }

    // No echo: an endpoint never hears its own publishes, matching the
    // fabric the core runs on in production.
    fn publish_from(&self, origin: &str, subject: &str, reply: &str, payload: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        let BusInner { subs, cuts } = &mut *inner;
        if let Some(list) = subs.get_mut(subject) {
            list.retain(|sub| {
                if sub.endpoint == origin
                    || cuts.contains(&(origin.to_string(), sub.endpoint.clone()))
                {
                    return true;
                }
                sub.tx
                    .send(Delivery {
                        subject: subject.to_string(),
                        reply: reply.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            });
        }
    }

    fn subscribe_from(&self, endpoint: &str, subject: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subs.entry(subject.to_string()).or_default().push(BusSub {
            endpoint: endpoint.to_string(),
            tx,
        });
        rx
    }
}

/// A node's attachment to a [`MemoryBus`].
#[derive(Clone)]
pub struct BusEndpoint {
    name: String,
    bus: Arc<MemoryBus>,
}

impl Transport for BusEndpoint {
    fn publish(&self, subject: &str, reply: &str, payload: Bytes) {
        self.bus.publish_from(&self.name, subject, reply, payload);
    }

    fn subscribe(&self, subject: &str) -> mpsc::UnboundedReceiver<Delivery> {
        self.bus.subscribe_from(&self.name, subject)
    }
}
