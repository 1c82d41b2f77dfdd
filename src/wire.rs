//! Fixed-layout little-endian framing for the consensus protocol.
//!
//! Every message type here has a hand-rolled binary layout so that the exact
//! wire bytes of an append-entry can be stored in the WAL and replayed after a
//! restart. Decoders return `None` on malformed input; callers drop such
//! messages silently.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RaftError;
use crate::id::{NodeId, ID_LEN};

/// Kind of a replicated log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Opaque payload for the upper-layer state machine.
    Normal = 0,
    /// A state-machine snapshot blob.
    Snapshot = 1,
    /// Encoded membership (cluster size + peer ids).
    PeerState = 2,
    /// A peer id joining the group.
    AddPeer = 3,
    /// Reserved; removal is not supported in this version.
    RemovePeer = 4,
    /// Target peer id for a leadership transfer.
    LeaderTransfer = 5,
}

impl EntryType {
    fn from_u8(tag: u8) -> Option<EntryType> {
        match tag {
            0 => Some(EntryType::Normal),
            1 => Some(EntryType::Snapshot),
            2 => Some(EntryType::PeerState),
            3 => Some(EntryType::AddPeer),
            4 => Some(EntryType::RemovePeer),
            5 => Some(EntryType::LeaderTransfer),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryType::Normal => write!(f, "Normal"),
            EntryType::Snapshot => write!(f, "Snapshot"),
            EntryType::PeerState => write!(f, "PeerState"),
            EntryType::AddPeer => write!(f, "AddPeer"),
            EntryType::RemovePeer => write!(f, "RemovePeer"),
            EntryType::LeaderTransfer => write!(f, "LeaderTransfer"),
        }
    }
}

/// A single tagged record carried inside an append-entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryType,
    pub data: Bytes,
}

impl Entry {
    pub fn new(kind: EntryType, data: Bytes) -> Self {
        Entry { kind, data }
    }

    pub fn normal(data: Bytes) -> Self {
        Entry::new(EntryType::Normal, data)
    }

    pub fn snapshot(data: Bytes) -> Self {
        Entry::new(EntryType::Snapshot, data)
    }

    pub fn add_peer(peer: NodeId) -> Self {
        Entry::new(EntryType::AddPeer, Bytes::copy_from_slice(peer.as_bytes()))
    }

    pub fn leader_transfer(peer: NodeId) -> Self {
        Entry::new(
            EntryType::LeaderTransfer,
            Bytes::copy_from_slice(peer.as_bytes()),
        )
    }
}

/// Base length of an append-entry frame: leader id, four u64 fields and the
/// u16 entry count.
pub const APPEND_ENTRY_BASE_LEN: usize = ID_LEN + 4 * 8 + 2;

/// The one message that carries both heartbeats (no entries) and log entries
/// from leader to follower. `pterm`/`pindex` name the slot immediately
/// preceding the first carried entry.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub leader: NodeId,
    pub term: u64,
    pub commit: u64,
    pub pterm: u64,
    pub pindex: u64,
    pub entries: Vec<Entry>,
    /// Reply inbox the sender is listening on. Not part of the frame.
    pub reply: String,
    /// The encoded frame, kept so it can be stored or forwarded verbatim.
    pub raw: Bytes,
}

impl AppendEntry {
    pub fn new(
        leader: NodeId,
        term: u64,
        commit: u64,
        pterm: u64,
        pindex: u64,
        entries: Vec<Entry>,
    ) -> Self {
        AppendEntry {
            leader,
            term,
            commit,
            pterm,
            pindex,
            entries,
            reply: String::new(),
            raw: Bytes::new(),
        }
    }

    /// Encode the frame, remembering the bytes in `self.raw`.
    pub fn encode(&mut self) -> Bytes {
        let elen: usize = self.entries.iter().map(|e| e.data.len() + 1 + 4).sum();
        let mut buf = BytesMut::with_capacity(APPEND_ENTRY_BASE_LEN + elen);
        buf.put_slice(self.leader.as_bytes());
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.commit);
        buf.put_u64_le(self.pterm);
        buf.put_u64_le(self.pindex);
        buf.put_u16_le(self.entries.len() as u16);
        for e in &self.entries {
            buf.put_u32_le(e.data.len() as u32 + 1);
            buf.put_u8(e.kind as u8);
            buf.put_slice(&e.data);
        }
        self.raw = buf.freeze();
        self.raw.clone()
    }

    /// Decode a frame. Entry payloads are zero-copy slices of `buf`.
    pub fn decode(buf: Bytes, reply: &str) -> Option<AppendEntry> {
        if buf.len() < APPEND_ENTRY_BASE_LEN {
            return None;
        }
        let leader = NodeId::from_bytes(&buf[..ID_LEN]);
        let term = read_u64(&buf[8..]);
        let commit = read_u64(&buf[16..]);
        let pterm = read_u64(&buf[24..]);
        let pindex = read_u64(&buf[32..]);
        let count = u16::from_le_bytes([buf[40], buf[41]]) as usize;

        let mut entries = Vec::with_capacity(count);
        let mut ri = APPEND_ENTRY_BASE_LEN;
        for _ in 0..count {
            if ri + 4 > buf.len() {
                return None;
            }
            let len = u32::from_le_bytes([buf[ri], buf[ri + 1], buf[ri + 2], buf[ri + 3]]) as usize;
            ri += 4;
            if len == 0 || ri + len > buf.len() {
                return None;
            }
            let kind = EntryType::from_u8(buf[ri])?;
            entries.push(Entry::new(kind, buf.slice(ri + 1..ri + len)));
            ri += len;
        }

        Some(AppendEntry {
            leader,
            term,
            commit,
            pterm,
            pindex,
            entries,
            reply: reply.to_string(),
            raw: buf,
        })
    }
}

pub const APPEND_ENTRY_RESPONSE_LEN: usize = 8 + 8 + ID_LEN + 1;

/// A follower's reply to an append-entry: its (pterm, pindex) and whether the
/// frame matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntryResponse {
    pub term: u64,
    pub index: u64,
    pub peer: NodeId,
    pub success: bool,
    /// Reply inbox for catch-up traffic. Not part of the frame.
    pub reply: String,
}

impl AppendEntryResponse {
    pub fn new(term: u64, index: u64, peer: NodeId, success: bool) -> Self {
        AppendEntryResponse {
            term,
            index,
            peer,
            success,
            reply: String::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(APPEND_ENTRY_RESPONSE_LEN);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.index);
        buf.put_slice(self.peer.as_bytes());
        buf.put_u8(self.success as u8);
        buf.freeze()
    }

    pub fn decode(buf: &[u8], reply: &str) -> Option<AppendEntryResponse> {
        if buf.len() != APPEND_ENTRY_RESPONSE_LEN {
            return None;
        }
        Some(AppendEntryResponse {
            term: read_u64(buf),
            index: read_u64(&buf[8..]),
            peer: NodeId::from_bytes(&buf[16..16 + ID_LEN]),
            success: buf[24] == 1,
            reply: reply.to_string(),
        })
    }
}

pub const VOTE_REQUEST_LEN: usize = 24 + ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub last_term: u64,
    pub last_index: u64,
    pub candidate: NodeId,
    /// Reply inbox the candidate is listening on. Not part of the frame.
    pub reply: String,
}

impl VoteRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VOTE_REQUEST_LEN);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.last_term);
        buf.put_u64_le(self.last_index);
        buf.put_slice(self.candidate.as_bytes());
        buf.freeze()
    }

    pub fn decode(buf: &[u8], reply: &str) -> Option<VoteRequest> {
        if buf.len() != VOTE_REQUEST_LEN {
            return None;
        }
        Some(VoteRequest {
            term: read_u64(buf),
            last_term: read_u64(&buf[8..]),
            last_index: read_u64(&buf[16..]),
            candidate: NodeId::from_bytes(&buf[24..24 + ID_LEN]),
            reply: reply.to_string(),
        })
    }
}

pub const VOTE_RESPONSE_LEN: usize = 8 + ID_LEN + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub peer: NodeId,
    pub granted: bool,
}

impl VoteResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VOTE_RESPONSE_LEN);
        buf.put_u64_le(self.term);
        buf.put_slice(self.peer.as_bytes());
        buf.put_u8(self.granted as u8);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Option<VoteResponse> {
        if buf.len() != VOTE_RESPONSE_LEN {
            return None;
        }
        Some(VoteResponse {
            term: read_u64(buf),
            peer: NodeId::from_bytes(&buf[8..8 + ID_LEN]),
            granted: buf[16] == 1,
        })
    }
}

/// Membership record: cluster size plus the known peer ids. Shared by the
/// `EntryType::PeerState` payload and the on-disk peer-state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub cluster_size: u32,
    pub peers: Vec<NodeId>,
}

impl PeerState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + ID_LEN * self.peers.len());
        buf.put_u32_le(self.cluster_size);
        buf.put_u32_le(self.peers.len() as u32);
        for peer in &self.peers {
            buf.put_slice(peer.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<PeerState, RaftError> {
        if buf.len() < 8 {
            return Err(RaftError::CorruptPeerState);
        }
        let cluster_size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let body = &buf[8..];
        if body.len() < count * ID_LEN {
            return Err(RaftError::CorruptPeerState);
        }
        let peers = body
            .chunks_exact(ID_LEN)
            .take(count)
            .map(NodeId::from_bytes)
            .collect();
        Ok(PeerState {
            cluster_size,
            peers,
        })
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from_hash(s)
    }

    #[test]
    fn test_append_entry_roundtrip() {
        let mut ae = AppendEntry::new(
            id("LDRAAAAA"),
            7,
            42,
            6,
            99,
            vec![
                Entry::normal(Bytes::from_static(b"hello")),
                Entry::add_peer(id("NEWPEER1")),
            ],
        );
        let buf = ae.encode();
        let decoded = AppendEntry::decode(buf.clone(), "$NRG.R.reply").unwrap();

        assert_eq!(decoded.leader, ae.leader);
        assert_eq!(decoded.term, 7);
        assert_eq!(decoded.commit, 42);
        assert_eq!(decoded.pterm, 6);
        assert_eq!(decoded.pindex, 99);
        assert_eq!(decoded.entries, ae.entries);
        assert_eq!(decoded.reply, "$NRG.R.reply");
        assert_eq!(decoded.raw, buf);
    }

    #[test]
    fn test_append_entry_heartbeat_is_base_len() {
        let mut hb = AppendEntry::new(id("LDRAAAAA"), 3, 10, 3, 10, Vec::new());
        let buf = hb.encode();
        assert_eq!(buf.len(), APPEND_ENTRY_BASE_LEN);

        let decoded = AppendEntry::decode(buf, "").unwrap();
        assert!(decoded.entries.is_empty());
    }

    #[test]
    fn test_append_entry_rejects_truncated() {
        let mut ae = AppendEntry::new(
            id("LDRAAAAA"),
            1,
            0,
            0,
            0,
            vec![Entry::normal(Bytes::from_static(b"payload"))],
        );
        let buf = ae.encode();

        // Too short for the base header.
        assert!(AppendEntry::decode(buf.slice(..20), "").is_none());
        // Entry length points past the end of the buffer.
        assert!(AppendEntry::decode(buf.slice(..buf.len() - 3), "").is_none());
    }

    #[test]
    fn test_append_entry_rejects_bad_entry_type() {
        let mut ae = AppendEntry::new(
            id("LDRAAAAA"),
            1,
            0,
            0,
            0,
            vec![Entry::normal(Bytes::from_static(b"x"))],
        );
        let buf = ae.encode();
        let mut bad = buf.to_vec();
        bad[APPEND_ENTRY_BASE_LEN + 4] = 0xff;
        assert!(AppendEntry::decode(Bytes::from(bad), "").is_none());
    }

    #[test]
    fn test_append_entry_response_roundtrip() {
        let ar = AppendEntryResponse::new(5, 123, id("PEERAAAA"), true);
        let buf = ar.encode();
        assert_eq!(buf.len(), APPEND_ENTRY_RESPONSE_LEN);

        let mut decoded = AppendEntryResponse::decode(&buf, "$NRG.R.cu").unwrap();
        assert_eq!(decoded.reply, "$NRG.R.cu");
        decoded.reply.clear();
        assert_eq!(decoded, ar);

        assert!(AppendEntryResponse::decode(&buf[..10], "").is_none());
    }

    #[test]
    fn test_vote_request_roundtrip() {
        let vr = VoteRequest {
            term: 9,
            last_term: 8,
            last_index: 200,
            candidate: id("CANDIDAT"),
            reply: String::new(),
        };
        let buf = vr.encode();
        assert_eq!(buf.len(), VOTE_REQUEST_LEN);

        let mut decoded = VoteRequest::decode(&buf, "$NRG.R.v").unwrap();
        assert_eq!(decoded.reply, "$NRG.R.v");
        decoded.reply.clear();
        assert_eq!(decoded, vr);

        assert!(VoteRequest::decode(&buf[1..], "").is_none());
    }

    #[test]
    fn test_vote_response_roundtrip() {
        for granted in [true, false] {
            let vr = VoteResponse {
                term: 4,
                peer: id("VOTERAAA"),
                granted,
            };
            let buf = vr.encode();
            assert_eq!(buf.len(), VOTE_RESPONSE_LEN);
            assert_eq!(VoteResponse::decode(&buf).unwrap(), vr);
        }
    }

    #[test]
    fn test_peer_state_roundtrip() {
        let ps = PeerState {
            cluster_size: 3,
            peers: vec![id("AAAAAAAA"), id("BBBBBBBB"), id("CCCCCCCC")],
        };
        let buf = ps.encode();
        assert_eq!(PeerState::decode(&buf).unwrap(), ps);
    }

    #[test]
    fn test_peer_state_rejects_short_buffer() {
        let ps = PeerState {
            cluster_size: 2,
            peers: vec![id("AAAAAAAA"), id("BBBBBBBB")],
        };
        let buf = ps.encode();
        assert!(PeerState::decode(&buf[..buf.len() - 1]).is_err());
        assert!(PeerState::decode(&buf[..4]).is_err());
    }

    #[test]
    fn test_entry_type_tags_are_stable() {
        let tags = [
            (0u8, EntryType::Normal),
            (1, EntryType::Snapshot),
            (2, EntryType::PeerState),
            (3, EntryType::AddPeer),
            (4, EntryType::RemovePeer),
            (5, EntryType::LeaderTransfer),
        ];
        for (tag, kind) in tags {
            assert_eq!(EntryType::from_u8(tag), Some(kind));
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(EntryType::from_u8(6), None);
    }
}
