//! Durable state for a consensus group.
//!
//! Each group keeps two tiny files next to its WAL: `peers.idx` (known peers
//! plus the expected cluster size) and `tav.idx` (current term and the last
//! vote). The WAL itself is host-provided through the [`Wal`] contract; one
//! encoded append-entry frame is stored per slot and the stored bytes are
//! replayed verbatim on restart.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

use crate::error::{RaftError, Result};
use crate::id::{NodeId, ID_LEN};
use crate::wire::PeerState;

pub const PEER_STATE_FILE: &str = "peers.idx";
pub const TERM_VOTE_FILE: &str = "tav.idx";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("no record found")]
    NotFound,

    #[error("end of store")]
    Eof,

    #[error("store is closed")]
    Closed,

    #[error("corrupt record")]
    Corrupt,

    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Aggregate state of a WAL. `first_seq > last_seq` means the store is empty;
/// an empty store may still be positioned so that the next append is assigned
/// `first_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalState {
    pub first_seq: u64,
    pub last_seq: u64,
    pub entries: u64,
    pub bytes: u64,
}

/// Contract the host's append-only record log must satisfy. Sequences are
/// strictly increasing and assigned by the store.
pub trait Wal: Send + Sync + 'static {
    /// Append one record, returning its sequence and a nanosecond timestamp.
    fn store(&self, frame: &[u8]) -> std::result::Result<(u64, i64), WalError>;

    /// Load the record at `seq`.
    fn load(&self, seq: u64) -> std::result::Result<Bytes, WalError>;

    /// Delete one record. Returns whether a record was removed.
    fn remove(&self, seq: u64) -> std::result::Result<bool, WalError>;

    /// Discard all records below `new_first`, returning the new first
    /// sequence. The record at `new_first` (if any) survives, and an emptied
    /// store is positioned so the next append is assigned `new_first`.
    fn compact(&self, new_first: u64) -> std::result::Result<u64, WalError>;

    fn state(&self) -> WalState;

    /// Close the store, preserving its contents.
    fn stop(&self) -> std::result::Result<(), WalError>;

    /// Close the store and erase its contents.
    fn delete(&self) -> std::result::Result<(), WalError>;
}

/// In-memory [`Wal`] used by tests and the demo binary.
pub struct MemoryWal {
    inner: Mutex<MemWal>,
}

struct MemWal {
    first_seq: u64,
    slots: VecDeque<Option<Bytes>>,
    bytes: u64,
    closed: bool,
}

impl MemoryWal {
    pub fn new() -> Self {
        MemoryWal {
            inner: Mutex::new(MemWal {
                first_seq: 1,
                slots: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
        }
    }

    /// Reopen a stopped store, simulating a host restart over the same log.
    pub fn reopen(&self) {
        self.inner.lock().unwrap().closed = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemWal> {
        self.inner.lock().unwrap()
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl Wal for MemoryWal {
    fn store(&self, frame: &[u8]) -> std::result::Result<(u64, i64), WalError> {
        let mut wal = self.lock();
        if wal.closed {
            return Err(WalError::Closed);
        }
        let seq = wal.first_seq + wal.slots.len() as u64;
        wal.slots.push_back(Some(Bytes::copy_from_slice(frame)));
        wal.bytes += frame.len() as u64;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok((seq, ts))
    }

    fn load(&self, seq: u64) -> std::result::Result<Bytes, WalError> {
        let wal = self.lock();
        if wal.closed {
            return Err(WalError::Closed);
        }
        if seq < wal.first_seq {
            return Err(WalError::NotFound);
        }
        let next = wal.first_seq + wal.slots.len() as u64;
        if seq >= next {
            return Err(WalError::Eof);
        }
        match &wal.slots[(seq - wal.first_seq) as usize] {
            Some(frame) => Ok(frame.clone()),
            None => Err(WalError::NotFound),
        }
    }

    fn remove(&self, seq: u64) -> std::result::Result<bool, WalError> {
        let mut wal = self.lock();
        if wal.closed {
            return Err(WalError::Closed);
        }
        if seq < wal.first_seq {
            return Ok(false);
        }
        let idx = (seq - wal.first_seq) as usize;
        if idx >= wal.slots.len() {
            return Ok(false);
        }
        match wal.slots[idx].take() {
            Some(frame) => {
                wal.bytes -= frame.len() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compact(&self, new_first: u64) -> std::result::Result<u64, WalError> {
        let mut wal = self.lock();
        if wal.closed {
            return Err(WalError::Closed);
        }
        while wal.first_seq < new_first {
            match wal.slots.pop_front() {
                Some(slot) => {
                    if let Some(frame) = slot {
                        wal.bytes -= frame.len() as u64;
                    }
                    wal.first_seq += 1;
                }
                None => {
                    // Empty store: position it so the next append lands at
                    // new_first.
                    wal.first_seq = new_first;
                }
            }
        }
        Ok(wal.first_seq)
    }

    fn state(&self) -> WalState {
        let wal = self.lock();
        WalState {
            first_seq: wal.first_seq,
            last_seq: wal.first_seq + wal.slots.len() as u64 - 1,
            entries: wal.slots.iter().filter(|s| s.is_some()).count() as u64,
            bytes: wal.bytes,
        }
    }

    fn stop(&self) -> std::result::Result<(), WalError> {
        self.lock().closed = true;
        Ok(())
    }

    fn delete(&self) -> std::result::Result<(), WalError> {
        let mut wal = self.lock();
        wal.closed = true;
        wal.slots.clear();
        wal.bytes = 0;
        wal.first_seq = 1;
        Ok(())
    }
}

/// Write the bootstrap peer-state file for a new group. `expected` is raised
/// to cover the known peers and never drops below two.
pub fn bootstrap_group(store_dir: &Path, known_peers: &[NodeId], expected: usize) -> Result<()> {
    if store_dir.as_os_str().is_empty() {
        return Err(RaftError::NoConfig);
    }
    fs::create_dir_all(store_dir)?;
    let cluster_size = expected.max(known_peers.len()).max(2);
    let ps = PeerState {
        cluster_size: cluster_size as u32,
        peers: known_peers.to_vec(),
    };
    write_peer_state(store_dir, &ps)?;
    Ok(())
}

pub fn write_peer_state(store_dir: &Path, ps: &PeerState) -> io::Result<()> {
    let path = store_dir.join(PEER_STATE_FILE);
    if let Err(err) = fs::metadata(&path) {
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }
    fs::write(path, ps.encode())
}

pub fn read_peer_state(store_dir: &Path) -> Result<PeerState> {
    let buf = fs::read(store_dir.join(PEER_STATE_FILE))?;
    PeerState::decode(&buf)
}

/// Record the current term and vote. The vote bytes are omitted entirely when
/// no vote has been cast this term.
pub fn write_term_vote(store_dir: &Path, term: u64, vote: Option<NodeId>) -> io::Result<()> {
    let path = store_dir.join(TERM_VOTE_FILE);
    if let Err(err) = fs::metadata(&path) {
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }
    let mut buf = Vec::with_capacity(8 + ID_LEN);
    buf.extend_from_slice(&term.to_le_bytes());
    if let Some(vote) = vote {
        buf.extend_from_slice(vote.as_bytes());
    }
    fs::write(path, buf)
}

pub fn read_term_vote(store_dir: &Path) -> io::Result<(u64, Option<NodeId>)> {
    let buf = match fs::read(store_dir.join(TERM_VOTE_FILE)) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, None)),
        Err(err) => return Err(err),
    };
    if buf.len() < 8 {
        return Ok((0, None));
    }
    let term = u64::from_le_bytes(buf[..8].try_into().unwrap());
    let vote = if buf.len() >= 8 + ID_LEN {
        let id = NodeId::from_bytes(&buf[8..8 + ID_LEN]);
        (!id.is_empty()).then_some(id)
    } else {
        None
    };
    Ok((term, vote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_wal_assigns_increasing_seqs() {
        let wal = MemoryWal::new();
        let (s1, _) = wal.store(b"one").unwrap();
        let (s2, _) = wal.store(b"two").unwrap();
        assert_eq!((s1, s2), (1, 2));

        assert_eq!(wal.load(1).unwrap(), Bytes::from_static(b"one"));
        assert_eq!(wal.load(2).unwrap(), Bytes::from_static(b"two"));
        assert!(matches!(wal.load(3), Err(WalError::Eof)));
    }

    #[test]
    fn test_memory_wal_state() {
        let wal = MemoryWal::new();
        wal.store(b"abc").unwrap();
        wal.store(b"defg").unwrap();

        let state = wal.state();
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 2);
        assert_eq!(state.entries, 2);
        assert_eq!(state.bytes, 7);
    }

    #[test]
    fn test_memory_wal_remove() {
        let wal = MemoryWal::new();
        wal.store(b"abc").unwrap();
        assert!(wal.remove(1).unwrap());
        assert!(!wal.remove(1).unwrap());
        assert!(!wal.remove(9).unwrap());
        assert!(matches!(wal.load(1), Err(WalError::NotFound)));
        assert_eq!(wal.state().entries, 0);
    }

    #[test]
    fn test_memory_wal_compact_keeps_new_first() {
        let wal = MemoryWal::new();
        for i in 0..5u8 {
            wal.store(&[i]).unwrap();
        }
        assert_eq!(wal.compact(4).unwrap(), 4);

        assert!(matches!(wal.load(3), Err(WalError::NotFound)));
        assert_eq!(wal.load(4).unwrap(), Bytes::from_static(&[3]));
        let state = wal.state();
        assert_eq!((state.first_seq, state.last_seq), (4, 5));
    }

    #[test]
    fn test_memory_wal_compact_positions_empty_store() {
        let wal = MemoryWal::new();
        assert_eq!(wal.compact(501).unwrap(), 501);

        let (seq, _) = wal.store(b"snap").unwrap();
        assert_eq!(seq, 501);

        let state = wal.state();
        assert_eq!((state.first_seq, state.last_seq), (501, 501));
    }

    #[test]
    fn test_memory_wal_stop_and_reopen() {
        let wal = MemoryWal::new();
        wal.store(b"abc").unwrap();
        wal.stop().unwrap();
        assert!(matches!(wal.store(b"x"), Err(WalError::Closed)));
        assert!(matches!(wal.load(1), Err(WalError::Closed)));

        wal.reopen();
        assert_eq!(wal.load(1).unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_memory_wal_delete_erases() {
        let wal = MemoryWal::new();
        wal.store(b"abc").unwrap();
        wal.delete().unwrap();
        wal.reopen();
        let state = wal.state();
        assert_eq!(state.entries, 0);
        assert_eq!(state.first_seq, 1);
    }

    #[test]
    fn test_peer_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PeerState {
            cluster_size: 3,
            peers: vec![NodeId::from_hash("AAAAAAAA"), NodeId::from_hash("BBBBBBBB")],
        };
        write_peer_state(dir.path(), &ps).unwrap();
        assert_eq!(read_peer_state(dir.path()).unwrap(), ps);
    }

    #[test]
    fn test_peer_state_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PEER_STATE_FILE), [1, 2, 3]).unwrap();
        assert!(matches!(
            read_peer_state(dir.path()),
            Err(RaftError::CorruptPeerState)
        ));
    }

    #[test]
    fn test_term_vote_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let voted = NodeId::from_hash("CANDIDAT");

        write_term_vote(dir.path(), 7, Some(voted)).unwrap();
        assert_eq!(read_term_vote(dir.path()).unwrap(), (7, Some(voted)));

        // Vote cleared on term advance: the file shrinks to just the term.
        write_term_vote(dir.path(), 8, None).unwrap();
        assert_eq!(read_term_vote(dir.path()).unwrap(), (8, None));
    }

    #[test]
    fn test_term_vote_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_term_vote(dir.path()).unwrap(), (0, None));
    }

    #[test]
    fn test_bootstrap_group_raises_cluster_size() {
        let dir = tempfile::tempdir().unwrap();
        let peers = vec![NodeId::from_hash("AAAAAAAA")];
        bootstrap_group(dir.path(), &peers, 0).unwrap();

        let ps = read_peer_state(dir.path()).unwrap();
        assert_eq!(ps.cluster_size, 2);
        assert_eq!(ps.peers, peers);
    }
}
