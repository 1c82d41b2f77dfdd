//! Per-group Raft consensus engine for embedded replicated logs.
//!
//! A host process (typically a message broker) runs many independent
//! consensus groups, each backing one replicated object. Each group is a
//! [`RaftNode`] with its own WAL and durable state directory; all groups
//! share one subject-addressed [`transport::Transport`]. Committed entries
//! reach the upper-layer state machine in order over a bounded apply
//! channel.

pub mod config;
pub mod error;
pub mod id;
pub mod node;
pub mod peers;
pub mod registry;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod wire;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use id::NodeId;
pub use node::{ApplyEvent, CommittedEntry, LogPosition, RaftNode};
pub use peers::{PeerInfo, PeerStatus};
pub use registry::RaftRegistry;
pub use state::RaftRole;
pub use storage::{bootstrap_group, MemoryWal, Wal, WalError, WalState};
pub use transport::{BusEndpoint, Delivery, MemoryBus, Transport};
pub use wire::{Entry, EntryType, PeerState};
