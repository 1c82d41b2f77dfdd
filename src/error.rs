use thiserror::Error;

use crate::storage::WalError;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not leader")]
    NotLeader,

    #[error("already leader")]
    AlreadyLeader,

    #[error("proposal failed")]
    ProposalFailed,

    #[error("proposals paused")]
    ProposalsPaused,

    #[error("not current")]
    NotCurrent,

    #[error("unknown peer")]
    UnknownPeer,

    #[error("corrupt peer state")]
    CorruptPeerState,

    #[error("stepdown failed")]
    StepdownFailed,

    #[error("all peers are not current")]
    PeersNotCurrent,

    #[error("could not load entry from WAL")]
    EntryLoadFailed,

    #[error("could not place apply entry")]
    FailedToApply,

    #[error("no config given")]
    NoConfig,

    #[error("cluster too small")]
    ClusterTooSmall,

    #[error("remove peer is not supported")]
    RemovePeerUnsupported,

    #[error("node is closed")]
    Closed,

    #[error("wal: {0}")]
    Wal(#[from] WalError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
