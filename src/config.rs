use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Configuration for one consensus group.
///
/// The timing defaults are the production values; tests shorten them to keep
/// elections fast.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Cluster name, part of the group's transport subjects.
    pub cluster: String,
    /// Group name, unique within the cluster.
    pub group: String,
    /// Directory holding the group's peer-state and term/vote files.
    pub store_dir: PathBuf,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub campaign_timeout_min: Duration,
    pub campaign_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub lost_quorum_interval: Duration,
    /// Capacity of the proposal queue.
    pub proposal_queue: usize,
    /// Capacity of the apply channel (grown to cover replay on start).
    pub apply_queue: usize,
}

impl RaftConfig {
    pub fn new(
        cluster: impl Into<String>,
        group: impl Into<String>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        let heartbeat_interval = Duration::from_millis(200);
        RaftConfig {
            cluster: cluster.into(),
            group: group.into(),
            store_dir: store_dir.into(),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(900),
            campaign_timeout_min: Duration::from_millis(50),
            campaign_timeout_max: Duration::from_millis(200),
            heartbeat_interval,
            lost_quorum_interval: 3 * heartbeat_interval,
            proposal_queue: 256,
            apply_queue: 512,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() || self.group.is_empty() || self.store_dir.as_os_str().is_empty()
        {
            return Err(RaftError::NoConfig);
        }
        Ok(())
    }
}
