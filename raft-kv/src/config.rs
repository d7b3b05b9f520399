//! Static configuration for a store node.

use std::path::PathBuf;
use std::time::Duration;

use crate::NodeId;
use crate::error::{Result, StoreError};

/// Raft logical clock settings.
///
/// The worker ticks raft every `tick_interval`; election and heartbeat
/// timeouts are counted in ticks.
#[derive(Debug, Clone)]
pub struct RaftTiming {
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
        }
    }
}

/// When to snapshot the state machine and truncate the log.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Applied entries since the last snapshot that trigger a new one.
    pub threshold: u64,
    /// Log file size that triggers a snapshot regardless of entry count.
    pub max_log_bytes: u64,
    /// Number of snapshot files kept on disk.
    pub retain: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            threshold: 8192,
            max_log_bytes: 64 * 1024 * 1024,
            retain: 2,
        }
    }
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, applied: u64, last_snapshot: u64, log_bytes: u64) -> bool {
        if applied <= last_snapshot {
            return false;
        }
        applied - last_snapshot >= self.threshold || log_bytes >= self.max_log_bytes
    }
}

/// Identity, storage and timeouts for one store node.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub node_id: NodeId,
    /// Address clients use to reach this node's HTTP API.
    pub http_addr: String,
    /// Address peers use for raft traffic; the listener binds here.
    pub raft_addr: String,
    /// Durable storage root. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Start a new single-voter cluster when no prior state exists.
    pub bootstrap: bool,
    pub raft: RaftTiming,
    pub snapshot: SnapshotPolicy,
    /// Upper bound on waiting for a proposal to commit and apply.
    pub apply_timeout: Duration,
    /// Upper bound on leadership verification for consistent reads.
    pub read_timeout: Duration,
}

impl StoreConfig {
    pub fn new(node_id: NodeId, http_addr: impl Into<String>, raft_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
            data_dir: None,
            bootstrap: false,
            raft: RaftTiming::default(),
            snapshot: SnapshotPolicy::default(),
            apply_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(StoreError::Configuration("node id must be non-zero".into()));
        }
        if self.http_addr.trim().is_empty() {
            return Err(StoreError::Configuration("http address is empty".into()));
        }
        if self.raft_addr.trim().is_empty() {
            return Err(StoreError::Configuration("raft address is empty".into()));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.election_tick <= self.raft.heartbeat_tick {
            return Err(StoreError::Configuration(format!(
                "election_tick ({}) must exceed heartbeat_tick ({}) and both must be positive",
                self.raft.election_tick, self.raft.heartbeat_tick
            )));
        }
        if self.snapshot.threshold == 0 {
            return Err(StoreError::Configuration(
                "snapshot threshold must be positive".into(),
            ));
        }
        if self.snapshot.retain == 0 {
            return Err(StoreError::Configuration(
                "at least one snapshot must be retained".into(),
            ));
        }
        Ok(())
    }
}
