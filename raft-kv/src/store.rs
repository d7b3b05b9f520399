//! The store facade.
//!
//! [`Store`] is the operation surface the HTTP layer depends on. [`RaftStore`]
//! implements it on top of a raft worker: writes become log proposals, reads
//! go to the local state machine, optionally after confirming leadership.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::NodeId;
use crate::command::LogCommand;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::fsm::Fsm;
use crate::membership::{self, JoinRequest};
use crate::runtime::{NodeHandle, spawn_node};
use crate::status::{LeadershipEvent, RaftStatus, Role};

/// Per-read recency guarantee.
///
/// `Default` currently reads exactly like `Stale`; it exists so the default
/// can be tightened later without changing callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    #[default]
    Default,
    Stale,
    Consistent,
}

impl ConsistencyLevel {
    /// Unknown or missing values fall back to `Default`.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for ConsistencyLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ConsistencyLevel::Default),
            "stale" => Ok(ConsistencyLevel::Stale),
            "consistent" => Ok(ConsistencyLevel::Consistent),
            other => Err(StoreError::Configuration(format!(
                "unknown consistency level {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoterStats {
    pub id: NodeId,
    pub raft_addr: String,
}

/// Operational counters of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub node_id: NodeId,
    pub http_addr: String,
    pub raft_addr: String,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub leader_api_addr: Option<String>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub last_snapshot_index: u64,
    pub cluster_size: usize,
    pub voters: Vec<VoterStats>,
    pub keys: usize,
    pub failure: Option<String>,
}

/// Operations the HTTP layer needs from a store.
///
/// Writes and `Consistent` reads fail with [`StoreError::NotLeader`] on a
/// follower; redirecting is the caller's job.
pub trait Store: Send + Sync + 'static {
    fn get(&self, key: &str, level: ConsistencyLevel) -> Result<Option<String>>;

    /// Blocks until the write is applied on this node.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    fn set_meta(&self, node_id: NodeId, http_addr: &str) -> Result<()>;

    fn join(&self, request: &JoinRequest) -> Result<()>;

    /// HTTP address of the current leader, once its metadata has replicated.
    fn leader_api_addr(&self) -> Option<String>;

    fn stats(&self) -> StoreStats;

    /// Copy of the whole key-value map.
    fn data(&self) -> BTreeMap<String, String>;
}

/// Store backed by a raft worker and its state machine.
pub struct RaftStore {
    config: StoreConfig,
    handle: Arc<NodeHandle>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl RaftStore {
    /// Validates `config`, opens durable state and starts the raft worker.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let fsm = Arc::new(Fsm::new());
        let (handle, events) = spawn_node(&config, fsm)
            .map_err(|err| StoreError::Storage(format!("{err:#}")))?;
        let handle = Arc::new(handle);

        let observer = {
            let handle = Arc::clone(&handle);
            let http_addr = config.http_addr.clone();
            let timeout = config.apply_timeout;
            thread::Builder::new()
                .name(format!("leadership-observer-{}", config.node_id))
                .spawn(move || observe_leadership(&handle, events, &http_addr, timeout))
                .map_err(|err| StoreError::Storage(format!("failed to spawn observer: {err}")))?
        };
        info!(
            node_id = config.node_id,
            http_addr = %config.http_addr,
            raft_addr = %config.raft_addr,
            "store opened"
        );
        Ok(Self {
            config,
            handle,
            observer: Mutex::new(Some(observer)),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn status(&self) -> RaftStatus {
        self.handle.status()
    }

    pub fn is_leader(&self) -> bool {
        self.status().is_leader()
    }

    /// Blocks until some node is known to lead; returns its id.
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let status = self
            .handle
            .status_board()
            .wait_for(timeout, "leader", |s| s.leader_id.is_some())?;
        Ok(status.leader_id.unwrap_or_default())
    }

    /// Blocks until this node has applied everything committed as of the call.
    pub fn wait_for_applied(&self, timeout: Duration) -> Result<u64> {
        let board = self.handle.status_board();
        let target = board.current().commit_index;
        let status = board.wait_for(timeout, "applied index", |s| s.applied_index >= target)?;
        Ok(status.applied_index)
    }

    /// Removes a voter from the cluster.
    pub fn remove(&self, node_id: NodeId) -> Result<()> {
        membership::remove(&self.handle, node_id, self.config.apply_timeout)
    }

    /// Stops the raft worker and the leadership observer.
    pub fn shutdown(&self) {
        self.handle.shutdown();
        if let Some(observer) = self.observer.lock().take() {
            if observer.join().is_err() {
                warn!(node_id = self.config.node_id, "leadership observer panicked");
            }
        }
    }

    fn propose(&self, command: LogCommand) -> Result<Option<String>> {
        self.handle.propose(command, self.config.apply_timeout)
    }
}

impl Drop for RaftStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Store for RaftStore {
    fn get(&self, key: &str, level: ConsistencyLevel) -> Result<Option<String>> {
        match level {
            ConsistencyLevel::Default | ConsistencyLevel::Stale => {
                self.status().check_running()?;
            }
            ConsistencyLevel::Consistent => {
                self.handle.read_index(self.config.read_timeout)?;
            }
        }
        Ok(self.handle.fsm().get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.propose(LogCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.propose(LogCommand::Delete {
            key: key.to_string(),
        })?;
        Ok(())
    }

    fn set_meta(&self, node_id: NodeId, http_addr: &str) -> Result<()> {
        self.propose(LogCommand::SetMeta {
            node_id,
            http_addr: http_addr.to_string(),
        })?;
        Ok(())
    }

    fn join(&self, request: &JoinRequest) -> Result<()> {
        membership::join(&self.handle, request, self.config.apply_timeout)
    }

    fn leader_api_addr(&self) -> Option<String> {
        let leader = self.status().leader_id?;
        self.handle.fsm().meta(leader).map(|meta| meta.http_addr)
    }

    fn stats(&self) -> StoreStats {
        let status = self.status();
        let leader_api_addr = status
            .leader_id
            .and_then(|id| self.handle.fsm().meta(id))
            .map(|meta| meta.http_addr);
        let voters = status
            .voters
            .iter()
            .map(|id| VoterStats {
                id: *id,
                raft_addr: status.peers.get(id).cloned().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        StoreStats {
            node_id: self.config.node_id,
            http_addr: self.config.http_addr.clone(),
            raft_addr: self.config.raft_addr.clone(),
            role: status.role,
            term: status.term,
            leader_id: status.leader_id,
            leader_api_addr,
            commit_index: status.commit_index,
            applied_index: status.applied_index,
            first_index: status.first_index,
            last_index: status.last_index,
            last_snapshot_index: status.last_snapshot_index,
            cluster_size: voters.len(),
            voters,
            keys: self.handle.fsm().len(),
            failure: status.failure,
        }
    }

    fn data(&self) -> BTreeMap<String, String> {
        self.handle.fsm().data()
    }
}

/// Publishes this node's HTTP address whenever it becomes leader without a
/// matching metadata entry.
///
/// Runs until the worker exits and closes `events`.
fn observe_leadership(
    handle: &NodeHandle,
    events: Receiver<LeadershipEvent>,
    http_addr: &str,
    timeout: Duration,
) {
    let node_id = handle.id();
    for event in events.iter() {
        let LeadershipEvent::BecameLeader { term } = event else {
            continue;
        };
        let current = handle.fsm().meta(node_id).map(|meta| meta.http_addr);
        if current.as_deref() == Some(http_addr) {
            continue;
        }
        let command = LogCommand::SetMeta {
            node_id,
            http_addr: http_addr.to_string(),
        };
        match handle.propose(command, timeout) {
            Ok(_) => info!(node_id, term, http_addr, "published leader metadata"),
            Err(StoreError::NotLeader) => {
                debug!(node_id, term, "lost leadership before metadata applied")
            }
            Err(err) => warn!(node_id, term, error = %err, "failed to publish leader metadata"),
        }
    }
}
