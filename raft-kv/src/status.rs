//! Raft state published by the worker for everyone else to read.
//!
//! The worker owns the raft node outright; facade calls never touch it. After
//! each event-loop iteration the worker publishes a [`RaftStatus`] here, and
//! blocked callers waiting for a leader or for an applied index are woken
//! through the condition variable.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use raft::StateRole;
use serde::Serialize;

use crate::NodeId;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => Role::Follower,
            StateRole::PreCandidate => Role::PreCandidate,
            StateRole::Candidate => Role::Candidate,
            StateRole::Leader => Role::Leader,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftStatus {
    pub role: Role,
    pub term: u64,
    /// `None` while no leader is known.
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub last_snapshot_index: u64,
    pub voters: Vec<NodeId>,
    /// Raft address of every voter.
    pub peers: BTreeMap<NodeId, String>,
    /// Set once the worker hit a storage failure and stopped.
    pub failure: Option<String>,
    /// Set once the worker exited for any reason.
    pub stopped: bool,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// The error a facade call should return if the worker is gone.
    pub fn check_running(&self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(StoreError::Storage(failure.clone()));
        }
        if self.stopped {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Leadership transitions of the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    BecameLeader { term: u64 },
    SteppedDown { term: u64 },
}

#[derive(Default)]
pub struct StatusBoard {
    status: Mutex<RaftStatus>,
    changed: Condvar,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RaftStatus {
        self.status.lock().clone()
    }

    /// Replaces the published status, waking waiters if anything changed.
    ///
    /// Failure and stop markers are sticky.
    pub fn publish(&self, mut status: RaftStatus) {
        let mut current = self.status.lock();
        if status.failure.is_none() {
            status.failure = current.failure.take();
        }
        status.stopped |= current.stopped;
        if *current != status {
            *current = status;
            self.changed.notify_all();
        }
    }

    pub fn record_failure(&self, failure: String) {
        let mut current = self.status.lock();
        current.failure = Some(failure);
        current.stopped = true;
        current.role = Role::Follower;
        current.leader_id = None;
        self.changed.notify_all();
    }

    pub fn mark_stopped(&self) {
        let mut current = self.status.lock();
        current.stopped = true;
        current.role = Role::Follower;
        current.leader_id = None;
        self.changed.notify_all();
    }

    /// Blocks until `ready` holds for the published status or `timeout`
    /// elapses. `what` names the condition in the timeout error.
    pub fn wait_for<F>(&self, timeout: Duration, what: &'static str, ready: F) -> Result<RaftStatus>
    where
        F: Fn(&RaftStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        loop {
            if ready(&status) {
                return Ok(status.clone());
            }
            status.check_running()?;
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return if ready(&status) {
                    Ok(status.clone())
                } else {
                    status.check_running()?;
                    Err(StoreError::Timeout(what))
                };
            }
        }
    }
}
