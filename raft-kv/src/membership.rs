//! Join handling on the leader.
//!
//! A join is one or two configuration changes followed by a metadata write:
//! a voter re-joining from a new raft address is removed first, then added
//! back, and finally its HTTP address is recorded with `SetMeta` so other
//! nodes can redirect clients to it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::NodeId;
use crate::command::LogCommand;
use crate::error::{Result, StoreError};
use crate::node::MembershipChange;
use crate::runtime::NodeHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub http_addr: String,
    pub raft_addr: String,
}

impl JoinRequest {
    pub fn new(node_id: NodeId, http_addr: impl Into<String>, raft_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
        }
    }

    /// Rejects requests that could never be proposed.
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
        Ok(())
    }
}

/// What a join has to do given the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JoinPlan {
    AlreadyMember,
    Add,
    Readdress { old_addr: String },
}

fn plan(handle: &NodeHandle, request: &JoinRequest) -> Result<JoinPlan> {
    let status = handle.status();
    status.check_running()?;
    if !status.is_leader() {
        return Err(StoreError::NotLeader);
    }
    let is_voter = status.voters.contains(&request.node_id);
    match status.peers.get(&request.node_id) {
        Some(addr) if is_voter && *addr == request.raft_addr => Ok(JoinPlan::AlreadyMember),
        Some(addr) if is_voter => {
            if request.node_id == handle.id() {
                return Err(StoreError::Configuration(
                    "the leader cannot change its own raft address".into(),
                ));
            }
            Ok(JoinPlan::Readdress {
                old_addr: addr.clone(),
            })
        }
        _ => Ok(JoinPlan::Add),
    }
}

/// Adds `request.node_id` as a voter and records its HTTP address.
///
/// Returns once the configuration change and the metadata write are applied
/// on this node; the new voter may still be catching up.
pub fn join(handle: &NodeHandle, request: &JoinRequest, timeout: Duration) -> Result<()> {
    request.validate()?;
    match plan(handle, request)? {
        JoinPlan::AlreadyMember => {
            info!(
                node_id = request.node_id,
                raft_addr = %request.raft_addr,
                "join ignored, already a voter at this address"
            );
        }
        JoinPlan::Add => add_voter(handle, request, timeout)?,
        JoinPlan::Readdress { old_addr } => {
            info!(
                node_id = request.node_id,
                old_addr = %old_addr,
                new_addr = %request.raft_addr,
                "voter rejoining from a new address"
            );
            remove(handle, request.node_id, timeout)?;
            add_voter(handle, request, timeout)?;
        }
    }

    handle.propose(
        LogCommand::SetMeta {
            node_id: request.node_id,
            http_addr: request.http_addr.clone(),
        },
        timeout,
    )?;
    info!(
        node_id = request.node_id,
        http_addr = %request.http_addr,
        raft_addr = %request.raft_addr,
        "node joined"
    );
    Ok(())
}

/// Removes a voter. Removing a node that is not a voter is a no-op.
pub fn remove(handle: &NodeHandle, node_id: NodeId, timeout: Duration) -> Result<()> {
    let status = handle.status();
    status.check_running()?;
    if !status.is_leader() {
        return Err(StoreError::NotLeader);
    }
    if !status.voters.contains(&node_id) {
        return Ok(());
    }
    if status.voters.len() == 1 {
        return Err(StoreError::Configuration(
            "cannot remove the last voter".into(),
        ));
    }
    handle.change_membership(MembershipChange::RemoveVoter { id: node_id }, timeout)?;
    info!(node_id, "voter removed");
    Ok(())
}

fn add_voter(handle: &NodeHandle, request: &JoinRequest, timeout: Duration) -> Result<()> {
    handle.change_membership(
        MembershipChange::AddVoter {
            id: request.node_id,
            raft_addr: request.raft_addr.clone(),
        },
        timeout,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_missing_fields() {
        assert!(JoinRequest::new(2, "127.0.0.1:8002", "127.0.0.1:9002").validate().is_ok());
        for request in [
            JoinRequest::new(0, "127.0.0.1:8002", "127.0.0.1:9002"),
            JoinRequest::new(2, "", "127.0.0.1:9002"),
            JoinRequest::new(2, "127.0.0.1:8002", "  "),
        ] {
            assert!(
                matches!(request.validate(), Err(StoreError::Configuration(_))),
                "{request:?}"
            );
        }
    }
}
