//! The replicated state machine.
//!
//! Holds the key-value map and the node metadata map. Both are mutated only by
//! [`Fsm::apply`], which the raft worker calls once per committed entry in log
//! order. Everything else gets copies.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::NodeId;
use crate::command::LogCommand;

/// Externally reachable address of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub http_addr: String,
}

/// Point-in-time copy of both maps.
///
/// `BTreeMap` keeps the serialized form stable, so two replicas at the same
/// applied index produce identical snapshot bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub data: BTreeMap<String, String>,
    pub meta: BTreeMap<NodeId, NodeMeta>,
}

#[derive(Default)]
struct FsmState {
    data: BTreeMap<String, String>,
    meta: BTreeMap<NodeId, NodeMeta>,
}

/// Key-value state machine shared between the raft worker and readers.
///
/// A single `RwLock` guards both maps. Readers never wait on replication, only
/// on an in-progress apply or snapshot copy.
#[derive(Default)]
pub struct Fsm {
    state: RwLock<FsmState>,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed command and returns the value it replaced, if any.
    pub fn apply(&self, command: LogCommand) -> Option<String> {
        let mut state = self.state.write();
        match command {
            LogCommand::Set { key, value } => state.data.insert(key, value),
            LogCommand::Delete { key } => state.data.remove(&key),
            LogCommand::SetMeta { node_id, http_addr } => state
                .meta
                .insert(node_id, NodeMeta { http_addr })
                .map(|previous| previous.http_addr),
        }
    }

    /// Local read. Consistency is the caller's concern.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.read().data.get(key).cloned()
    }

    pub fn meta(&self, node_id: NodeId) -> Option<NodeMeta> {
        self.state.read().meta.get(&node_id).cloned()
    }

    /// Returns a copy of the whole key-value map.
    pub fn data(&self) -> BTreeMap<String, String> {
        self.state.read().data.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies both maps under the read lock; the lock is released before return.
    pub fn snapshot(&self) -> FsmSnapshot {
        let state = self.state.read();
        FsmSnapshot {
            data: state.data.clone(),
            meta: state.meta.clone(),
        }
    }

    /// Replaces both maps wholesale.
    pub fn restore(&self, snapshot: FsmSnapshot) {
        let mut state = self.state.write();
        state.data = snapshot.data;
        state.meta = snapshot.meta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> LogCommand {
        LogCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    fn delete(key: &str) -> LogCommand {
        LogCommand::Delete { key: key.into() }
    }

    #[test]
    fn apply_set_and_delete() {
        let fsm = Fsm::new();
        assert_eq!(fsm.apply(set("x", "1")), None);
        assert_eq!(fsm.apply(set("x", "2")), Some("1".into()));
        assert_eq!(fsm.get("x"), Some("2".into()));

        assert_eq!(fsm.apply(delete("x")), Some("2".into()));
        assert_eq!(fsm.get("x"), None);
    }

    #[test]
    fn delete_of_missing_key_is_a_noop() {
        let fsm = Fsm::new();
        fsm.apply(set("a", "1"));
        assert_eq!(fsm.apply(delete("never-set")), None);
        assert_eq!(fsm.data().len(), 1);
    }

    #[test]
    fn set_meta_is_last_writer_wins() {
        let fsm = Fsm::new();
        fsm.apply(LogCommand::SetMeta {
            node_id: 1,
            http_addr: "10.0.0.1:8080".into(),
        });
        fsm.apply(LogCommand::SetMeta {
            node_id: 1,
            http_addr: "10.0.0.9:8080".into(),
        });
        assert_eq!(
            fsm.meta(1),
            Some(NodeMeta {
                http_addr: "10.0.0.9:8080".into()
            })
        );
        assert_eq!(fsm.meta(2), None);
        // metadata never leaks into the key-value map
        assert!(fsm.is_empty());
    }

    #[test]
    fn replicas_converge_on_the_same_sequence() {
        let commands = vec![
            set("a", "1"),
            set("b", "2"),
            delete("a"),
            set("c", "3"),
            set("b", "20"),
            delete("zzz"),
        ];
        let left = Fsm::new();
        let right = Fsm::new();
        for cmd in &commands {
            left.apply(cmd.clone());
        }
        for cmd in commands {
            right.apply(cmd);
        }
        assert_eq!(left.snapshot(), right.snapshot());
        assert_eq!(left.get("b"), Some("20".into()));
    }

    #[test]
    fn restore_of_fresh_snapshot_changes_nothing() {
        let fsm = Fsm::new();
        fsm.apply(set("k", "v"));
        fsm.apply(LogCommand::SetMeta {
            node_id: 3,
            http_addr: "h:1".into(),
        });
        let before = fsm.snapshot();
        fsm.restore(fsm.snapshot());
        assert_eq!(fsm.snapshot(), before);
    }

    #[test]
    fn restore_replaces_existing_state() {
        let fsm = Fsm::new();
        fsm.apply(set("old", "1"));
        let mut incoming = FsmSnapshot::default();
        incoming.data.insert("new".into(), "2".into());
        fsm.restore(incoming);
        assert_eq!(fsm.get("old"), None);
        assert_eq!(fsm.get("new"), Some("2".into()));
    }
}
