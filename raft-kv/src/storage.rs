//! Raft storage backed by `MemStorage` plus the live state machine.
//!
//! Log entries and hard state live in `MemStorage` (mirrored to the WAL by
//! [`crate::node::RaftNode`]). Snapshots are not stored here at all: when raft
//! asks for one to ship to a follower, [`NodeStorage`] builds it from the FSM at
//! the applied index, with the current voter set and address map. A follower
//! that was just added therefore always receives a snapshot naming itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use tracing::debug;

use crate::NodeId;
use crate::fsm::Fsm;
use crate::snapshot::SnapshotPayload;

#[derive(Default)]
struct Applied {
    index: u64,
    term: u64,
    /// Raft address of every voter.
    peers: BTreeMap<NodeId, String>,
}

#[derive(Clone)]
pub struct NodeStorage {
    mem: MemStorage,
    fsm: Arc<Fsm>,
    applied: Arc<RwLock<Applied>>,
}

impl NodeStorage {
    pub fn new(fsm: Arc<Fsm>) -> Self {
        Self {
            mem: MemStorage::new(),
            fsm,
            applied: Arc::new(RwLock::new(Applied::default())),
        }
    }

    /// Index and term of the last entry applied to the FSM.
    pub fn applied(&self) -> (u64, u64) {
        let applied = self.applied.read();
        (applied.index, applied.term)
    }

    pub fn set_applied(&self, index: u64, term: u64) {
        let mut applied = self.applied.write();
        applied.index = index;
        applied.term = term;
    }

    pub fn peers(&self) -> BTreeMap<NodeId, String> {
        self.applied.read().peers.clone()
    }

    pub fn peer_addr(&self, id: NodeId) -> Option<String> {
        self.applied.read().peers.get(&id).cloned()
    }

    pub fn insert_peer(&self, id: NodeId, addr: String) {
        self.applied.write().peers.insert(id, addr);
    }

    pub fn remove_peer(&self, id: NodeId) {
        self.applied.write().peers.remove(&id);
    }

    pub fn replace_peers(&self, peers: BTreeMap<NodeId, String>) {
        self.applied.write().peers = peers;
    }

    pub fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.mem
            .initial_state()
            .map(|state| state.conf_state)
            .unwrap_or_default()
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.mem.wl().set_hardstate(hs);
    }

    pub fn set_commit(&self, commit: u64) {
        self.mem.wl().mut_hard_state().set_commit(commit);
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.mem.wl().set_conf_state(cs);
    }

    pub fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        self.mem.wl().append(entries)
    }

    /// Installs a snapshot's metadata; log entries it covers are discarded.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.mem.wl().apply_snapshot(snapshot)
    }

    /// Drops entries before `index`. The entry at `index` stays as the term
    /// anchor for the next append.
    pub fn compact(&self, index: u64) -> raft::Result<()> {
        self.mem.wl().compact(index)
    }

    /// Every entry still held in memory, oldest first.
    pub fn log_entries(&self) -> raft::Result<Vec<Entry>> {
        let first = self.mem.first_index()?;
        let last = self.mem.last_index()?;
        if last < first {
            return Ok(Vec::new());
        }
        self.mem
            .entries(first, last + 1, None, GetEntriesContext::empty(false))
    }

    /// Captures FSM state, voters and addresses at the applied index.
    ///
    /// Only the raft worker mutates the FSM and the applied index, and it is
    /// also the only caller, so the three reads describe the same point.
    pub fn build_snapshot(&self) -> Result<Snapshot> {
        let (index, term, peers) = {
            let applied = self.applied.read();
            (applied.index, applied.term, applied.peers.clone())
        };
        let payload = SnapshotPayload::new(self.fsm.snapshot(), peers);
        let mut snapshot = Snapshot::default();
        snapshot.data = payload
            .encode()
            .context("failed to encode snapshot payload")?
            .into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = self.conf_state();
        Ok(snapshot)
    }
}

impl Storage for NodeStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let (applied, _) = self.applied();
        if applied == 0 || applied < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        let snapshot = self
            .build_snapshot()
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        debug!(to, index = applied, "generated snapshot for follower");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LogCommand;

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    #[test]
    fn snapshot_unavailable_until_applied() {
        let storage = NodeStorage::new(Arc::new(Fsm::new()));
        assert!(matches!(
            storage.snapshot(0, 2),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
        storage.set_applied(4, 1);
        assert!(storage.snapshot(5, 2).is_err());
        assert!(storage.snapshot(4, 2).is_ok());
    }

    #[test]
    fn snapshot_reflects_fsm_and_membership() -> Result<()> {
        let fsm = Arc::new(Fsm::new());
        let storage = NodeStorage::new(Arc::clone(&fsm));
        fsm.apply(LogCommand::Set {
            key: "k".into(),
            value: "v".into(),
        });
        storage.set_conf_state(ConfState::from((vec![1, 2], vec![])));
        storage.insert_peer(1, "127.0.0.1:9001".into());
        storage.insert_peer(2, "127.0.0.1:9002".into());
        storage.set_applied(7, 3);

        let snapshot = storage.snapshot(7, 2)?;
        assert_eq!(snapshot.get_metadata().index, 7);
        assert_eq!(snapshot.get_metadata().term, 3);
        assert_eq!(snapshot.get_metadata().get_conf_state().voters, vec![1, 2]);
        let payload = SnapshotPayload::decode(&snapshot.data)?;
        assert_eq!(payload.state.data.get("k").map(String::as_str), Some("v"));
        assert_eq!(payload.peers.len(), 2);
        Ok(())
    }

    #[test]
    fn compaction_keeps_anchor_entry() -> Result<()> {
        let storage = NodeStorage::new(Arc::new(Fsm::new()));
        let entries: Vec<Entry> = (1..=6).map(|i| entry(i, 1)).collect();
        storage.append(&entries)?;
        storage.compact(4)?;
        assert_eq!(Storage::first_index(&storage)?, 4);
        assert_eq!(Storage::term(&storage, 4)?, 1);
        let kept: Vec<u64> = storage.log_entries()?.iter().map(|e| e.index).collect();
        assert_eq!(kept, vec![4, 5, 6]);
        Ok(())
    }
}
