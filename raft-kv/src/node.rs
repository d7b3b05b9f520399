//! Core Raft node.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` together with the state machine,
//! the write-ahead log and the snapshot directory. It is driven by a single
//! owner (the runtime worker, or the in-memory test cluster below): tick it,
//! step it with peer messages, and call [`RaftNode::poll_ready`] until it has
//! nothing left to do.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::{ReadState, SnapshotStatus, StateRole, Storage};
use slog::{Logger, o};
use tracing::{debug, info};

use crate::NodeId;
use crate::command::LogCommand;
use crate::config::{RaftTiming, SnapshotPolicy, StoreConfig};
use crate::error::StoreError;
use crate::fsm::Fsm;
use crate::snapshot::{SnapshotPayload, SnapshotStore};
use crate::storage::NodeStorage;
use crate::wal::{MembershipRecord, Wal, WalReplay};

pub const LOG_FILE: &str = "raft.log";
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a slog logger; everything we want to see is
/// logged through `tracing` at the application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// How to construct a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: NodeId,
    /// Voters (and their raft addresses) of a brand-new cluster. Ignored when
    /// the data directory already holds state. Empty for a node that will be
    /// added to an existing cluster.
    pub initial_voters: BTreeMap<NodeId, String>,
    pub data_dir: Option<PathBuf>,
    pub timing: RaftTiming,
    pub snapshot: SnapshotPolicy,
}

impl NodeOptions {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            initial_voters: BTreeMap::new(),
            data_dir: None,
            timing: RaftTiming::default(),
            snapshot: SnapshotPolicy::default(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let mut initial_voters = BTreeMap::new();
        if config.bootstrap {
            initial_voters.insert(config.node_id, config.raft_addr.clone());
        }
        Self {
            id: config.node_id,
            initial_voters,
            data_dir: config.data_dir.clone(),
            timing: config.raft.clone(),
            snapshot: config.snapshot.clone(),
        }
    }
}

/// A change to the voter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddVoter { id: NodeId, raft_addr: String },
    RemoveVoter { id: NodeId },
}

impl MembershipChange {
    fn to_conf_change(&self) -> ConfChange {
        let mut cc = ConfChange::default();
        match self {
            MembershipChange::AddVoter { id, raft_addr } => {
                cc.node_id = *id;
                cc.set_change_type(ConfChangeType::AddNode);
                cc.context = raft_addr.clone().into_bytes().into();
            }
            MembershipChange::RemoveVoter { id } => {
                cc.node_id = *id;
                cc.set_change_type(ConfChangeType::RemoveNode);
            }
        }
        cc
    }
}

/// Position a proposal was appended at.
///
/// The proposal succeeded if the entry eventually applied at `index` carries
/// the same `term`; a different term means a new leader overwrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// What applying one committed entry did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Command {
        command: LogCommand,
        /// Value the command replaced, if any.
        previous: Option<String>,
    },
    Membership(MembershipChange),
    /// Leader no-op, or a configuration change raft discarded because another
    /// one was still pending.
    Empty,
}

/// Records one committed entry after it was applied locally.
///
/// The runtime matches these against pending proposals by index and term.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub outcome: ApplyOutcome,
}

/// Output from processing a Raft ready state.
///
/// Bundles both phases of Raft processing (Ready + LightReady) into a single
/// value so the caller's event loop only has one thing to handle.
#[derive(Debug, Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    pub read_states: Vec<ReadState>,
    /// Index of a snapshot received from the leader and installed.
    pub restored: Option<u64>,
}

struct Disk {
    wal: Wal,
    snapshots: SnapshotStore,
}

/// A Raft consensus node with integrated state machine and durable storage.
///
/// - **storage**: raft's view of the log, with on-demand snapshots
/// - **fsm**: the replicated key-value and metadata maps
/// - **disk**: WAL and snapshot files, absent for in-memory nodes
pub struct RaftNode {
    id: NodeId,
    raw: RawNode<NodeStorage>,
    storage: NodeStorage,
    fsm: Arc<Fsm>,
    disk: Option<Disk>,
    policy: SnapshotPolicy,
    last_snapshot_index: u64,
    /// Read contexts held until the leader commits an entry in its term.
    deferred_reads: Vec<Vec<u8>>,
}

impl RaftNode {
    /// Opens a node, restoring durable state or bootstrapping a new cluster.
    ///
    /// # Start-up order
    ///
    /// 1. Load the newest snapshot into the FSM and raft storage
    /// 2. Replay the WAL: membership, log entries past the snapshot, hard state
    /// 3. With nothing on disk and `initial_voters` given, install a bootstrap
    ///    snapshot at index 1 naming those voters
    ///
    /// Committed entries past the snapshot are re-applied to the FSM by raft
    /// through the normal ready loop. A node that is the sole voter campaigns
    /// immediately instead of waiting for an election timeout.
    pub fn open(options: NodeOptions, fsm: Arc<Fsm>) -> Result<Self> {
        let id = options.id;
        if id == 0 {
            bail!("node id must be non-zero");
        }
        let storage = NodeStorage::new(Arc::clone(&fsm));

        let (disk, replay) = match &options.data_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create data dir {}", dir.display()))?;
                let snapshots = SnapshotStore::open(dir.join(SNAPSHOT_DIR), options.snapshot.retain)?;
                let (wal, replay) = Wal::open(dir.join(LOG_FILE))?;
                (Some(Disk { wal, snapshots }), replay)
            }
            None => (None, WalReplay::default()),
        };

        let mut last_snapshot_index = 0;
        if let Some(disk) = &disk {
            if let Some(snapshot) = disk.snapshots.latest()? {
                last_snapshot_index = restore_snapshot(&storage, &fsm, snapshot)?;
                info!(node_id = id, index = last_snapshot_index, "restored snapshot");
            }
        }

        let fresh = last_snapshot_index == 0 && replay.is_empty();
        if !fresh {
            restore_log(&storage, replay, last_snapshot_index)?;
        } else if !options.initial_voters.is_empty() {
            let snapshot = bootstrap_snapshot(&options.initial_voters)?;
            if let Some(disk) = &disk {
                disk.snapshots.save(&snapshot)?;
            }
            last_snapshot_index = restore_snapshot(&storage, &fsm, snapshot)?;
            info!(
                node_id = id,
                voters = ?options.initial_voters.keys().collect::<Vec<_>>(),
                "bootstrapped new cluster"
            );
        }

        let (applied, _) = storage.applied();
        let cfg = Config {
            id,
            election_tick: options.timing.election_tick,
            heartbeat_tick: options.timing.heartbeat_tick,
            applied,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        cfg.validate().context("invalid raft config")?;
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;

        let mut node = Self {
            id,
            raw,
            storage,
            fsm,
            disk,
            policy: options.snapshot,
            last_snapshot_index,
            deferred_reads: Vec::new(),
        };
        if node.voters() == [id] {
            node.campaign()?;
        }
        info!(
            node_id = id,
            applied,
            last_index = node.last_index(),
            voters = ?node.voters(),
            "raft node opened"
        );
        Ok(node)
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> NodeId {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied_index(&self) -> u64 {
        self.storage.applied().0
    }

    pub fn first_index(&self) -> u64 {
        self.storage.first_index().unwrap_or_default()
    }

    pub fn last_index(&self) -> u64 {
        self.raw.raft.raft_log.last_index()
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index
    }

    pub fn voters(&self) -> Vec<NodeId> {
        let mut voters = self.storage.conf_state().voters;
        voters.sort_unstable();
        voters
    }

    /// Raft address of every voter, as of the last applied configuration.
    pub fn peers(&self) -> BTreeMap<NodeId, String> {
        self.storage.peers()
    }

    pub fn peer_addr(&self, id: NodeId) -> Option<String> {
        self.storage.peer_addr(id)
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    /// Appends a command to the leader's log.
    ///
    /// Success only means "appended"; the entry is committed once a majority
    /// stores it, and [`poll_ready`](Self::poll_ready) reports when it applies.
    pub fn propose(&mut self, command: &LogCommand) -> Result<Proposal, StoreError> {
        if !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        let data = command
            .encode()
            .map_err(|err| StoreError::Storage(format!("failed to encode command: {err:#}")))?;
        self.raw.propose(vec![], data).map_err(proposal_error)?;
        Ok(self.last_proposal())
    }

    /// Appends a single-voter configuration change.
    ///
    /// If another change is still uncommitted, raft replaces this one with an
    /// empty entry; the report for that index is then [`ApplyOutcome::Empty`].
    pub fn propose_membership(&mut self, change: &MembershipChange) -> Result<Proposal, StoreError> {
        if !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        self.raw
            .propose_conf_change(vec![], change.to_conf_change())
            .map_err(proposal_error)?;
        Ok(self.last_proposal())
    }

    fn last_proposal(&self) -> Proposal {
        Proposal {
            index: self.last_index(),
            term: self.term(),
        }
    }

    /// Starts leadership verification for a linearizable read.
    ///
    /// The matching [`ReadState`] (same `ctx`) appears in a later ready bundle
    /// once a quorum has confirmed this node is still leader. Raft ignores
    /// read requests until the leader has committed an entry in its own term,
    /// so a read issued right after an election is held here and handed to
    /// raft by [`poll_ready`](Self::poll_ready) once that entry commits.
    pub fn read_index(&mut self, ctx: Vec<u8>) -> Result<(), StoreError> {
        if !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        if self.committed_in_current_term() {
            self.raw.read_index(ctx);
        } else {
            self.deferred_reads.push(ctx);
        }
        Ok(())
    }

    /// Reads held back by [`read_index`](Self::read_index), not yet passed to raft.
    pub fn deferred_reads(&self) -> usize {
        self.deferred_reads.len()
    }

    fn committed_in_current_term(&self) -> bool {
        let log = &self.raw.raft.raft_log;
        log.term(log.committed)
            .map_or(false, |term| term == self.raw.raft.term)
    }

    /// Hands held reads to raft once the leader's no-op has committed. Held
    /// reads are dropped on step-down; their callers are failed by the runtime.
    fn flush_deferred_reads(&mut self) {
        if self.deferred_reads.is_empty() {
            return;
        }
        if !self.is_leader() {
            self.deferred_reads.clear();
            return;
        }
        if self.committed_in_current_term() {
            for ctx in std::mem::take(&mut self.deferred_reads) {
                self.raw.read_index(ctx);
            }
        }
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    pub fn report_unreachable(&mut self, id: NodeId) {
        self.raw.report_unreachable(id);
    }

    pub fn report_snapshot(&mut self, id: NodeId, delivered: bool) {
        let status = if delivered {
            SnapshotStatus::Finish
        } else {
            SnapshotStatus::Failure
        };
        self.raw.report_snapshot(id, status);
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// # Processing flow
    ///
    /// **Ready**: install a received snapshot, append new entries and hard
    /// state to memory and the WAL, fsync, then apply committed entries.
    /// Messages from `take_messages` may go out before the fsync; persisted
    /// messages only after it.
    ///
    /// **LightReady**: record the new commit index and apply whatever became
    /// committed, then consider compaction.
    ///
    /// Any error returned here means durable state may be inconsistent with
    /// memory; the caller must stop driving the node.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        self.flush_deferred_reads();
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();
        bundle.messages.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            bundle.restored = Some(self.install_snapshot(snapshot)?);
        }

        if !ready.entries().is_empty() {
            self.storage
                .append(ready.entries())
                .context("append entries failed")?;
            if let Some(disk) = self.disk.as_mut() {
                disk.wal.append_entries(ready.entries())?;
            }
        }

        if let Some(hs) = ready.hs() {
            self.storage.set_hard_state(hs.clone());
            if let Some(disk) = self.disk.as_mut() {
                disk.wal.append_hard_state(hs)?;
            }
        }
        self.sync_wal()?;

        bundle.messages.extend(ready.take_persisted_messages());
        bundle.read_states = ready.take_read_states();
        bundle.applied = self.apply_entries(ready.take_committed_entries())?;

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit);
            if let Some(disk) = self.disk.as_mut() {
                disk.wal.append_hard_state(&self.storage.hard_state())?;
            }
        }
        bundle.messages.extend(light_ready.take_messages());
        let applied = self.apply_entries(light_ready.take_committed_entries())?;
        bundle.applied.extend(applied);
        self.raw.advance_apply();
        self.sync_wal()?;

        self.maybe_compact()?;
        Ok(Some(bundle))
    }

    fn sync_wal(&mut self) -> Result<()> {
        match self.disk.as_mut() {
            Some(disk) => disk.wal.sync(),
            None => Ok(()),
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => ApplyOutcome::Empty,
                EntryType::EntryNormal => {
                    let command = LogCommand::decode(&entry.data)
                        .with_context(|| format!("failed to decode entry {}", entry.index))?;
                    let previous = self.fsm.apply(command.clone());
                    ApplyOutcome::Command { command, previous }
                }
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    bail!("unexpected joint configuration change at {}", entry.index)
                }
            };
            self.storage.set_applied(entry.index, entry.term);
            reports.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                outcome,
            });
        }
        Ok(reports)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<ApplyOutcome> {
        let cc = ConfChange::decode(&entry.data[..])
            .with_context(|| format!("failed to decode conf change {}", entry.index))?;
        let conf_state = self
            .raw
            .apply_conf_change(&cc)
            .context("failed to apply conf change")?;

        let change = match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                let raft_addr = String::from_utf8(cc.context.to_vec())
                    .context("conf change address is not utf-8")?;
                self.storage.insert_peer(cc.node_id, raft_addr.clone());
                MembershipChange::AddVoter {
                    id: cc.node_id,
                    raft_addr,
                }
            }
            ConfChangeType::RemoveNode => {
                self.storage.remove_peer(cc.node_id);
                MembershipChange::RemoveVoter { id: cc.node_id }
            }
        };
        self.storage.set_conf_state(conf_state);

        let record = self.membership_record(entry.index);
        if let Some(disk) = self.disk.as_mut() {
            disk.wal.append_membership(&record)?;
        }
        info!(
            node_id = self.id,
            index = entry.index,
            change = ?change,
            voters = ?record.voters,
            "applied membership change"
        );
        Ok(ApplyOutcome::Membership(change))
    }

    fn membership_record(&self, index: u64) -> MembershipRecord {
        MembershipRecord {
            index,
            voters: self.voters(),
            peers: self.storage.peers(),
        }
    }

    /// Installs a snapshot sent by the leader, replacing local state.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<u64> {
        let index = restore_snapshot(&self.storage, &self.fsm, snapshot.clone())?;
        let record = self.membership_record(index);
        if let Some(disk) = self.disk.as_mut() {
            disk.snapshots.save(&snapshot)?;
            disk.wal.rewrite(&self.storage.hard_state(), &record, &[])?;
        }
        self.last_snapshot_index = index;
        info!(node_id = self.id, index, "installed snapshot from leader");
        Ok(index)
    }

    /// Snapshots the FSM and truncates the log when the policy says so.
    ///
    /// Only applied entries are ever covered. Followers that fall behind the
    /// new first index are served a snapshot built on demand by
    /// [`NodeStorage`].
    fn maybe_compact(&mut self) -> Result<()> {
        let applied = self.applied_index();
        let log_bytes = self.disk.as_ref().map_or(0, |disk| disk.wal.len());
        if !self
            .policy
            .should_snapshot(applied, self.last_snapshot_index, log_bytes)
        {
            return Ok(());
        }

        let snapshot = self.storage.build_snapshot()?;
        if let Some(disk) = self.disk.as_ref() {
            disk.snapshots.save(&snapshot)?;
        }
        self.storage
            .compact(applied)
            .context("failed to compact raft log")?;
        if self.disk.is_some() {
            let entries = self.storage.log_entries().context("failed to read log")?;
            let hard_state = self.storage.hard_state();
            let record = self.membership_record(applied);
            if let Some(disk) = self.disk.as_mut() {
                disk.wal.rewrite(&hard_state, &record, &entries)?;
            }
        }
        self.last_snapshot_index = applied;
        info!(
            node_id = self.id,
            index = applied,
            first_index = self.first_index(),
            "compacted log"
        );
        Ok(())
    }
}

fn proposal_error(err: raft::Error) -> StoreError {
    match err {
        raft::Error::ProposalDropped => StoreError::NotLeader,
        other => StoreError::Raft(other),
    }
}

/// Loads a snapshot into raft storage and the FSM. Returns its index.
fn restore_snapshot(storage: &NodeStorage, fsm: &Fsm, snapshot: Snapshot) -> Result<u64> {
    let payload = SnapshotPayload::decode(&snapshot.data)?;
    let (index, term) = {
        let meta = snapshot.get_metadata();
        (meta.index, meta.term)
    };
    storage
        .apply_snapshot(snapshot)
        .context("failed to apply snapshot to raft storage")?;
    fsm.restore(payload.state);
    storage.replace_peers(payload.peers);
    storage.set_applied(index, term);
    Ok(index)
}

/// Puts replayed WAL state on top of the snapshot at `snapshot_index`.
fn restore_log(storage: &NodeStorage, replay: WalReplay, snapshot_index: u64) -> Result<()> {
    if let Some(membership) = replay.membership {
        if membership.index >= snapshot_index {
            storage.set_conf_state(ConfState::from((membership.voters, vec![])));
            storage.replace_peers(membership.peers);
        }
    }

    let entries: Vec<Entry> = replay
        .entries
        .into_iter()
        .filter(|entry| entry.index > snapshot_index)
        .collect();
    if let Some(first) = entries.first() {
        let expected = storage.last_index()? + 1;
        if first.index != expected {
            bail!(
                "log gap on replay: first entry {} but expected {}",
                first.index,
                expected
            );
        }
        storage.append(&entries).context("failed to restore log entries")?;
    }

    if let Some(mut hs) = replay.hard_state {
        let last = storage.last_index()?;
        hs.commit = hs.commit.clamp(snapshot_index, last.max(snapshot_index));
        storage.set_hard_state(hs);
    }
    debug!(
        snapshot_index,
        last_index = storage.last_index()?,
        "replayed write-ahead log"
    );
    Ok(())
}

/// Snapshot at index 1, term 1 that makes `voters` a cluster.
fn bootstrap_snapshot(voters: &BTreeMap<NodeId, String>) -> Result<Snapshot> {
    let payload = SnapshotPayload::new(Default::default(), voters.clone());
    let mut snapshot = Snapshot::default();
    snapshot.data = payload.encode()?.into();
    let meta = snapshot.mut_metadata();
    meta.index = 1;
    meta.term = 1;
    *meta.mut_conf_state() = ConfState::from((voters.keys().copied().collect::<Vec<_>>(), vec![]));
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn addr(id: NodeId) -> String {
        format!("127.0.0.1:{}", 9000 + id)
    }

    fn set(key: &str, value: &str) -> LogCommand {
        LogCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Test harness for simulating a Raft cluster without networking.
    ///
    /// Routes messages between nodes in-memory for deterministic testing
    /// of election, replication and membership logic. Nodes listed in
    /// `isolated` neither send nor receive.
    struct TestCluster {
        nodes: HashMap<NodeId, RaftNode>,
        isolated: HashSet<NodeId>,
        applied: HashMap<NodeId, Vec<ApplyReport>>,
        read_states: HashMap<NodeId, Vec<ReadState>>,
    }

    impl TestCluster {
        /// Creates a cluster of N voters with sequential IDs starting from 1.
        fn new(n: u64) -> Result<Self> {
            Self::with_policy(n, SnapshotPolicy::default())
        }

        fn with_policy(n: u64, policy: SnapshotPolicy) -> Result<Self> {
            let voters: BTreeMap<NodeId, String> = (1..=n).map(|id| (id, addr(id))).collect();
            let mut cluster = Self {
                nodes: HashMap::new(),
                isolated: HashSet::new(),
                applied: HashMap::new(),
                read_states: HashMap::new(),
            };
            for id in 1..=n {
                let mut options = NodeOptions::new(id);
                options.initial_voters = voters.clone();
                options.snapshot = policy.clone();
                cluster.insert(RaftNode::open(options, Arc::new(Fsm::new()))?);
            }
            Ok(cluster)
        }

        fn insert(&mut self, node: RaftNode) {
            self.nodes.insert(node.id(), node);
        }

        fn node_mut(&mut self, id: NodeId) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: NodeId) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for (id, node) in self.nodes.iter_mut() {
                if !self.isolated.contains(id) {
                    node.tick();
                }
            }
        }

        /// Processes ready states for all nodes and routes messages.
        ///
        /// Returns number of messages delivered (useful for detecting quiescence).
        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        if !self.isolated.contains(id) {
                            messages.extend(bundle.messages);
                        }
                        self.applied.entry(*id).or_default().extend(bundle.applied);
                        self.read_states
                            .entry(*id)
                            .or_default()
                            .extend(bundle.read_states);
                    }
                }
                if messages.is_empty() {
                    break;
                }
                total_delivered += messages.len();
                for msg in messages {
                    if self.isolated.contains(&msg.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total_delivered)
        }

        /// Runs ticks + message delivery until messages stop flowing or max iterations.
        fn stabilize(&mut self, max_iters: usize) -> Result<usize> {
            for i in 0..max_iters {
                self.tick_all();
                let delivered = self.deliver_messages()?;
                if delivered == 0 {
                    return Ok(i + 1);
                }
            }
            Ok(max_iters)
        }

        /// Runs a fixed number of rounds regardless of traffic.
        fn run(&mut self, rounds: usize) -> Result<()> {
            for _ in 0..rounds {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn leaders(&self) -> Vec<NodeId> {
            let mut leaders: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.is_leader())
                .map(|(id, _)| *id)
                .collect();
            leaders.sort_unstable();
            leaders
        }

        /// Verifies exactly one leader exists and returns its ID.
        fn assert_single_leader(&self) -> NodeId {
            let leaders = self.leaders();
            assert_eq!(leaders.len(), 1, "expected exactly one leader, found: {:?}", leaders);
            leaders[0]
        }

        fn elect(&mut self, id: NodeId) -> Result<()> {
            self.node_mut(id).campaign()?;
            self.stabilize(20)?;
            assert_eq!(self.assert_single_leader(), id);
            Ok(())
        }

        fn applied_commands(&self, id: NodeId) -> Vec<LogCommand> {
            self.applied
                .get(&id)
                .into_iter()
                .flatten()
                .filter_map(|report| match &report.outcome {
                    ApplyOutcome::Command { command, .. } => Some(command.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_three_node_election() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).role(), StateRole::Follower);
            assert_eq!(cluster.node(id).leader_id(), 0);
        }

        cluster.elect(1)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_single_voter_campaigns_on_open() -> Result<()> {
        let mut cluster = TestCluster::new(1)?;
        cluster.deliver_messages()?;
        assert_eq!(cluster.assert_single_leader(), 1);
        Ok(())
    }

    #[test]
    fn test_follower_rejects_proposals() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let err = cluster.node_mut(2).propose(&set("a", "1")).unwrap_err();
        assert!(err.is_not_leader());
        let err = cluster.node_mut(3).read_index(b"r".to_vec()).unwrap_err();
        assert!(err.is_not_leader());
        Ok(())
    }

    #[test]
    fn test_commands_apply_in_the_same_order_everywhere() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let commands = vec![
            set("a", "1"),
            set("b", "2"),
            LogCommand::Delete { key: "a".into() },
            set("b", "3"),
            LogCommand::Delete { key: "never".into() },
        ];
        let mut proposals = Vec::new();
        for command in &commands {
            proposals.push(cluster.node_mut(1).propose(command)?);
        }
        cluster.stabilize(10)?;

        for id in 1..=3 {
            assert_eq!(cluster.applied_commands(id), commands, "node {id}");
            let fsm = cluster.node(id).fsm();
            assert_eq!(fsm.get("a"), None);
            assert_eq!(fsm.get("b").as_deref(), Some("3"));
        }

        let reports = &cluster.applied[&1];
        for proposal in proposals {
            let report = reports
                .iter()
                .find(|report| report.index == proposal.index)
                .expect("proposal applied");
            assert_eq!(report.term, proposal.term);
        }
        Ok(())
    }

    #[test]
    fn test_read_index_resolves_on_leader() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        cluster.node_mut(1).propose(&set("x", "1"))?;
        cluster.stabilize(10)?;

        cluster.node_mut(1).read_index(b"read-1".to_vec())?;
        cluster.stabilize(10)?;

        let states = &cluster.read_states[&1];
        let state = states
            .iter()
            .find(|s| s.request_ctx == b"read-1")
            .expect("read state delivered");
        assert!(state.index <= cluster.node(1).applied_index());
        Ok(())
    }

    impl TestCluster {
        /// One pass of ready processing and delivery, without draining.
        fn deliver_round(&mut self) -> Result<usize> {
            let mut messages = Vec::new();
            for (id, node) in self.nodes.iter_mut() {
                if let Some(bundle) = node.poll_ready()? {
                    messages.extend(bundle.messages);
                    self.applied.entry(*id).or_default().extend(bundle.applied);
                    self.read_states.entry(*id).or_default().extend(bundle.read_states);
                }
            }
            let delivered = messages.len();
            for msg in messages {
                if let Some(node) = self.nodes.get_mut(&msg.to) {
                    node.step(msg)?;
                }
            }
            Ok(delivered)
        }
    }

    #[test]
    fn test_read_index_right_after_election_is_confirmed() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        for _ in 0..20 {
            if cluster.node(1).is_leader() {
                break;
            }
            cluster.deliver_round()?;
        }
        assert!(cluster.node(1).is_leader());
        assert!(cluster.node(1).commit_index() < cluster.node(1).last_index());

        cluster.node_mut(1).read_index(b"early".to_vec())?;
        assert_eq!(cluster.node(1).deferred_reads(), 1);
        cluster.stabilize(20)?;

        assert_eq!(cluster.node(1).deferred_reads(), 0);
        let state = cluster.read_states[&1]
            .iter()
            .find(|s| s.request_ctx == b"early")
            .expect("read confirmed once the leader's entry committed");
        assert!(state.index >= 2);
        assert!(state.index <= cluster.node(1).applied_index());
        Ok(())
    }

    #[test]
    fn test_deferred_reads_dropped_on_step_down() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        for _ in 0..20 {
            if cluster.node(1).is_leader() {
                break;
            }
            cluster.deliver_round()?;
        }
        cluster.node_mut(1).read_index(b"held".to_vec())?;

        // Cut the new leader off before its no-op commits.
        cluster.isolated.insert(1);
        cluster.tick_isolated(1, 40);
        assert!(!cluster.node(1).is_leader());
        cluster.node_mut(1).poll_ready()?;
        assert_eq!(cluster.node(1).deferred_reads(), 0);
        Ok(())
    }

    #[test]
    fn test_no_split_brain_during_forced_campaign() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        cluster.node_mut(2).campaign()?;
        for _ in 0..20 {
            cluster.tick_all();
            cluster.deliver_messages()?;
            let leaders = cluster.leaders();
            assert!(leaders.len() <= 1, "SPLIT BRAIN DETECTED: {:?}", leaders);
        }
        cluster.stabilize(10)?;
        cluster.assert_single_leader();
        Ok(())
    }

    #[test]
    fn test_isolated_leader_is_replaced() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        let old_term = cluster.node(1).term();

        cluster.isolated.insert(1);
        cluster.run(40)?;

        let leaders: Vec<NodeId> = cluster.leaders().into_iter().filter(|id| *id != 1).collect();
        assert_eq!(leaders.len(), 1, "exactly one of nodes 2,3 should lead");
        assert!(cluster.node(leaders[0]).term() > old_term);

        // check_quorum makes the cut-off leader step down on its own
        cluster.tick_isolated(1, 40);
        assert!(!cluster.node(1).is_leader());
        Ok(())
    }

    impl TestCluster {
        fn tick_isolated(&mut self, id: NodeId, ticks: usize) {
            for _ in 0..ticks {
                self.node_mut(id).tick();
            }
        }
    }

    #[test]
    fn test_overwritten_proposal_reports_new_term() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        // Leader appends an entry nobody else sees, then loses leadership.
        cluster.isolated.insert(1);
        let lost = cluster.node_mut(1).propose(&set("lost", "1"))?;
        cluster.deliver_messages()?;
        cluster.run(40)?;
        let new_leader = cluster.leaders().into_iter().find(|id| *id != 1).expect("new leader");
        cluster.node_mut(new_leader).propose(&set("won", "1"))?;
        cluster.deliver_messages()?;

        cluster.isolated.clear();
        cluster.run(30)?;

        let report = cluster.applied[&1]
            .iter()
            .find(|report| report.index == lost.index)
            .expect("index applied on old leader");
        assert_ne!(report.term, lost.term);
        assert_eq!(cluster.node(1).fsm().get("lost"), None);
        Ok(())
    }

    #[test]
    fn test_joiner_catches_up_from_snapshot() -> Result<()> {
        let mut cluster = TestCluster::new(1)?;
        cluster.deliver_messages()?;
        for i in 0..5 {
            cluster.node_mut(1).propose(&set(&format!("k{i}"), "v"))?;
        }
        cluster.deliver_messages()?;

        cluster.insert(RaftNode::open(NodeOptions::new(2), Arc::new(Fsm::new()))?);
        assert!(cluster.node(2).voters().is_empty());

        let proposal = cluster.node_mut(1).propose_membership(&MembershipChange::AddVoter {
            id: 2,
            raft_addr: addr(2),
        })?;
        cluster.run(20)?;

        let report = cluster.applied[&1]
            .iter()
            .find(|report| report.index == proposal.index)
            .expect("membership applied");
        assert!(matches!(report.outcome, ApplyOutcome::Membership(_)));

        let joiner = cluster.node(2);
        assert_eq!(joiner.voters(), vec![1, 2]);
        assert_eq!(joiner.fsm().len(), 5);
        assert_eq!(joiner.peer_addr(2), Some(addr(2)));
        assert_eq!(joiner.leader_id(), 1);
        Ok(())
    }

    #[test]
    fn test_second_pending_membership_change_is_dropped() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        let first = cluster.node_mut(1).propose_membership(&MembershipChange::AddVoter {
            id: 4,
            raft_addr: addr(4),
        })?;
        let second = cluster.node_mut(1).propose_membership(&MembershipChange::AddVoter {
            id: 5,
            raft_addr: addr(5),
        })?;
        cluster.stabilize(10)?;

        let outcome = |index: u64| {
            cluster.applied[&1]
                .iter()
                .find(|report| report.index == index)
                .map(|report| report.outcome.clone())
        };
        assert!(matches!(outcome(first.index), Some(ApplyOutcome::Membership(_))));
        assert_eq!(outcome(second.index), Some(ApplyOutcome::Empty));
        assert_eq!(cluster.node(1).voters(), vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_compaction_serves_lagging_follower() -> Result<()> {
        let policy = SnapshotPolicy {
            threshold: 10,
            ..SnapshotPolicy::default()
        };
        let mut cluster = TestCluster::with_policy(3, policy)?;
        cluster.elect(1)?;

        cluster.isolated.insert(3);
        for i in 0..30 {
            cluster.node_mut(1).propose(&set(&format!("k{i}"), &i.to_string()))?;
            cluster.deliver_messages()?;
        }
        assert!(cluster.node(1).last_snapshot_index() > 0);
        assert!(cluster.node(1).first_index() > 2);

        cluster.isolated.clear();
        cluster.run(20)?;
        let lagging = cluster.node(3);
        assert_eq!(lagging.fsm().len(), 30);
        assert_eq!(lagging.fsm().get("k29").as_deref(), Some("29"));
        Ok(())
    }

    #[test]
    fn test_restart_restores_state_from_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut options = NodeOptions::new(1);
        options.initial_voters = BTreeMap::from([(1, addr(1))]);
        options.data_dir = Some(dir.path().to_path_buf());
        options.snapshot.threshold = 4;

        let last_index = {
            let mut cluster = TestCluster {
                nodes: HashMap::new(),
                isolated: HashSet::new(),
                applied: HashMap::new(),
                read_states: HashMap::new(),
            };
            cluster.insert(RaftNode::open(options.clone(), Arc::new(Fsm::new()))?);
            cluster.deliver_messages()?;
            for i in 0..10 {
                cluster.node_mut(1).propose(&set(&format!("k{i}"), "v"))?;
                cluster.deliver_messages()?;
            }
            cluster.node_mut(1).propose(&LogCommand::Delete { key: "k0".into() })?;
            cluster.deliver_messages()?;
            assert!(cluster.node(1).last_snapshot_index() > 1);
            cluster.node(1).last_index()
        };

        let fsm = Arc::new(Fsm::new());
        let mut node = RaftNode::open(options, Arc::clone(&fsm))?;
        while node.poll_ready()?.is_some() {}

        assert!(node.last_index() >= last_index);
        assert_eq!(node.voters(), vec![1]);
        assert_eq!(fsm.len(), 9);
        assert_eq!(fsm.get("k0"), None);
        assert_eq!(fsm.get("k9").as_deref(), Some("v"));
        Ok(())
    }
}
