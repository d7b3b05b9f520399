//! Snapshot payloads and their on-disk store.
//!
//! A raft `Snapshot` carries the metadata (index, term, voters); its data is a
//! [`SnapshotPayload`] holding the state machine maps plus the cluster address
//! map. Files are named `snap-<index>.snap` and hold the prost-encoded
//! `Snapshot`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::Snapshot;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::NodeId;
use crate::fsm::FsmSnapshot;
use crate::wal::sync_dir;

/// Bumped whenever the payload layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snap-";
const SNAPSHOT_SUFFIX: &str = ".snap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub version: u32,
    pub state: FsmSnapshot,
    /// Raft address of every voter, keyed by node id.
    pub peers: BTreeMap<NodeId, String>,
}

impl SnapshotPayload {
    pub fn new(state: FsmSnapshot, peers: BTreeMap<NodeId, String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            state,
            peers,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: SnapshotPayload =
            bincode::deserialize(bytes).context("failed to decode snapshot payload")?;
        if payload.version != SNAPSHOT_VERSION {
            bail!(
                "unsupported snapshot version {} (expected {})",
                payload.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(payload)
    }
}

/// Directory of persisted snapshots, newest wins.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    /// Durably writes `snapshot`, then drops snapshots beyond the retention count.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let index = snapshot.get_metadata().index;
        let path = self.dir.join(file_name(index));
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(&snapshot.encode_to_vec())?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to install snapshot {}", path.display()))?;
        sync_dir(&self.dir)?;
        info!(
            index,
            term = snapshot.get_metadata().term,
            path = %path.display(),
            "snapshot persisted"
        );

        self.prune()?;
        Ok(path)
    }

    /// Loads the newest snapshot, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let Some((_, path)) = self.list()?.pop() else {
            return Ok(None);
        };
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot = Snapshot::decode(&bytes[..])
            .with_context(|| format!("corrupt snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Snapshot indexes on disk, oldest first.
    pub fn indexes(&self) -> Result<Vec<u64>> {
        Ok(self.list()?.into_iter().map(|(index, _)| index).collect())
    }

    fn prune(&self) -> Result<()> {
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(self.retain);
        for (index, path) in snapshots.into_iter().take(excess) {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            debug!(index, "discarded superseded snapshot");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if let Some(index) = parse_index(&path) {
                snapshots.push((index, path));
            }
        }
        snapshots.sort_unstable_by_key(|(index, _)| *index);
        Ok(snapshots)
    }
}

fn file_name(index: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{index:020}{SNAPSHOT_SUFFIX}")
}

fn parse_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?
        .parse()
        .ok()
}
