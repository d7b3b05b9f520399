//! Append-only log file holding raft hard state and log entries.
//!
//! Records are framed with [`crate::frame`] and encoded with bincode. Entries
//! are kept in their prost encoding. Replaying the file reproduces what the
//! in-memory raft storage held: a later entry at an index already seen
//! replaces that entry and everything after it. Membership records carry the
//! voter set and raft addresses as of the last applied configuration change.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{Entry, HardState};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::NodeId;
use crate::frame::{read_frame, write_frame};

#[derive(Serialize, Deserialize)]
enum WalRecord {
    HardState { term: u64, vote: u64, commit: u64 },
    Entry(Vec<u8>),
    Membership(MembershipRecord),
}

/// Applied cluster configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    /// Log index at which this configuration took effect.
    pub index: u64,
    pub voters: Vec<NodeId>,
    pub peers: BTreeMap<NodeId, String>,
}

/// State recovered from an existing log file.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub hard_state: Option<HardState>,
    pub membership: Option<MembershipRecord>,
    pub entries: Vec<Entry>,
}

impl WalReplay {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.membership.is_none() && self.entries.is_empty()
    }
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

impl Wal {
    /// Opens (or creates) the log and replays whatever it holds.
    ///
    /// A record cut short by a crash at the end of the file is dropped and the
    /// file truncated to the last complete record.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, WalReplay)> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log {}", path.display()))?;

        let (replay, valid_len) = replay_records(&file)
            .with_context(|| format!("failed to replay log {}", path.display()))?;

        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            warn!(
                path = %path.display(),
                dropped_bytes = actual_len - valid_len,
                "truncating torn record at end of log"
            );
            file.set_len(valid_len)
                .context("failed to truncate torn log tail")?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
                len: valid_len,
            },
            replay,
        ))
    }

    /// Size of the log file in bytes, including buffered writes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append_hard_state(&mut self, hs: &HardState) -> Result<()> {
        let record = WalRecord::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        };
        self.append(&record)
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.append(&WalRecord::Entry(entry.encode_to_vec()))?;
        }
        Ok(())
    }

    pub fn append_membership(&mut self, membership: &MembershipRecord) -> Result<()> {
        self.append(&WalRecord::Membership(membership.clone()))
    }

    /// Flushes buffered records and waits for them to reach the disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush log")?;
        self.writer
            .get_ref()
            .sync_data()
            .context("failed to sync log")
    }

    /// Replaces the log with the given hard state, membership and entries.
    ///
    /// Used after compaction and snapshot installation. The new file is
    /// written beside the old one and renamed over it, so a crash leaves either
    /// the old or the new log intact.
    pub fn rewrite(
        &mut self,
        hs: &HardState,
        membership: &MembershipRecord,
        entries: &[Entry],
    ) -> Result<()> {
        self.sync()?;
        let tmp_path = self.path.with_extension("log.tmp");
        let mut len = 0;
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(file);
            let mut records = Vec::with_capacity(entries.len() + 2);
            records.push(WalRecord::HardState {
                term: hs.term,
                vote: hs.vote,
                commit: hs.commit,
            });
            records.push(WalRecord::Membership(membership.clone()));
            records.extend(entries.iter().map(|e| WalRecord::Entry(e.encode_to_vec())));
            for record in &records {
                len += write_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all().context("failed to sync rewritten log")?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to reopen log {}", self.path.display()))?;
        self.writer = BufWriter::new(file);
        self.len = len;
        Ok(())
    }

    fn append(&mut self, record: &WalRecord) -> Result<()> {
        self.len += write_record(&mut self.writer, record)?;
        Ok(())
    }
}

fn write_record<W: Write>(writer: &mut W, record: &WalRecord) -> Result<u64> {
    let body = bincode::serialize(record).context("failed to encode log record")?;
    write_frame(writer, &body).context("failed to write log record")?;
    Ok(4 + body.len() as u64)
}

/// Returns the replayed state and the length of the valid prefix.
fn replay_records(file: &File) -> Result<(WalReplay, u64)> {
    let mut reader = BufReader::new(file);
    let mut replay = WalReplay::default();
    let mut valid_len = 0u64;

    loop {
        let body = match read_frame(&mut reader) {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        let record: WalRecord =
            bincode::deserialize(&body).context("corrupt log record")?;
        match record {
            WalRecord::HardState { term, vote, commit } => {
                let mut hs = HardState::default();
                hs.term = term;
                hs.vote = vote;
                hs.commit = commit;
                replay.hard_state = Some(hs);
            }
            WalRecord::Entry(bytes) => {
                let entry = Entry::decode(&bytes[..]).context("corrupt log entry")?;
                while replay
                    .entries
                    .last()
                    .is_some_and(|last| last.index >= entry.index)
                {
                    replay.entries.pop();
                }
                replay.entries.push(entry);
            }
            WalRecord::Membership(membership) => replay.membership = Some(membership),
        }
        valid_len += 4 + body.len() as u64;
    }

    Ok((replay, valid_len))
}

/// Makes a rename inside `dir` durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("failed to sync directory {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
