use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::NodeId;
use crate::config::StoreConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Numeric node id, unique within the cluster and non-zero.
    #[arg(long, default_value_t = 1)]
    pub id: NodeId,

    /// Address the HTTP API binds to and advertises.
    #[arg(long, default_value = "127.0.0.1:11000", value_hint = ValueHint::Hostname)]
    pub http_addr: String,

    /// Address the raft transport binds to and advertises.
    #[arg(long, default_value = "127.0.0.1:12000", value_hint = ValueHint::Hostname)]
    pub raft_addr: String,

    /// Directory for the raft log and snapshots. Omit to run in memory.
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// HTTP address of an existing member to join. Omit to bootstrap a new cluster.
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub join: Option<String>,

    /// Applied entries between snapshots.
    #[arg(long, default_value_t = 8192)]
    pub snapshot_threshold: u64,

    /// Seconds to wait for a leader and for log replay at start-up.
    #[arg(long, default_value_t = 120)]
    pub open_timeout_secs: u64,
}

impl Cli {
    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(self.id, &self.http_addr, &self.raft_addr)
            .with_bootstrap(self.join.is_none())
            .with_snapshot_threshold(self.snapshot_threshold);
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        config
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}
