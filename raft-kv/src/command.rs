use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Commands that flow through the Raft replicated log.
///
/// Every variant is safe to replay: `Set` and `SetMeta` overwrite, and
/// `Delete` of an absent key does nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCommand {
    Set { key: String, value: String },
    Delete { key: String },
    SetMeta { node_id: NodeId, http_addr: String },
}

impl LogCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
