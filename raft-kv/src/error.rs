use thiserror::Error;

/// Errors returned by the store facade.
///
/// `NotLeader` and `Timeout` are recoverable by redirecting or retrying.
/// `Storage` means the node stopped participating and must be restarted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not leader")]
    NotLeader,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("a membership change is already in progress")]
    ChangeInProgress,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),
    #[error("store is shut down")]
    Closed,
}

impl StoreError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, StoreError::NotLeader)
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
