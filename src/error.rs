use thiserror::Error;

/// Error kinds surfaced by the indexing pipeline.
///
/// Transient queue conditions are retried by the caller's next poll;
/// everything else propagates out of the component that observed it.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("lease on '{0}' is held elsewhere")]
    LeaseHeldElsewhere(String),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("chain advanced past height {height}; range starting there is unrecoverable")]
    ChainReorgDeeperThanRange { height: u32 },

    #[error("index task '{task}' failed: {reason}")]
    IndexTaskFailed { task: String, reason: String },

    #[error("transient queue error: {0}")]
    QueueTransient(String),

    #[error("queue failure: {0}")]
    QueueFatal(String),

    #[error("transaction {txid} rejected (code {code:#04x}): {reason}")]
    Rejected {
        txid: String,
        code: u8,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("consensus encoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn other(msg: impl Into<String>) -> Self {
        IndexerError::Other(msg.into())
    }

    /// Transient errors are safe to swallow and retry on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::QueueTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
