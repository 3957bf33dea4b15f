//! Error types for the database layer.

use cinder_merkle::{BlockError, Cid, DagError};
use thiserror::Error;

/// Errors that can occur in database operations.
///
/// `Clone` because one failed batch is reported to every caller whose update
/// was coalesced into it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Read of an absent or deleted document.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A block referenced by the history is missing. Fatal.
    #[error("Block not found: {0}")]
    BlockNotFound(Cid),

    /// The cursor predates the last compaction; resync from `all_docs`.
    #[error("Stale cursor: history before the last compaction is gone")]
    StaleCursor,

    /// The deterministic merge rule could not be applied. Fatal.
    #[error("Merge conflict unresolved: {0}")]
    MergeConflictUnresolved(String),

    /// A subscriber callback failed. Logged, never propagated to writers.
    #[error("Listener error: {0}")]
    ListenerError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The write queue worker is gone (runtime shut down).
    #[error("Write queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DagError> for DbError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::BlockNotFound(cid) => DbError::BlockNotFound(cid),
            DagError::HeightViolation { .. } => DbError::MergeConflictUnresolved(err.to_string()),
            DagError::VerificationFailed(_) | DagError::Storage(_) => {
                DbError::Storage(err.to_string())
            }
            DagError::Encoding(msg) => DbError::Serialization(msg),
        }
    }
}

impl From<BlockError> for DbError {
    fn from(err: BlockError) -> Self {
        DbError::from(DagError::from(err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
