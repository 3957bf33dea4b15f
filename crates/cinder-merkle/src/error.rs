//! Error types for the Merkle clock substrate.

use crate::hash::Cid;
use thiserror::Error;

/// Errors raised by a [`BlockStore`](crate::BlockStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block not found: {0}")]
    NotFound(Cid),

    #[error("Block store failure: {0}")]
    Backend(String),
}

/// Errors that can occur while reading or writing the DAG.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// A referenced block is absent. Fatal: history is missing or corrupt.
    #[error("Block not found: {0}")]
    BlockNotFound(Cid),

    /// Block bytes do not hash to the CID they were requested under.
    #[error("Verification failed for block {0}")]
    VerificationFailed(Cid),

    /// A node claims a height that does not exceed its parents'.
    #[error("Height violation at {cid}: height {height}, parent height {parent_height}")]
    HeightViolation {
        cid: Cid,
        height: u64,
        parent_height: u64,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<BlockError> for DagError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::NotFound(cid) => DagError::BlockNotFound(cid),
            BlockError::Backend(msg) => DagError::Storage(msg),
        }
    }
}

impl From<serde_json::Error> for DagError {
    fn from(err: serde_json::Error) -> Self {
        DagError::Encoding(err.to_string())
    }
}
