//! Merkle node definition and builder.
//!
//! Each node in the DAG contains:
//! - References to parent nodes (the clock head it was built on)
//! - Its height: one more than the highest parent
//! - A payload (a transaction delta or a compaction snapshot)
//!
//! A node's CID is the digest of its encoded bytes. The CID is not stored
//! inside the node; it is whatever the block store files the bytes under.

use crate::error::DagError;
use crate::hash::{normalize_head, Cid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The payload carried by a Merkle node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload<T> {
    /// An incremental batch of changes on top of the parents.
    Delta(T),

    /// The full resolved state. Written by compaction as a parentless root.
    Snapshot(T),
}

impl<T> Payload<T> {
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Payload::Snapshot(_))
    }

    /// The carried data regardless of kind.
    pub fn data(&self) -> &T {
        match self {
            Payload::Delta(data) | Payload::Snapshot(data) => data,
        }
    }
}

/// An encoded node ready for the block store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

/// A node in the Merkle-DAG representing one clock advance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MerkleNode<T> {
    /// Causal predecessors, sorted. Empty for roots.
    pub parents: Vec<Cid>,

    /// Strictly greater than every parent's height. Roots start at 1.
    pub height: u64,

    pub payload: Payload<T>,
}

impl<T> MerkleNode<T> {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn has_parent(&self, cid: &Cid) -> bool {
        self.parents.binary_search(cid).is_ok()
    }
}

impl<T: Serialize> MerkleNode<T> {
    /// Encode the node and derive its CID.
    pub fn encode(&self) -> Result<Block, DagError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Block {
            cid: Cid::digest(&bytes),
            bytes,
        })
    }
}

impl<T: DeserializeOwned> MerkleNode<T> {
    /// Decode a node fetched under `cid`, checking the bytes really hash to it.
    pub fn decode(cid: &Cid, bytes: &[u8]) -> Result<Self, DagError> {
        if Cid::digest(bytes) != *cid {
            return Err(DagError::VerificationFailed(*cid));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for creating Merkle nodes.
#[derive(Clone, Debug)]
pub struct NodeBuilder<T> {
    parents: Vec<Cid>,
    parent_height: u64,
    payload: Payload<T>,
}

impl<T> NodeBuilder<T> {
    /// Start a delta node.
    pub fn delta(data: T) -> Self {
        NodeBuilder {
            parents: Vec::new(),
            parent_height: 0,
            payload: Payload::Delta(data),
        }
    }

    /// Start a snapshot node.
    pub fn snapshot(data: T) -> Self {
        NodeBuilder {
            parents: Vec::new(),
            parent_height: 0,
            payload: Payload::Snapshot(data),
        }
    }

    /// Set the parents. Order does not matter; they are normalized on build.
    pub fn with_parents(mut self, parents: Vec<Cid>) -> Self {
        self.parents = parents;
        self
    }

    /// The highest height among the parents (or the state being superseded).
    pub fn above_height(mut self, height: u64) -> Self {
        self.parent_height = height;
        self
    }

    pub fn build(self) -> MerkleNode<T> {
        let mut parents = self.parents;
        normalize_head(&mut parents);
        MerkleNode {
            parents,
            height: self.parent_height + 1,
            payload: self.payload,
        }
    }
}
