//! Block storage interface and an in-memory implementation.
//!
//! The block store is the durable layer under the clock. It maps CIDs to
//! opaque bytes and never interprets them. Encryption and persistence live
//! behind this trait.

use crate::error::BlockError;
use crate::hash::Cid;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Content-addressed block storage.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Store `bytes`, returning their content identifier.
    ///
    /// Must be deterministic: identical bytes always yield the same CID.
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid, BlockError>;

    /// Fetch a block. Fails with [`BlockError::NotFound`] if absent.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockError>;

    /// Drop the given blocks. Returns how many were present and discarded.
    ///
    /// Blocks not named are never touched, so other histories sharing the
    /// store survive. Stores that cannot reclaim space may keep everything
    /// and return 0.
    async fn remove(&self, cids: &HashSet<Cid>) -> Result<usize, BlockError> {
        let _ = cids;
        Ok(0)
    }
}

/// In-memory block store keyed by SHA-256.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks.read().contains_key(cid)
    }

    /// All stored CIDs, sorted.
    pub fn cids(&self) -> Vec<Cid> {
        let mut cids: Vec<_> = self.blocks.read().keys().copied().collect();
        cids.sort();
        cids
    }

    /// Copy every block of `other` into this store. Used to ship history
    /// between replicas in tests and simulations.
    pub fn absorb(&self, other: &MemoryBlockStore) -> usize {
        let theirs = other.blocks.read();
        let mut ours = self.blocks.write();
        let mut copied = 0;
        for (cid, bytes) in theirs.iter() {
            if !ours.contains_key(cid) {
                ours.insert(*cid, bytes.clone());
                copied += 1;
            }
        }
        copied
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Cid, BlockError> {
        let cid = Cid::digest(&bytes);
        self.blocks.write().entry(cid).or_insert(bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockError> {
        self.blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(BlockError::NotFound(*cid))
    }

    async fn remove(&self, cids: &HashSet<Cid>) -> Result<usize, BlockError> {
        let mut blocks = self.blocks.write();
        Ok(cids.iter().filter(|cid| blocks.remove(*cid).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(cid, Cid::digest(b"hello"));
        assert_eq!(store.get(&cid).await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryBlockStore::new();
        let a = store.put(b"same".to_vec()).await.unwrap();
        let b = store.put(b"same".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_block() {
        let store = MemoryBlockStore::new();
        let cid = Cid::digest(b"nope");
        assert_eq!(store.get(&cid).await, Err(BlockError::NotFound(cid)));
    }

    #[tokio::test]
    async fn test_remove_and_absorb() {
        let store = MemoryBlockStore::new();
        let keep = store.put(b"keep".to_vec()).await.unwrap();
        let gone = store.put(b"drop".to_vec()).await.unwrap();

        let other = MemoryBlockStore::new();
        assert_eq!(other.absorb(&store), 2);

        let ghost = Cid::digest(b"never stored");
        let discarded = store.remove(&HashSet::from([gone, ghost])).await.unwrap();
        assert_eq!(discarded, 1);
        assert_eq!(store.cids(), vec![keep]);
        assert_eq!(other.len(), 2);
    }
}
