//! # cinder-merkle
//!
//! Merkle clock substrate for the Cinder document database.
//!
//! This crate provides:
//! - Content identifiers (SHA-256) for immutable blocks
//! - Merkle-DAG nodes that link a payload to the head it was built on
//! - The block store interface and an in-memory store
//! - A caching DAG reader (walks, frontier reduction, height checks)
//! - The Merkle clock: current head plus tick/tock advance events
//!
//! The crate knows nothing about documents; node payloads are any
//! serde-serializable type.
//!
//! ## Example
//!
//! ```rust
//! use cinder_merkle::{DagReader, MemoryBlockStore, NodeBuilder};
//! use std::sync::Arc;
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let dag: DagReader<String> = DagReader::new(Arc::new(MemoryBlockStore::new()));
//!
//! let (root, _) = dag.write(NodeBuilder::delta("first".to_string()).build()).await.unwrap();
//! let next = NodeBuilder::delta("second".to_string())
//!     .with_parents(vec![root])
//!     .above_height(1)
//!     .build();
//! let (head, _) = dag.write(next).await.unwrap();
//!
//! assert_eq!(dag.frontier(&[root, head]).await.unwrap(), vec![head]);
//! # });
//! # }
//! ```

mod clock;
mod dag;
mod error;
mod hash;
mod node;
mod store;

pub use clock::{ListenerId, MerkleClock};
pub use dag::{causal_order, check_heights, DagReader, NodeSet};
pub use error::{BlockError, DagError};
pub use hash::{normalize_head, Cid, ClockHead};
pub use node::{Block, MerkleNode, NodeBuilder, Payload};
pub use store::{BlockStore, MemoryBlockStore};
