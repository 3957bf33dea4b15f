//! # cinder-db
//!
//! An embeddable, local-first document database. All state is an immutable,
//! content-addressed history of mutation batches on a Merkle clock.
//!
//! This crate provides:
//! - **Database**: put/get/del, change feeds, full scans, subscriptions
//! - **Write queue**: single-writer batching of concurrent mutations
//! - **CRDT engine**: deterministic merge of concurrent heads
//! - **Indexes**: incrementally maintained sorted views and live queries
//! - **Compaction**: collapsing history into one snapshot node
//! - **Registry**: named databases with an explicit lifecycle
//!
//! Concurrent writers are merged by a pure function of content: the write
//! from the node with the greatest `(height, cid)` wins. Replicas that have
//! seen the same nodes resolve every key identically, whatever order they
//! saw them in.

mod compaction;
mod crdt;
mod database;
mod document;
mod error;
mod index;
mod live;
mod registry;
mod subscription;
mod write_queue;

pub use compaction::{CompactionConfig, CompactionStats};
pub use crdt::{Batch, BulkResult, Changes, ClockState, Crdt, Resolved};
pub use database::{Database, DatabaseConfig, DatabaseConfigBuilder};
pub use document::{
    coalesce, new_doc_id, AllDocsResponse, ChangeRow, ChangesOptions, ChangesResponse, DbResponse,
    Doc, DocRow, DocUpdate, Document, Fields,
};
pub use error::{DbError, Result};
pub use index::{collate, Index, IndexKey, IndexResponse, IndexRow, IndexSource, MapFn, QueryOptions};
pub use live::LiveQuery;
pub use registry::{Registry, StoreFactory};
pub use subscription::{BoxError, Listener, SubscriberHub, Subscription};
pub use write_queue::{BatchWriter, QueueConfig, WriteQueue};

pub use cinder_merkle::{BlockStore, Cid, ClockHead, MemoryBlockStore};
