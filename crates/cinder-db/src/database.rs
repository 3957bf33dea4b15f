//! The database: public surface over the write queue, CRDT engine and
//! listeners.

use crate::compaction::{CompactionConfig, CompactionStats};
use crate::crdt::Crdt;
use crate::document::{
    new_doc_id, AllDocsResponse, ChangesOptions, ChangesResponse, DbResponse, DocUpdate, Document,
};
use crate::error::Result;
use crate::index::{Index, IndexResponse, IndexSource, QueryOptions};
use crate::live::LiveQuery;
use crate::subscription::{BoxError, Listener, SubscriberHub, Subscription};
use crate::write_queue::{QueueConfig, WriteQueue};
use cinder_merkle::{BlockStore, Cid, ClockHead, MemoryBlockStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Configuration for a database.
#[derive(Clone, Debug, Default)]
pub struct DatabaseConfig {
    pub queue: QueueConfig,
    pub compaction: CompactionConfig,
}

/// Builder for database configuration.
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DatabaseConfig::default(),
        }
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.queue.max_batch_size = size;
        self
    }

    pub fn auto_compact(mut self, enabled: bool) -> Self {
        self.config.compaction.auto_compact = enabled;
        self
    }

    pub fn min_ops_for_compaction(mut self, ops: u64) -> Self {
        self.config.compaction.min_ops_for_compaction = ops;
        self
    }

    pub fn build(self) -> DatabaseConfig {
        self.config
    }
}

impl Default for DatabaseConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An embeddable document database.
///
/// Writes go through a single-writer queue and resolve once their batch is
/// merged; reads are served from an atomically swapped snapshot and never
/// wait on writers.
///
/// # Example
///
/// ```rust
/// use cinder_db::{Database, Document};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let db = Database::in_memory("notes");
///
/// let ok = db.put(Document::new().set("text", "hello")).await.unwrap();
/// let doc = db.get(&ok.id).await.unwrap();
/// assert_eq!(doc.get("text"), Some(&serde_json::json!("hello")));
///
/// db.del(&ok.id).await.unwrap();
/// assert!(db.get(&ok.id).await.is_err());
/// # }
/// ```
pub struct Database {
    name: String,
    config: DatabaseConfig,
    crdt: Arc<Crdt>,
    queue: WriteQueue,
    hub: Arc<SubscriberHub>,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    /// Background refresh listeners of cached indexes.
    refreshers: Mutex<Vec<Subscription>>,
}

impl Database {
    /// An empty database over `blocks`. Must be called inside a tokio
    /// runtime.
    pub fn new(name: impl Into<String>, blocks: Arc<dyn BlockStore>, config: DatabaseConfig) -> Self {
        let crdt = Arc::new(Crdt::new(blocks, config.compaction.clone()));
        Self::with_engine(name.into(), crdt, config)
    }

    /// An empty database over a fresh in-memory block store.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(MemoryBlockStore::new()), DatabaseConfig::default())
    }

    /// Open an existing history at `head`.
    pub async fn open(
        name: impl Into<String>,
        blocks: Arc<dyn BlockStore>,
        head: ClockHead,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let crdt = Arc::new(Crdt::open(blocks, head, config.compaction.clone()).await?);
        Ok(Self::with_engine(name.into(), crdt, config))
    }

    fn with_engine(name: String, crdt: Arc<Crdt>, config: DatabaseConfig) -> Self {
        let queue = WriteQueue::new(crdt.clone(), config.queue.clone());
        let hub = SubscriberHub::new(crdt.clock().clone());
        debug!(db = %name, heads = crdt.head().len(), "database ready");
        Database {
            name,
            config,
            crdt,
            queue,
            hub,
            indexes: RwLock::new(HashMap::new()),
            refreshers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn head(&self) -> ClockHead {
        self.crdt.head()
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        self.crdt.blocks()
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.crdt.get(id)
    }

    /// Insert or replace a document. A document without an id gets a new
    /// time-sortable one; a document marked deleted is written as a
    /// tombstone.
    pub async fn put(&self, doc: Document) -> Result<DbResponse> {
        let id = if doc.id.is_empty() {
            new_doc_id()
        } else {
            doc.id
        };
        let update = if doc.deleted {
            DocUpdate::delete(id.clone())
        } else {
            DocUpdate::put(id.clone(), doc.fields)
        };
        let result = self.queue.push(update).await?;
        Ok(DbResponse {
            id,
            clock: result.head,
        })
    }

    pub async fn del(&self, id: &str) -> Result<DbResponse> {
        let result = self.queue.push(DocUpdate::delete(id)).await?;
        Ok(DbResponse {
            id: id.to_string(),
            clock: result.head,
        })
    }

    pub async fn changes(&self, since: &[Cid], opts: ChangesOptions) -> Result<ChangesResponse> {
        self.crdt.changes(since, &opts).await
    }

    pub async fn all_docs(&self) -> Result<AllDocsResponse> {
        Ok(self.crdt.all_docs())
    }

    /// Register a listener; see [`Listener::update`] and [`Listener::quiet`].
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.hub.subscribe(listener)
    }

    /// Fold remote heads into the clock. Their blocks must already be in
    /// this database's block store.
    pub async fn merge(&self, remote: ClockHead) -> Result<ClockHead> {
        self.crdt.merge_heads(remote).await
    }

    /// Discard this database's history, keeping only the resolved state.
    /// Deletions are kept so stale replicas cannot revive them. Cursors
    /// taken before this become stale.
    pub async fn compact(&self) -> Result<ClockHead> {
        self.crdt.compact().await
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.crdt.stats()
    }

    /// Batches the write queue has merged so far.
    pub fn batches_written(&self) -> u64 {
        self.queue.batches_written()
    }

    /// The index for `source`. Field and named indexes are shared and kept
    /// fresh in the background; anonymous ones are private to the caller.
    pub fn index(&self, source: IndexSource) -> Arc<Index> {
        let Some(name) = source.cache_name().map(str::to_string) else {
            return Arc::new(Index::new(source, self.crdt.clone()));
        };
        if let Some(index) = self.indexes.read().get(&name) {
            return index.clone();
        }

        let mut indexes = self.indexes.write();
        if let Some(index) = indexes.get(&name) {
            return index.clone();
        }
        let index = Arc::new(Index::new(source, self.crdt.clone()));
        indexes.insert(name.clone(), index.clone());
        drop(indexes);

        let weak = Arc::downgrade(&index);
        let refresher = self.hub.subscribe(Listener::quiet(move || {
            let index = weak.upgrade();
            async move {
                let Some(index) = index else {
                    return Ok(());
                };
                index
                    .refresh()
                    .await
                    .map(|_| ())
                    .map_err(|e| Box::new(e) as BoxError)
            }
        }));
        self.refreshers.lock().push(refresher);
        debug!(db = %self.name, index = %name, "index created");
        index
    }

    /// Query an index, building or refreshing it first.
    pub async fn query(&self, source: IndexSource, opts: QueryOptions) -> IndexResponse {
        self.index(source).query(&opts).await
    }

    /// Follow a query: rows are re-published whenever the clock advances.
    pub async fn live_query(&self, source: IndexSource, opts: QueryOptions) -> LiveQuery {
        LiveQuery::start(self.index(source), opts, &self.hub).await
    }

    /// Names of the shared indexes.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }
}
