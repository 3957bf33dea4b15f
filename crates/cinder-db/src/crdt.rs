//! The CRDT engine: mutation batches on a Merkle clock.
//!
//! Every batch becomes one DAG node whose parents are the heads it was built
//! on. The resolved value of a key is the write from the node with the
//! greatest `(height, cid)` among all reachable nodes that wrote it; inside
//! one node the later entry wins. Heights grow along every parent edge, so a
//! causal successor always wins and concurrent writes are decided by a pure
//! function of content.
//!
//! Readers take an `Arc` snapshot of the resolved state and never wait on
//! writers. Writers are serialized by an async mutex and publish a new
//! snapshot before advancing the clock.

use crate::compaction::{CompactionConfig, CompactionStats};
use crate::document::{
    coalesce, AllDocsResponse, ChangeRow, ChangesOptions, ChangesResponse, DocRow, DocUpdate,
    Document, Fields,
};
use crate::error::{DbError, Result};
use crate::write_queue::BatchWriter;
use async_trait::async_trait;
use cinder_merkle::{
    causal_order, check_heights, normalize_head, BlockStore, Cid, ClockHead, DagReader,
    MerkleClock, NodeBuilder, NodeSet,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node payload: one coalesced mutation batch.
pub type Batch = Vec<DocUpdate>;

/// Clock tick payload: the resolved documents a batch changed.
pub type Changes = Vec<Document>;

/// The winning write for one key.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    /// `None` is a tombstone.
    pub value: Option<Fields>,
    pub writer: Cid,
    pub height: u64,
}

impl Resolved {
    fn to_doc(&self, key: &str) -> Document {
        match &self.value {
            Some(fields) => Document {
                id: key.to_string(),
                deleted: false,
                fields: fields.clone(),
            },
            None => Document::tombstone(key),
        }
    }
}

/// An immutable view of the database at one head.
#[derive(Clone, Debug, Default)]
pub struct ClockState {
    pub head: ClockHead,
    /// Highest node height in `head` (0 when empty).
    pub height: u64,
    /// Bumped by every compaction.
    pub epoch: u64,
    pub docs: BTreeMap<String, Resolved>,
}

/// Outcome of one merged batch, shared by every caller in it.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkResult {
    pub head: ClockHead,
    /// The batch as written, after last-write-in-batch coalescing.
    pub updates: Vec<DocUpdate>,
}

pub struct Crdt {
    dag: DagReader<Batch>,
    clock: Arc<MerkleClock<Changes>>,
    state: RwLock<Arc<ClockState>>,
    writer: tokio::sync::Mutex<()>,
    stats: Mutex<CompactionStats>,
    compaction: CompactionConfig,
}

impl Crdt {
    /// An empty database over `blocks`.
    pub fn new(blocks: Arc<dyn BlockStore>, compaction: CompactionConfig) -> Self {
        Crdt {
            dag: DagReader::new(blocks),
            clock: Arc::new(MerkleClock::new()),
            state: RwLock::new(Arc::new(ClockState::default())),
            writer: tokio::sync::Mutex::new(()),
            stats: Mutex::new(CompactionStats::default()),
            compaction,
        }
    }

    /// Rebuild the resolved state of an existing history.
    pub async fn open(
        blocks: Arc<dyn BlockStore>,
        head: ClockHead,
        compaction: CompactionConfig,
    ) -> Result<Self> {
        let crdt = Self::new(blocks, compaction);
        if head.is_empty() {
            return Ok(crdt);
        }

        let frontier = crdt.dag.frontier(&head).await?;
        let nodes = crdt.dag.collect(&frontier).await?;
        let docs = resolve(&nodes)?;
        let height = max_height(&nodes, &frontier);
        info!(heads = frontier.len(), nodes = nodes.len(), docs = docs.len(), "opened history");

        *crdt.state.write() = Arc::new(ClockState {
            head: frontier.clone(),
            height,
            epoch: 0,
            docs,
        });
        crdt.clock.advance(frontier, None);
        Ok(crdt)
    }

    pub fn clock(&self) -> &Arc<MerkleClock<Changes>> {
        &self.clock
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        self.dag.blocks()
    }

    /// Atomically taken view of the current state.
    pub fn snapshot(&self) -> Arc<ClockState> {
        self.state.read().clone()
    }

    pub fn head(&self) -> ClockHead {
        self.snapshot().head.clone()
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats.lock().clone()
    }

    /// Write one batch as a new node above the current head.
    ///
    /// The new node descends from every current head, so a local write also
    /// folds any pending fork back into a single head.
    pub async fn bulk(&self, updates: Vec<DocUpdate>) -> Result<BulkResult> {
        let _writer = self.writer.lock().await;
        let updates = coalesce(updates);
        let current = self.snapshot();
        if updates.is_empty() {
            return Ok(BulkResult {
                head: current.head.clone(),
                updates,
            });
        }

        let node = NodeBuilder::delta(updates.clone())
            .with_parents(current.head.clone())
            .above_height(current.height)
            .build();
        let (cid, node) = self.dag.write(node).await?;

        let mut docs = current.docs.clone();
        for update in &updates {
            docs.insert(
                update.key.clone(),
                Resolved {
                    value: update.value.clone(),
                    writer: cid,
                    height: node.height,
                },
            );
        }
        let changes: Changes = updates.iter().map(DocUpdate::to_doc).collect();

        debug!(
            batch = updates.len(),
            height = node.height,
            head = %cid.short(),
            "merged batch"
        );
        self.publish(
            ClockState {
                head: vec![cid],
                height: node.height,
                epoch: current.epoch,
                docs,
            },
            Some(&changes),
        );

        let compact_now = {
            let mut stats = self.stats.lock();
            stats.record_write();
            self.compaction.should_compact(&stats)
        };
        // The batch is committed either way; a failed compaction only logs.
        let head = if compact_now {
            match self.compact_locked().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(error = %e, "automatic compaction failed");
                    self.head()
                }
            }
        } else {
            vec![cid]
        };

        Ok(BulkResult { head, updates })
    }

    /// Merge remote heads whose blocks are already in the block store.
    ///
    /// Returns the new head. Heads that are concurrent with ours leave the
    /// clock forked until the next local write.
    pub async fn merge_heads(&self, remote: ClockHead) -> Result<ClockHead> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let mut heads = current.head.clone();
        heads.extend(remote);
        let frontier = self.dag.frontier(&heads).await?;
        if frontier == current.head {
            return Ok(frontier);
        }

        let nodes = self.dag.collect(&frontier).await?;
        let docs = resolve(&nodes)?;
        let changes: Changes = docs
            .iter()
            .filter(|(key, resolved)| {
                current
                    .docs
                    .get(*key)
                    .map_or(true, |old| old.value != resolved.value)
            })
            .map(|(key, resolved)| resolved.to_doc(key))
            .collect();

        debug!(
            heads = frontier.len(),
            nodes = nodes.len(),
            changed = changes.len(),
            "merged remote heads"
        );
        self.publish(
            ClockState {
                head: frontier.clone(),
                height: max_height(&nodes, &frontier),
                epoch: current.epoch,
                docs,
            },
            (!changes.is_empty()).then_some(&changes),
        );
        Ok(frontier)
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Result<Document> {
        self.snapshot()
            .docs
            .get(key)
            .filter(|resolved| resolved.value.is_some())
            .map(|resolved| resolved.to_doc(key))
            .ok_or_else(|| DbError::NotFound(key.to_string()))
    }

    /// Live documents at the current head, ordered by key.
    pub fn all_docs(&self) -> AllDocsResponse {
        let state = self.snapshot();
        let rows = state
            .docs
            .iter()
            .filter(|(_, resolved)| resolved.value.is_some())
            .map(|(key, resolved)| DocRow {
                key: key.clone(),
                value: resolved.to_doc(key),
            })
            .collect();
        AllDocsResponse {
            rows,
            clock: state.head.clone(),
        }
    }

    /// Keys whose resolved write is not reachable from `since`, in causal
    /// order. An empty `since` yields every key, tombstones included.
    pub async fn changes(&self, since: &[Cid], opts: &ChangesOptions) -> Result<ChangesResponse> {
        let state = self.snapshot();
        let mut since = since.to_vec();
        normalize_head(&mut since);
        if since == state.head {
            return Ok(ChangesResponse {
                rows: Vec::new(),
                clock: state.head.clone(),
            });
        }

        match self.changes_at(&state, &since, opts).await {
            // Blocks vanished under the walk: a compaction ran meanwhile.
            Err(DbError::BlockNotFound(_)) if self.snapshot().epoch != state.epoch => {
                Err(DbError::StaleCursor)
            }
            other => other,
        }
    }

    async fn changes_at(
        &self,
        state: &ClockState,
        since: &[Cid],
        opts: &ChangesOptions,
    ) -> Result<ChangesResponse> {
        let delta = self
            .dag
            .delta(&state.head, since)
            .await?
            .ok_or(DbError::StaleCursor)?;

        let mut emitted = HashSet::new();
        let mut rows = Vec::new();
        let ordered = causal_order(&delta);
        for (cid, node) in &ordered {
            for update in node.payload.data() {
                let Some(resolved) = state.docs.get(&update.key) else {
                    continue;
                };
                if resolved.writer == *cid && emitted.insert(update.key.as_str()) {
                    rows.push(ChangeRow {
                        key: update.key.clone(),
                        value: resolved.to_doc(&update.key),
                        clock: *cid,
                    });
                }
            }
        }
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }

        Ok(ChangesResponse {
            rows,
            clock: state.head.clone(),
        })
    }

    /// Replace the history reachable from the head with one snapshot node
    /// holding the resolved state, tombstones included.
    pub async fn compact(&self) -> Result<ClockHead> {
        let _writer = self.writer.lock().await;
        self.compact_locked().await
    }

    async fn compact_locked(&self) -> Result<ClockHead> {
        let current = self.snapshot();
        if current.head.is_empty() {
            return Ok(ClockHead::new());
        }
        let last = self.stats.lock().last_compaction;
        if current.head.len() == 1 && current.head.first().copied() == last {
            return Ok(current.head.clone());
        }

        // Tombstones stay in the snapshot so that it outranks stale writes
        // still held by replicas that never saw the deletes.
        let state: Batch = current
            .docs
            .iter()
            .map(|(key, resolved)| DocUpdate {
                key: key.clone(),
                value: resolved.value.clone(),
            })
            .collect();
        let mut superseded = self.dag.reachable(&current.head).await?;
        let node = NodeBuilder::snapshot(state)
            .above_height(current.height)
            .build();
        let (cid, node) = self.dag.write(node).await?;

        superseded.remove(&cid);
        let discarded = self.dag.blocks().remove(&superseded).await?;
        self.dag.clear_cache();

        let docs = node
            .payload
            .data()
            .iter()
            .map(|update| {
                (
                    update.key.clone(),
                    Resolved {
                        value: update.value.clone(),
                        writer: cid,
                        height: node.height,
                    },
                )
            })
            .collect();

        self.stats.lock().record_compaction(cid, discarded);
        info!(
            snapshot = %cid.short(),
            discarded,
            keys = node.payload.data().len(),
            "compacted history"
        );
        self.publish(
            ClockState {
                head: vec![cid],
                height: node.height,
                epoch: current.epoch + 1,
                docs,
            },
            None,
        );
        Ok(vec![cid])
    }

    fn publish(&self, next: ClockState, changes: Option<&Changes>) {
        let head = next.head.clone();
        *self.state.write() = Arc::new(next);
        self.clock.advance(head, changes);
    }
}

#[async_trait]
impl BatchWriter for Crdt {
    async fn write_batch(&self, updates: Vec<DocUpdate>) -> Result<BulkResult> {
        self.bulk(updates).await
    }
}

/// Resolve every key over a set of nodes.
fn resolve(nodes: &NodeSet<Batch>) -> Result<BTreeMap<String, Resolved>> {
    check_heights(nodes)?;
    let mut docs = BTreeMap::new();
    // Ascending (height, cid): each overwrite comes from a greater writer.
    for (cid, node) in causal_order(nodes) {
        for update in node.payload.data() {
            docs.insert(
                update.key.clone(),
                Resolved {
                    value: update.value.clone(),
                    writer: cid,
                    height: node.height,
                },
            );
        }
    }
    Ok(docs)
}

fn max_height(nodes: &NodeSet<Batch>, heads: &[Cid]) -> u64 {
    heads
        .iter()
        .filter_map(|cid| nodes.get(cid))
        .map(|node| node.height)
        .max()
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use cinder_merkle::MemoryBlockStore;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn put(key: &str, value: serde_json::Value) -> DocUpdate {
        DocUpdate::put(key, fields(value))
    }

    fn engine() -> (Arc<MemoryBlockStore>, Crdt) {
        let store = Arc::new(MemoryBlockStore::new());
        let crdt = Crdt::new(store.clone(), CompactionConfig::default());
        (store, crdt)
    }

    #[tokio::test]
    async fn test_bulk_and_get() {
        let (_, crdt) = engine();
        let result = crdt
            .bulk(vec![put("a", json!({"n": 1})), put("b", json!({"n": 2}))])
            .await
            .unwrap();

        assert_eq!(result.head.len(), 1);
        assert_eq!(crdt.head(), result.head);
        assert_eq!(crdt.get("a").unwrap().get("n"), Some(&json!(1)));
        assert!(matches!(crdt.get("zzz"), Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_last_write_wins() {
        let (_, crdt) = engine();
        let result = crdt
            .bulk(vec![put("a", json!({"n": 1})), put("a", json!({"n": 2}))])
            .await
            .unwrap();
        assert_eq!(result.updates.len(), 1);
        assert_eq!(crdt.get("a").unwrap().get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_tombstone() {
        let (_, crdt) = engine();
        crdt.bulk(vec![put("a", json!({"n": 1}))]).await.unwrap();
        crdt.bulk(vec![DocUpdate::delete("a")]).await.unwrap();

        assert!(matches!(crdt.get("a"), Err(DbError::NotFound(_))));
        assert!(crdt.all_docs().rows.is_empty());

        let changes = crdt.changes(&[], &ChangesOptions::default()).await.unwrap();
        assert_eq!(changes.rows.len(), 1);
        assert!(changes.rows[0].value.deleted);
    }

    #[tokio::test]
    async fn test_changes_since() {
        let (_, crdt) = engine();
        crdt.bulk(vec![put("a", json!({"v": 1}))]).await.unwrap();
        let since = crdt.head();
        crdt.bulk(vec![put("b", json!({"v": 1}))]).await.unwrap();
        crdt.bulk(vec![put("a", json!({"v": 2}))]).await.unwrap();

        let changes = crdt.changes(&since, &ChangesOptions::default()).await.unwrap();
        let keys: Vec<&str> = changes.rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(changes.rows[1].value.get("v"), Some(&json!(2)));
        assert_eq!(changes.clock, crdt.head());

        let nothing = crdt
            .changes(&changes.clock, &ChangesOptions::default())
            .await
            .unwrap();
        assert!(nothing.rows.is_empty());

        let limited = crdt
            .changes(&since, &ChangesOptions { limit: Some(1) })
            .await
            .unwrap();
        assert_eq!(limited.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_ticks_carry_documents() {
        let (_, crdt) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        crdt.clock().on_tick(move |changes: &Changes| {
            s.lock().extend(changes.iter().map(|d| d.id.clone()));
        });

        crdt.bulk(vec![put("x", json!({})), put("y", json!({}))])
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_compaction_discards_history() {
        let (store, crdt) = engine();
        crdt.bulk(vec![put("a", json!({"v": 1}))]).await.unwrap();
        let since = crdt.head();
        crdt.bulk(vec![put("b", json!({"v": 1}))]).await.unwrap();
        crdt.bulk(vec![DocUpdate::delete("b")]).await.unwrap();

        let head = crdt.compact().await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(crdt.head(), head);
        assert_eq!(crdt.get("a").unwrap().get("v"), Some(&json!(1)));
        assert_eq!(crdt.stats().compactions, 1);
        assert_eq!(crdt.stats().blocks_discarded, 3);

        // The deletion of "b" is carried by the snapshot.
        let all = crdt.changes(&[], &ChangesOptions::default()).await.unwrap();
        let deleted: Vec<&str> = all
            .rows
            .iter()
            .filter(|row| row.value.deleted)
            .map(|row| row.key.as_str())
            .collect();
        assert_eq!(deleted, vec!["b"]);

        // A second compaction with nothing new is a no-op.
        assert_eq!(crdt.compact().await.unwrap(), head);
        assert_eq!(crdt.stats().compactions, 1);

        let err = crdt
            .changes(&since, &ChangesOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, DbError::StaleCursor);
    }

    #[tokio::test]
    async fn test_auto_compaction() {
        let store = Arc::new(MemoryBlockStore::new());
        let crdt = Crdt::new(
            store.clone(),
            CompactionConfig {
                auto_compact: true,
                min_ops_for_compaction: 2,
            },
        );
        crdt.bulk(vec![put("a", json!({}))]).await.unwrap();
        assert_eq!(store.len(), 1);
        let result = crdt.bulk(vec![put("b", json!({}))]).await.unwrap();

        assert_eq!(crdt.stats().compactions, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(result.head, crdt.head());
        assert_eq!(crdt.all_docs().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writes_resolve_by_height_then_cid() {
        let store = Arc::new(MemoryBlockStore::new());
        let left = Crdt::new(store.clone(), CompactionConfig::default());
        let right = Crdt::new(store.clone(), CompactionConfig::default());

        // Left is one write ahead, so its write of "k" sits higher.
        left.bulk(vec![put("other", json!({}))]).await.unwrap();
        left.bulk(vec![put("k", json!({"from": "left"}))]).await.unwrap();
        right.bulk(vec![put("k", json!({"from": "right"}))]).await.unwrap();

        let merged_left = left.merge_heads(right.head()).await.unwrap();
        let merged_right = right.merge_heads(left.head()).await.unwrap();
        assert_eq!(merged_left, merged_right);
        assert_eq!(merged_left.len(), 2);
        assert_eq!(left.get("k").unwrap(), right.get("k").unwrap());
        assert_eq!(left.get("k").unwrap().get("from"), Some(&json!("left")));

        // Equal heights: the greater CID wins on both sides.
        let a = Crdt::new(store.clone(), CompactionConfig::default());
        let b = Crdt::new(store.clone(), CompactionConfig::default());
        a.bulk(vec![put("t", json!({"from": "a"}))]).await.unwrap();
        b.bulk(vec![put("t", json!({"from": "b"}))]).await.unwrap();
        let winner = if a.head()[0] > b.head()[0] { "a" } else { "b" };
        a.merge_heads(b.head()).await.unwrap();
        b.merge_heads(a.head()).await.unwrap();
        assert_eq!(a.get("t").unwrap().get("from"), Some(&json!(winner)));
        assert_eq!(b.get("t").unwrap().get("from"), Some(&json!(winner)));
    }

    #[tokio::test]
    async fn test_local_write_folds_fork() {
        let store = Arc::new(MemoryBlockStore::new());
        let a = Crdt::new(store.clone(), CompactionConfig::default());
        let b = Crdt::new(store.clone(), CompactionConfig::default());
        a.bulk(vec![put("x", json!({}))]).await.unwrap();
        b.bulk(vec![put("y", json!({}))]).await.unwrap();

        a.merge_heads(b.head()).await.unwrap();
        assert!(a.clock().is_forked());
        let result = a.bulk(vec![put("z", json!({}))]).await.unwrap();
        assert_eq!(result.head.len(), 1);
        assert!(!a.clock().is_forked());
        assert_eq!(a.snapshot().height, 2);
        assert_eq!(a.all_docs().rows.len(), 3);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = Arc::new(MemoryBlockStore::new());
        let a = Crdt::new(store.clone(), CompactionConfig::default());
        a.bulk(vec![put("x", json!({}))]).await.unwrap();
        let ticks = Arc::new(Mutex::new(0));
        let t = ticks.clone();
        a.clock().on_tock(move || *t.lock() += 1);

        let head = a.head();
        assert_eq!(a.merge_heads(head.clone()).await.unwrap(), head);
        assert_eq!(*ticks.lock(), 0);
    }

    #[tokio::test]
    async fn test_height_violation_rejected() {
        let store = Arc::new(MemoryBlockStore::new());
        let crdt = Crdt::new(store.clone(), CompactionConfig::default());
        crdt.bulk(vec![put("a", json!({}))]).await.unwrap();

        let dag: DagReader<Batch> = DagReader::new(store.clone());
        let bad = NodeBuilder::delta(vec![put("a", json!({"bad": true}))])
            .with_parents(crdt.head())
            .build();
        let (bad_cid, _) = dag.write(bad).await.unwrap();

        let err = crdt.merge_heads(vec![bad_cid]).await.unwrap_err();
        assert!(matches!(err, DbError::MergeConflictUnresolved(_)));
        assert!(crdt.get("a").unwrap().get("bad").is_none());
    }

    #[tokio::test]
    async fn test_open_rebuilds_state() {
        let (store, crdt) = engine();
        crdt.bulk(vec![put("a", json!({"v": 1}))]).await.unwrap();
        crdt.bulk(vec![put("b", json!({"v": 2})), DocUpdate::delete("a")])
            .await
            .unwrap();

        let reopened = Crdt::open(store, crdt.head(), CompactionConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.head(), crdt.head());
        assert_eq!(reopened.all_docs(), crdt.all_docs());
        assert_eq!(reopened.snapshot().height, 2);
    }

    #[tokio::test]
    async fn test_missing_block_is_fatal() {
        let (_, crdt) = engine();
        let ghost = Cid::digest(b"ghost");
        let err = crdt.merge_heads(vec![ghost]).await.unwrap_err();
        assert_eq!(err, DbError::BlockNotFound(ghost));
    }
}
