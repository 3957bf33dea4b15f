//! Reading and writing DAG nodes through a block store.
//!
//! Decoded nodes are immutable, so the reader keeps them in a cache shared
//! by every walk. After compaction the cache is cleared along with the
//! discarded blocks.

use crate::error::DagError;
use crate::hash::{normalize_head, Cid, ClockHead};
use crate::node::MerkleNode;
use crate::store::BlockStore;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Nodes reachable from some head set, keyed by CID.
pub type NodeSet<T> = HashMap<Cid, Arc<MerkleNode<T>>>;

pub struct DagReader<T> {
    blocks: Arc<dyn BlockStore>,
    cache: RwLock<HashMap<Cid, Arc<MerkleNode<T>>>>,
}

impl<T> DagReader<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(blocks: Arc<dyn BlockStore>) -> Self {
        DagReader {
            blocks,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    /// Encode and persist a node, returning its CID.
    pub async fn write(&self, node: MerkleNode<T>) -> Result<(Cid, Arc<MerkleNode<T>>), DagError> {
        let block = node.encode()?;
        let stored = self.blocks.put(block.bytes).await?;
        if stored != block.cid {
            return Err(DagError::Storage(format!(
                "block store filed {} under {}",
                block.cid.short(),
                stored.short()
            )));
        }
        let node = Arc::new(node);
        self.cache.write().insert(stored, node.clone());
        Ok((stored, node))
    }

    /// Load a node, from cache if possible.
    pub async fn load(&self, cid: &Cid) -> Result<Arc<MerkleNode<T>>, DagError> {
        if let Some(node) = self.cache.read().get(cid) {
            return Ok(node.clone());
        }
        let bytes = self.blocks.get(cid).await?;
        let node = Arc::new(MerkleNode::decode(cid, &bytes)?);
        self.cache.write().insert(*cid, node.clone());
        Ok(node)
    }

    /// Every node reachable from `heads`, heads included.
    pub async fn collect(&self, heads: &[Cid]) -> Result<NodeSet<T>, DagError> {
        let mut nodes = HashMap::new();
        let mut queue: VecDeque<Cid> = heads.iter().copied().collect();

        while let Some(cid) = queue.pop_front() {
            if nodes.contains_key(&cid) {
                continue;
            }
            let node = self.load(&cid).await?;
            queue.extend(node.parents.iter().copied());
            nodes.insert(cid, node);
        }

        Ok(nodes)
    }

    /// CIDs reachable from `heads`, heads included.
    pub async fn reachable(&self, heads: &[Cid]) -> Result<HashSet<Cid>, DagError> {
        Ok(self.collect(heads).await?.into_keys().collect())
    }

    /// Strict ancestors of the head set.
    pub async fn ancestors(&self, heads: &[Cid]) -> Result<HashSet<Cid>, DagError> {
        let mut parents = Vec::new();
        for head in heads {
            parents.extend(self.load(head).await?.parents.iter().copied());
        }
        self.reachable(&parents).await
    }

    /// Reduce a head set to its frontier: drop any head that is an ancestor
    /// of another head.
    pub async fn frontier(&self, heads: &[Cid]) -> Result<ClockHead, DagError> {
        let ancestors = self.ancestors(heads).await?;
        let mut frontier: ClockHead = heads
            .iter()
            .filter(|cid| !ancestors.contains(cid))
            .copied()
            .collect();
        normalize_head(&mut frontier);
        Ok(frontier)
    }

    /// Nodes reachable from `heads` but not from `since`.
    ///
    /// Walks down from both sides by descending height and stops as soon as
    /// no open branch can still lead to such a node, so the cost follows the
    /// size of the delta rather than the whole history. Returns `None` when
    /// some CID of `since` is not in the history of `heads`.
    pub async fn delta(
        &self,
        heads: &[Cid],
        since: &[Cid],
    ) -> Result<Option<NodeSet<T>>, DagError> {
        let mut walk = Walk::default();
        for cid in since {
            match self.load(cid).await {
                Ok(node) => walk.visit(*cid, node, false, true),
                Err(DagError::BlockNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        for cid in heads {
            let node = self.load(cid).await?;
            walk.visit(*cid, node, true, false);
        }

        let mut unseen: HashSet<Cid> = since.iter().copied().collect();
        let mut delta = HashMap::new();
        while !unseen.is_empty() || walk.has_new() {
            let Some((cid, visit)) = walk.pop() else {
                break;
            };
            if unseen.remove(&cid) && !visit.reached {
                return Ok(None);
            }
            for parent in &visit.node.parents {
                if walk.mark(parent, visit.reached, visit.known) {
                    continue;
                }
                let node = self.load(parent).await?;
                walk.visit(*parent, node, visit.reached, visit.known);
            }
            if visit.reached && !visit.known {
                delta.insert(cid, visit.node);
            }
        }

        if !unseen.is_empty() {
            return Ok(None);
        }
        Ok(Some(delta))
    }

    /// Highest height among `heads` (0 for the empty head).
    pub async fn max_height(&self, heads: &[Cid]) -> Result<u64, DagError> {
        let mut max = 0;
        for head in heads {
            max = max.max(self.load(head).await?.height);
        }
        Ok(max)
    }

    /// Forget every cached node.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.write();
        debug!(evicted = cache.len(), "cleared dag cache");
        cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

struct Visit<T> {
    node: Arc<MerkleNode<T>>,
    /// Reachable from the heads being read.
    reached: bool,
    /// Reachable from the cursor.
    known: bool,
}

/// Pending nodes of a [`DagReader::delta`] walk, highest first.
struct Walk<T> {
    queue: BinaryHeap<(u64, Cid)>,
    pending: HashMap<Cid, Visit<T>>,
    done: HashSet<Cid>,
}

impl<T> Default for Walk<T> {
    fn default() -> Self {
        Walk {
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
            done: HashSet::new(),
        }
    }
}

impl<T> Walk<T> {
    /// Merge flags into a node already seen. False if the node is new.
    fn mark(&mut self, cid: &Cid, reached: bool, known: bool) -> bool {
        if self.done.contains(cid) {
            return true;
        }
        match self.pending.get_mut(cid) {
            Some(visit) => {
                visit.reached |= reached;
                visit.known |= known;
                true
            }
            None => false,
        }
    }

    fn visit(&mut self, cid: Cid, node: Arc<MerkleNode<T>>, reached: bool, known: bool) {
        if self.mark(&cid, reached, known) {
            return;
        }
        self.queue.push((node.height, cid));
        self.pending.insert(
            cid,
            Visit {
                node,
                reached,
                known,
            },
        );
    }

    fn pop(&mut self) -> Option<(Cid, Visit<T>)> {
        while let Some((_, cid)) = self.queue.pop() {
            if let Some(visit) = self.pending.remove(&cid) {
                self.done.insert(cid);
                return Some((cid, visit));
            }
        }
        None
    }

    /// Whether some pending node is reachable from the heads only.
    fn has_new(&self) -> bool {
        self.pending
            .values()
            .any(|visit| visit.reached && !visit.known)
    }
}

/// Nodes in causal order: ascending height, then CID.
///
/// Heights strictly increase along parent edges, so every parent precedes
/// its children.
pub fn causal_order<T>(nodes: &NodeSet<T>) -> Vec<(Cid, Arc<MerkleNode<T>>)> {
    let mut ordered: Vec<_> = nodes.iter().map(|(cid, node)| (*cid, node.clone())).collect();
    ordered.sort_by(|(a_cid, a), (b_cid, b)| a.height.cmp(&b.height).then(a_cid.cmp(b_cid)));
    ordered
}

/// Check that each node sits strictly above each of its parents.
pub fn check_heights<T>(nodes: &NodeSet<T>) -> Result<(), DagError> {
    for (cid, node) in nodes {
        for parent in &node.parents {
            if let Some(parent_node) = nodes.get(parent) {
                if node.height <= parent_node.height {
                    return Err(DagError::HeightViolation {
                        cid: *cid,
                        height: node.height,
                        parent_height: parent_node.height,
                    });
                }
            }
        }
    }
    Ok(())
}
