//! Integration tests for the Merkle clock substrate.
//!
//! Tests cover:
//! - Bootstrapping a replica by copying blocks and walking from a head
//! - Partition/heal with a multi-head frontier and a merge node
//! - Identical frontiers regardless of the order heads are learned

use cinder_merkle::{
    causal_order, Cid, DagError, DagReader, MemoryBlockStore, MerkleClock, NodeBuilder,
};
use std::sync::Arc;

struct Replica {
    store: Arc<MemoryBlockStore>,
    dag: DagReader<String>,
    clock: MerkleClock<String>,
}

impl Replica {
    fn new() -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        Replica {
            dag: DagReader::new(store.clone()),
            store,
            clock: MerkleClock::new(),
        }
    }

    async fn write(&self, data: &str) -> Cid {
        let head = self.clock.head();
        let height = self.dag.max_height(&head).await.unwrap();
        let node = NodeBuilder::delta(data.to_string())
            .with_parents(head)
            .above_height(height)
            .build();
        let (cid, _) = self.dag.write(node).await.unwrap();
        self.clock.advance(vec![cid], Some(&data.to_string()));
        cid
    }

    async fn learn(&self, other: &Replica) {
        self.store.absorb(&other.store);
        let mut heads = self.clock.head();
        heads.extend(other.clock.head());
        let frontier = self.dag.frontier(&heads).await.unwrap();
        self.clock.advance(frontier, None);
    }
}

#[tokio::test]
async fn test_bootstrap_from_head() {
    let source = Replica::new();
    for i in 1..=5 {
        source.write(&format!("update_{}", i)).await;
    }

    let fresh = Replica::new();
    fresh.learn(&source).await;

    assert_eq!(fresh.clock.head(), source.clock.head());
    let nodes = fresh.dag.collect(&fresh.clock.head()).await.unwrap();
    assert_eq!(nodes.len(), 5);

    let payloads: Vec<String> = causal_order(&nodes)
        .into_iter()
        .map(|(_, node)| node.payload.data().clone())
        .collect();
    assert_eq!(payloads.first().map(String::as_str), Some("update_1"));
    assert_eq!(payloads.last().map(String::as_str), Some("update_5"));
}

#[tokio::test]
async fn test_partition_and_heal() {
    let a = Replica::new();
    let b = Replica::new();

    a.write("shared").await;
    b.learn(&a).await;
    assert_eq!(a.clock.head(), b.clock.head());

    // Partition: both sides write independently.
    let from_a = a.write("from_a").await;
    let from_b = b.write("from_b").await;

    // Heal in both directions.
    a.learn(&b).await;
    b.learn(&a).await;

    let mut expected = vec![from_a, from_b];
    expected.sort();
    assert_eq!(a.clock.head(), expected);
    assert_eq!(b.clock.head(), expected);
    assert!(a.clock.is_forked());

    // A local write folds the fork back into a single head.
    let merge = a.write("merge").await;
    assert_eq!(a.clock.head(), vec![merge]);
    assert_eq!(a.dag.load(&merge).await.unwrap().height, 3);

    b.learn(&a).await;
    assert_eq!(b.clock.head(), vec![merge]);
}

#[tokio::test]
async fn test_learning_order_does_not_matter() {
    let replicas: Vec<Replica> = (0..3).map(|_| Replica::new()).collect();
    for (i, replica) in replicas.iter().enumerate() {
        replica.write(&format!("solo_{}", i)).await;
    }

    let forward = Replica::new();
    for replica in &replicas {
        forward.learn(replica).await;
    }
    let backward = Replica::new();
    for replica in replicas.iter().rev() {
        backward.learn(replica).await;
    }

    assert_eq!(forward.clock.head(), backward.clock.head());
    assert_eq!(forward.clock.head().len(), 3);
}

#[tokio::test]
async fn test_learning_without_blocks_fails() {
    let a = Replica::new();
    let head = a.write("only on a").await;

    let b = Replica::new();
    let err = b.dag.frontier(&[head]).await.unwrap_err();
    assert_eq!(err, DagError::BlockNotFound(head));
}
