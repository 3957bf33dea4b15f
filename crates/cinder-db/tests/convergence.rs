//! Property-based convergence tests.
//!
//! Independent replicas write, delete and compact concurrently and exchange
//! heads in random orders. Once every replica has seen every node, all of
//! them must hold the same head and resolve every key to the same value.

use cinder_db::{ClockHead, Database, DatabaseConfig, Document, MemoryBlockStore};
use proptest::prelude::*;
use serde_json::Value;
use std::sync::Arc;

const REPLICAS: usize = 3;
const KEYS: usize = 4;

/// A replica's head and its live documents.
type State = (ClockHead, Vec<(String, Value)>);

#[derive(Clone, Debug)]
enum Op {
    Put { replica: usize, key: usize, value: i64 },
    Delete { replica: usize, key: usize },
    Sync { from: usize, to: usize },
    Compact { replica: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..REPLICAS, 0..KEYS, -50i64..50)
            .prop_map(|(replica, key, value)| Op::Put { replica, key, value }),
        1 => (0..REPLICAS, 0..KEYS).prop_map(|(replica, key)| Op::Delete { replica, key }),
        2 => (0..REPLICAS, 0..REPLICAS).prop_map(|(from, to)| Op::Sync { from, to }),
        1 => (0..REPLICAS).prop_map(|replica| Op::Compact { replica }),
    ]
}

struct Replica {
    store: Arc<MemoryBlockStore>,
    db: Database,
}

impl Replica {
    fn new(name: String) -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        Replica {
            db: Database::new(name, store.clone(), DatabaseConfig::default()),
            store,
        }
    }
}

async fn sync(from: &Replica, to: &Replica) {
    to.store.absorb(&from.store);
    to.db.merge(from.db.head()).await.unwrap();
}

/// Run `ops`, then exchange everything, visiting peers in `order`.
fn run(ops: &[Op], order: &[usize]) -> Vec<State> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let replicas: Vec<Replica> = (0..REPLICAS)
            .map(|i| Replica::new(format!("replica-{}", i)))
            .collect();

        for op in ops {
            match op {
                Op::Put { replica, key, value } => {
                    let doc = Document::with_id(format!("k{}", key)).set("v", *value);
                    replicas[*replica].db.put(doc).await.unwrap();
                }
                Op::Delete { replica, key } => {
                    replicas[*replica].db.del(&format!("k{}", key)).await.unwrap();
                }
                Op::Sync { from, to } if from != to => {
                    sync(&replicas[*from], &replicas[*to]).await;
                }
                Op::Sync { .. } => {}
                Op::Compact { replica } => {
                    replicas[*replica].db.compact().await.unwrap();
                }
            }
        }

        // One round reaches every node; the second must change nothing.
        for _ in 0..2 {
            for &to in order {
                for from in 0..REPLICAS {
                    if from != to {
                        sync(&replicas[from], &replicas[to]).await;
                    }
                }
            }
        }

        let mut states = Vec::new();
        for replica in &replicas {
            let docs = replica
                .db
                .all_docs()
                .await
                .unwrap()
                .rows
                .into_iter()
                .map(|row| (row.key, row.value.to_value()))
                .collect();
            states.push((replica.db.head(), docs));
        }
        states
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge(
        ops in prop::collection::vec(op_strategy(), 0..40),
        order in Just((0..REPLICAS).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let states = run(&ops, &order);
        for state in &states[1..] {
            prop_assert_eq!(state, &states[0]);
        }
    }

    #[test]
    fn exchange_order_does_not_matter(
        ops in prop::collection::vec(op_strategy(), 0..30),
    ) {
        let forward = run(&ops, &[0, 1, 2]);
        let backward = run(&ops, &[2, 1, 0]);
        prop_assert_eq!(&forward[0], &backward[0]);
    }
}

#[test]
fn merge_is_idempotent() {
    let ops = vec![
        Op::Put { replica: 0, key: 0, value: 1 },
        Op::Put { replica: 1, key: 0, value: 2 },
        Op::Delete { replica: 2, key: 0 },
        Op::Put { replica: 2, key: 1, value: 3 },
    ];
    let once = run(&ops, &[0, 1, 2]);
    let mut twice = ops.clone();
    twice.push(Op::Sync { from: 0, to: 1 });
    twice.push(Op::Sync { from: 0, to: 1 });
    assert_eq!(run(&twice, &[0, 1, 2])[2], once[2]);
}

#[test]
fn compacted_delete_is_not_resurrected() {
    let ops = vec![
        Op::Put { replica: 0, key: 0, value: 1 },
        Op::Sync { from: 0, to: 1 },
        Op::Delete { replica: 0, key: 0 },
        Op::Compact { replica: 0 },
        Op::Put { replica: 1, key: 1, value: 2 },
    ];
    for state in run(&ops, &[1, 0, 2]) {
        let keys: Vec<&str> = state.1.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["k1"]);
    }
}
