//! Single-writer mutation queue.
//!
//! All mutations funnel through one worker task, so at most one batch write
//! is in flight at any time. Updates pushed while a write is in flight wait
//! in the channel and are taken together as the next batch. Every caller in
//! a batch receives the same outcome, success or failure.

use crate::crdt::BulkResult;
use crate::document::DocUpdate;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Configuration for write batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum updates taken into one batch.
    pub max_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_batch_size: 1000,
        }
    }
}

/// The engine a queue drains into.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    async fn write_batch(&self, updates: Vec<DocUpdate>) -> Result<BulkResult>;
}

/// An update waiting for its batch.
struct PendingWrite {
    update: DocUpdate,
    result_tx: oneshot::Sender<Result<BulkResult>>,
}

pub struct WriteQueue {
    tx: mpsc::UnboundedSender<PendingWrite>,
    batches: Arc<AtomicU64>,
}

impl WriteQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn new(writer: Arc<dyn BatchWriter>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let batches = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_worker(writer, rx, config, batches.clone()));
        WriteQueue { tx, batches }
    }

    /// Enqueue an update and wait for the batch it lands in.
    ///
    /// The update is enqueued before this returns; dropping the future only
    /// abandons the result, the batch still completes.
    pub fn push(&self, update: DocUpdate) -> impl Future<Output = Result<BulkResult>> + Send {
        let (result_tx, result_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(PendingWrite { update, result_tx })
            .map_err(|_| DbError::QueueClosed);

        async move {
            sent?;
            result_rx.await.map_err(|_| DbError::QueueClosed)?
        }
    }

    /// Batches handed to the writer so far.
    pub fn batches_written(&self) -> u64 {
        self.batches.load(Ordering::Acquire)
    }
}

async fn run_worker(
    writer: Arc<dyn BatchWriter>,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    config: QueueConfig,
    batches: Arc<AtomicU64>,
) {
    let max = config.max_batch_size.max(1);

    while let Some(first) = rx.recv().await {
        let mut pending = vec![first];
        while pending.len() < max {
            match rx.try_recv() {
                Ok(next) => pending.push(next),
                Err(_) => break,
            }
        }

        let updates: Vec<DocUpdate> = pending.iter().map(|p| p.update.clone()).collect();
        let outcome = AssertUnwindSafe(writer.write_batch(updates))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DbError::Internal("batch writer panicked".to_string())));
        batches.fetch_add(1, Ordering::AcqRel);

        match &outcome {
            Ok(result) => debug!(callers = pending.len(), heads = result.head.len(), "batch done"),
            Err(e) => warn!(callers = pending.len(), error = %e, "batch failed"),
        }
        for write in pending {
            // The caller may have stopped waiting.
            let _ = write.result_tx.send(outcome.clone());
        }
    }

    debug!("write queue closed");
}
