//! Live queries: index results republished on every clock advance.

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::index::{Index, IndexResponse, QueryOptions};
use crate::subscription::{Listener, SubscriberHub, Subscription};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

pub struct LiveQuery {
    index: Arc<Index>,
    rx: watch::Receiver<Arc<IndexResponse>>,
    subscription: Option<Subscription>,
}

impl LiveQuery {
    pub(crate) async fn start(index: Arc<Index>, opts: QueryOptions, hub: &Arc<SubscriberHub>) -> Self {
        let (tx, rx) = watch::channel(Arc::new(IndexResponse::default()));
        let tx = Arc::new(tx);

        // Subscribe before the first query so no advance slips between them.
        let weak = Arc::downgrade(&index);
        let listener_tx = tx.clone();
        let listener_opts = opts.clone();
        let subscription = hub.subscribe(Listener::quiet(move || {
            let index = weak.upgrade();
            let tx = listener_tx.clone();
            let opts = listener_opts.clone();
            async move {
                if let Some(index) = index {
                    publish(&tx, index.query(&opts).await);
                }
                Ok(())
            }
        }));

        publish(&tx, index.query(&opts).await);
        LiveQuery {
            index,
            rx,
            subscription: Some(subscription),
        }
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    /// The latest published rows.
    pub fn current(&self) -> Arc<IndexResponse> {
        self.rx.borrow().clone()
    }

    /// Documents of the latest rows, in row order.
    pub fn docs(&self) -> Vec<Document> {
        self.current().rows.iter().map(|row| row.value.clone()).collect()
    }

    /// Wait until the rows change.
    pub async fn changed(&mut self) -> Result<Arc<IndexResponse>> {
        self.rx
            .changed()
            .await
            .map_err(|_| DbError::Internal("live query closed".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Stop following the database.
    pub fn close(mut self) -> bool {
        self.subscription.take().map_or(false, Subscription::unsubscribe)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

fn publish(tx: &watch::Sender<Arc<IndexResponse>>, rows: IndexResponse) {
    tx.send_if_modified(|current| {
        if current.rows == rows.rows && current.clock == rows.clock {
            return false;
        }
        trace!(rows = rows.rows.len(), "live query updated");
        *current = Arc::new(rows);
        true
    });
}
