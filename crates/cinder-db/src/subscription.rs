//! Change listeners.
//!
//! Each listener owns an unbounded queue and a delivery task. Clock events
//! are enqueued for every listener, in registration order, at the moment the
//! clock advances; each task then delivers its queue in order. A slow
//! listener falls behind without delaying anyone else, and a failing one is
//! logged and keeps receiving later events.

use crate::crdt::Changes;
use crate::document::Document;
use crate::error::DbError;
use cinder_merkle::{ListenerId, MerkleClock};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Error type listener callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type UpdateFn = Arc<dyn Fn(Arc<Vec<Document>>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type QuietFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// A change callback.
#[derive(Clone)]
pub enum Listener {
    /// Receives the resolved documents of every batch.
    Update(UpdateFn),
    /// Told only that the clock advanced.
    Quiet(QuietFn),
}

impl Listener {
    pub fn update<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Vec<Document>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Listener::Update(Arc::new(move |docs| f(docs).boxed()))
    }

    pub fn quiet<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Listener::Quiet(Arc::new(move || f().boxed()))
    }

    pub fn wants_payload(&self) -> bool {
        matches!(self, Listener::Update(_))
    }
}

enum Event {
    Update(Arc<Vec<Document>>),
    Quiet,
}

struct Slot {
    id: u64,
    wants_payload: bool,
    tx: mpsc::UnboundedSender<Event>,
}

type Slots = Arc<RwLock<Vec<Slot>>>;

/// Fans clock events out to listeners.
pub struct SubscriberHub {
    clock: Arc<MerkleClock<Changes>>,
    slots: Slots,
    /// Installed while at least one payload listener exists.
    tick_hook: Mutex<Option<ListenerId>>,
    tock_hook: ListenerId,
    next_id: AtomicU64,
}

impl SubscriberHub {
    pub fn new(clock: Arc<MerkleClock<Changes>>) -> Arc<Self> {
        let slots: Slots = Arc::new(RwLock::new(Vec::new()));
        let tock_slots = slots.clone();
        let tock_hook = clock.on_tock(move || {
            for slot in tock_slots.read().iter().filter(|s| !s.wants_payload) {
                let _ = slot.tx.send(Event::Quiet);
            }
        });

        Arc::new(SubscriberHub {
            clock,
            slots,
            tick_hook: Mutex::new(None),
            tock_hook,
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a listener. Must be called inside a tokio runtime.
    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wants_payload = listener.wants_payload();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(deliver(id, listener, rx));
        self.slots.write().push(Slot {
            id,
            wants_payload,
            tx,
        });
        if wants_payload {
            self.ensure_tick_hook();
        }
        debug!(listener = id, wants_payload, "listener registered");

        Subscription {
            id,
            hub: self.clone(),
        }
    }

    pub fn listeners(&self) -> usize {
        self.slots.read().len()
    }

    fn ensure_tick_hook(&self) {
        let mut hook = self.tick_hook.lock();
        if hook.is_some() {
            return;
        }
        let slots = self.slots.clone();
        *hook = Some(self.clock.on_tick(move |changes: &Changes| {
            let docs = Arc::new(changes.clone());
            for slot in slots.read().iter().filter(|s| s.wants_payload) {
                let _ = slot.tx.send(Event::Update(docs.clone()));
            }
        }));
    }

    fn remove(&self, id: u64) -> bool {
        let mut slots = self.slots.write();
        let before = slots.len();
        // Dropping the sender lets the delivery task drain and exit.
        slots.retain(|s| s.id != id);
        let removed = slots.len() != before;
        let payload_left = slots.iter().any(|s| s.wants_payload);
        drop(slots);

        if !payload_left {
            if let Some(hook) = self.tick_hook.lock().take() {
                self.clock.off(hook);
            }
        }
        removed
    }
}

impl Drop for SubscriberHub {
    fn drop(&mut self) {
        if let Some(hook) = self.tick_hook.lock().take() {
            self.clock.off(hook);
        }
        self.clock.off(self.tock_hook);
    }
}

async fn deliver(id: u64, listener: Listener, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let call = match (&listener, event) {
            (Listener::Update(f), Event::Update(docs)) => {
                let f = f.clone();
                async move { f(docs).await }.boxed()
            }
            (Listener::Quiet(f), Event::Quiet) => {
                let f = f.clone();
                async move { f().await }.boxed()
            }
            _ => continue,
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = DbError::ListenerError(e.to_string());
                warn!(listener = id, error = %err, "listener failed");
            }
            Err(_) => {
                let err = DbError::ListenerError("panicked".to_string());
                warn!(listener = id, error = %err, "listener failed");
            }
        }
    }
    debug!(listener = id, "listener stopped");
}

/// Handle returned by `subscribe`. Dropping it keeps the listener.
pub struct Subscription {
    id: u64,
    hub: Arc<SubscriberHub>,
}

impl Subscription {
    /// Stop delivery. Events already queued are still delivered.
    pub fn unsubscribe(self) -> bool {
        self.hub.remove(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_merkle::Cid;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn hub() -> (Arc<MerkleClock<Changes>>, Arc<SubscriberHub>) {
        let clock = Arc::new(MerkleClock::new());
        let hub = SubscriberHub::new(clock.clone());
        (clock, hub)
    }

    fn recorder() -> (Listener, UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::update(move |docs: Arc<Vec<Document>>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(docs.iter().map(|d| d.id.clone()).collect());
                Ok(())
            }
        });
        (listener, rx)
    }

    fn advance(clock: &MerkleClock<Changes>, ids: &[&str]) {
        let docs: Changes = ids.iter().map(|id| Document::with_id(*id)).collect();
        clock.advance(vec![Cid::digest(ids.concat().as_bytes())], Some(&docs));
    }

    #[tokio::test]
    async fn test_tick_hook_installed_lazily() {
        let (clock, hub) = hub();
        assert_eq!(clock.tick_listeners(), 0);

        let quiet = hub.subscribe(Listener::quiet(|| async { Ok(()) }));
        assert_eq!(clock.tick_listeners(), 0);

        let (listener, _rx) = recorder();
        let first = hub.subscribe(listener.clone());
        let second = hub.subscribe(listener);
        assert_eq!(clock.tick_listeners(), 1);

        assert!(first.unsubscribe());
        assert_eq!(clock.tick_listeners(), 1);
        assert!(second.unsubscribe());
        assert_eq!(clock.tick_listeners(), 0);
        assert!(quiet.unsubscribe());
        assert_eq!(hub.listeners(), 0);
    }

    #[tokio::test]
    async fn test_update_delivery_in_order() {
        let (clock, hub) = hub();
        let (listener, mut rx) = recorder();
        let _sub = hub.subscribe(listener);

        advance(&clock, &["a"]);
        advance(&clock, &["b", "c"]);
        clock.advance(clock.head(), None);

        assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
        assert_eq!(rx.recv().await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_quiet_listener_sees_every_advance() {
        let (clock, hub) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub.subscribe(Listener::quiet(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        }));

        advance(&clock, &["a"]);
        clock.advance(clock.head(), None);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let (clock, hub) = hub();
        let _failing = hub.subscribe(Listener::update(|_| async {
            Err::<(), BoxError>("nope".into())
        }));
        let _panicking = hub.subscribe(Listener::update(
            |_: Arc<Vec<Document>>| -> futures::future::Ready<Result<(), BoxError>> {
                panic!("listener bug")
            },
        ));
        let (listener, mut rx) = recorder();
        let _sub = hub.subscribe(listener);

        advance(&clock, &["a"]);
        advance(&clock, &["b"]);
        assert_eq!(rx.recv().await.unwrap(), vec!["a"]);
        assert_eq!(rx.recv().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_delay_fast_one() {
        let (clock, hub) = hub();
        let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
        let _slow = hub.subscribe(Listener::update(move |docs: Arc<Vec<Document>>| {
            let tx = slow_tx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                let _ = tx.send(docs.len());
                Ok(())
            }
        }));
        let (listener, mut rx) = recorder();
        let _fast = hub.subscribe(listener);

        advance(&clock, &["a"]);
        let fast = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(fast.unwrap().unwrap(), vec!["a"]);
        assert!(slow_rx.try_recv().is_err());
    }
}
