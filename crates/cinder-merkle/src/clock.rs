//! The Merkle clock: the current head plus its advance events.
//!
//! Every advance emits, in order:
//! 1. a *tick* carrying the changes just applied (only when there are some)
//! 2. a *tock* with no payload
//!
//! Listeners run synchronously inside [`MerkleClock::advance`], so they must
//! be quick; anything slow belongs behind a channel. A panicking listener is
//! logged and skipped.

use crate::hash::{normalize_head, ClockHead};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Handle returned when registering a clock listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type TickFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
type TockFn = Arc<dyn Fn() + Send + Sync>;

pub struct MerkleClock<T> {
    head: RwLock<ClockHead>,
    ticks: RwLock<Vec<(ListenerId, TickFn<T>)>>,
    tocks: RwLock<Vec<(ListenerId, TockFn)>>,
    next_id: AtomicU64,
}

impl<T> Default for MerkleClock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MerkleClock<T> {
    /// A clock at the empty head.
    pub fn new() -> Self {
        Self::at(ClockHead::new())
    }

    pub fn at(mut head: ClockHead) -> Self {
        normalize_head(&mut head);
        MerkleClock {
            head: RwLock::new(head),
            ticks: RwLock::new(Vec::new()),
            tocks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn head(&self) -> ClockHead {
        self.head.read().clone()
    }

    /// More than one head means concurrent history awaiting a merge.
    pub fn is_forked(&self) -> bool {
        self.head.read().len() > 1
    }

    pub fn on_tick(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.ticks.write().push((id, Arc::new(listener)));
        id
    }

    pub fn on_tock(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.tocks.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a tick or tock listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut ticks = self.ticks.write();
        let before = ticks.len();
        ticks.retain(|(lid, _)| *lid != id);
        if ticks.len() != before {
            return true;
        }
        drop(ticks);

        let mut tocks = self.tocks.write();
        let before = tocks.len();
        tocks.retain(|(lid, _)| *lid != id);
        tocks.len() != before
    }

    pub fn tick_listeners(&self) -> usize {
        self.ticks.read().len()
    }

    /// Move to `head`, then emit a tick (if `changes` is given) and a tock.
    pub fn advance(&self, mut head: ClockHead, changes: Option<&T>) {
        normalize_head(&mut head);
        trace!(heads = head.len(), "clock advance");
        *self.head.write() = head;

        if let Some(changes) = changes {
            // Clone the table so listeners may (un)register from inside a callback.
            let ticks: Vec<_> = self.ticks.read().iter().map(|(_, f)| f.clone()).collect();
            for listener in ticks {
                if catch_unwind(AssertUnwindSafe(|| listener(changes))).is_err() {
                    error!("tick listener panicked");
                }
            }
        }

        let tocks: Vec<_> = self.tocks.read().iter().map(|(_, f)| f.clone()).collect();
        for listener in tocks {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!("tock listener panicked");
            }
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
