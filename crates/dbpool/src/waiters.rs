//! FIFO queue of pending acquisitions.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// A pending acquisition parked until a connection frees up.
///
/// `P` is the handoff payload (the pool sends a full connection guard so an
/// unclaimed handoff finds its way back to the pool).
pub(crate) struct Waiter<P> {
    /// Queue-unique identifier used for cancellation.
    pub(crate) id: u64,
    /// Channel the connection is handed through.
    pub(crate) tx: oneshot::Sender<P>,
    /// When the request entered the queue.
    pub(crate) enqueued_at: Instant,
}

/// Strict FIFO queue of waiters.
///
/// Push and pop-oldest are O(1). Removal by id is a linear scan, taken
/// only on the timeout/cancellation path.
pub(crate) struct WaitQueue<P> {
    entries: VecDeque<Waiter<P>>,
}

impl<P> WaitQueue<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a waiter to the back of the queue.
    pub(crate) fn push(&mut self, waiter: Waiter<P>) {
        self.entries.push_back(waiter);
    }

    /// Pop the longest-waiting entry.
    pub(crate) fn pop_oldest(&mut self) -> Option<Waiter<P>> {
        self.entries.pop_front()
    }

    /// Remove a waiter by id.
    ///
    /// Idempotent: returns `false` when the id is no longer queued, whether
    /// because it was already served or already removed.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|w| w.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop waiters whose receiver has gone away (cancelled callers).
    ///
    /// Returns how many entries were swept.
    pub(crate) fn sweep_closed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|w| !w.tx.is_closed());
        before - self.entries.len()
    }

    /// Take every queued waiter, leaving the queue empty.
    pub(crate) fn take_all(&mut self) -> VecDeque<Waiter<P>> {
        std::mem::take(&mut self.entries)
    }
}

impl<P> Default for WaitQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}
