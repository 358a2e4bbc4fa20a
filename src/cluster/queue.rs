//! Per-peer replication primitives: an ordered, acknowledged outbound event
//! queue and a receive-side duplicate filter.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::protocol::EventPayload;

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: u64,
    pub payload: EventPayload,
}

/// Ordered, monotonically-id-stamped outbound event queue for one peer
/// connection. Entries are removed only once the peer acknowledges them,
/// so they survive a reconnect and can be resent from whatever id the
/// peer's resume handshake asks for.
pub struct ReplicationQueue {
    entries: Mutex<VecDeque<QueuedEvent>>,
    next_id: AtomicU64,
    notify: Notify,
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Assign the next monotonic id and append the event.
    pub fn enqueue(&self, payload: EventPayload) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push_back(QueuedEvent { id, payload });
        self.notify.notify_one();
        id
    }

    /// Drop every entry with id <= acked_id.
    pub fn ack_through(&self, acked_id: u64) {
        let mut entries = self.entries.lock();
        while matches!(entries.front(), Some(e) if e.id <= acked_id) {
            entries.pop_front();
        }
    }

    /// Forget all queued entries and restart id numbering at 0, used when
    /// the peer reports it has no record of our session.
    pub fn restart(&self) {
        self.entries.lock().clear();
        self.next_id.store(0, Ordering::SeqCst);
    }

    /// First still-queued entry with id >= cursor, if any.
    pub fn peek_from(&self, cursor: u64) -> Option<QueuedEvent> {
        self.entries.lock().iter().find(|e| e.id >= cursor).cloned()
    }

    /// Resolves once an entry has been pushed since the last call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for ReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity set of recently-seen event ids with insertion-order
/// eviction. Used on the receiving side of a peer connection to drop
/// events that were re-sent after a reconnect but already applied.
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`, returning true if it had not been seen before.
    pub fn insert(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
