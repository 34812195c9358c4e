//! Bounded event queue between the packet handler and the filter update.
//!
//! The producer runs at packet-received priority and only appends a key. The
//! consumer drains everything that has arrived in one short critical section
//! (index update and copy into caller scratch) and does all decoding outside
//! of it.
//!
//! # Overflow
//!
//! The queue refuses to overwrite. A push into a full queue is dropped and
//! counted; drops are expected under load and surface only through the
//! periodic rate report.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default capacity, in event keys.
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// Fixed-capacity ring storage. Only ever touched under the guard.
struct Ring {
    slots: Box<[u32]>,
    head: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn push(&mut self, key: u32) -> bool {
        if self.len == self.capacity() {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity();
        self.slots[tail] = key;
        self.len += 1;
        true
    }

    /// Copy out every stored key in FIFO order and mark the ring empty.
    fn take_all(&mut self, scratch: &mut Vec<u32>) -> usize {
        let n = self.len;
        let first = n.min(self.capacity() - self.head);
        scratch.extend_from_slice(&self.slots[self.head..self.head + first]);
        scratch.extend_from_slice(&self.slots[..n - first]);
        self.head = (self.head + n) % self.capacity().max(1);
        self.len = 0;
        n
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Counters since start-up. Monotonic; rate reporting takes deltas.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Keys offered by the producer
    pub received: u64,
    /// Keys refused because the queue was full
    pub dropped: u64,
    /// Keys handed to the consumer
    pub drained: u64,
}

/// Single-producer / single-consumer event queue.
pub struct EventQueue {
    ring: Mutex<Ring>,
    received: AtomicU64,
    dropped: AtomicU64,
    drained: AtomicU64,
}

impl EventQueue {
    /// Allocate a queue of `capacity` keys. Sized once; never grows.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Append an event key.
    ///
    /// Returns `false` and bumps the drop counter if the queue is full.
    pub fn push(&self, key: u32) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        let accepted = self.ring.lock().push(key);
        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Move every queued key into `scratch`, oldest first. Returns the count.
    ///
    /// `scratch` is appended to, not cleared; callers reuse one buffer.
    pub fn drain_into(&self, scratch: &mut Vec<u32>) -> usize {
        let n = {
            let mut ring = self.ring.lock();
            ring.take_all(scratch)
        };
        self.drained.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Discard queued keys without counting them as drained.
    pub fn clear(&self) {
        self.ring.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
