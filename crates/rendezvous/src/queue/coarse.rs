use std::num::NonZeroUsize;

use crate::sync::{lock, Condvar, Mutex};
use crate::wait::Wait;
use crate::{Error, Result};

/// A fixed-size ring buffer.  Not synchronized; the queue wraps it in a mutex.
struct Ring<T> {
    slots: Box<[Option<T>]>,

    /// Next slot to read.
    head: usize,

    /// Next slot to write.
    tail: usize,

    count: usize,
}

impl<T> Ring<T> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: (0..capacity.get()).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        let old = self.slots[self.tail].replace(item);
        debug_assert!(old.is_none());
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
    }

    fn pop(&mut self) -> Option<T> {
        let item = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        Some(item)
    }
}

/// A bounded blocking queue guarded by a single lock.
///
/// Every operation, including [CoarseGrainedQueue::size], holds the one lock for its whole duration.  Blocked producers
/// wait on `not_full`, which each dequeue signals; blocked consumers wait on `not_empty`, which each enqueue signals.
pub struct CoarseGrainedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: NonZeroUsize,
}

impl<T> CoarseGrainedQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Fails if `capacity` is 0.
    pub fn try_new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(Error::zero_capacity)?;
        Ok(Self::new(capacity))
    }

    pub fn size(&self) -> usize {
        lock(&self.ring).count
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub(crate) fn enqueue_with<W: Wait>(&self, item: T, waiter: &W) -> Result<(), (W::Error, T)> {
        let mut ring = lock(&self.ring);
        while ring.is_full() {
            if let Err(e) = waiter.check() {
                drop(ring);
                log::debug!("Gave up waiting for space in a coarse-grained queue");
                return Err((e, item));
            }
            ring = waiter.wait(&self.not_full, ring);
        }

        ring.push(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub(crate) fn dequeue_with<W: Wait>(&self, waiter: &W) -> Result<T, W::Error> {
        let mut ring = lock(&self.ring);
        loop {
            if let Some(item) = ring.pop() {
                self.not_full.notify_one();
                return Ok(item);
            }

            debug_assert!(ring.is_empty());
            if let Err(e) = waiter.check() {
                drop(ring);
                log::debug!("Gave up waiting for an item in a coarse-grained queue");
                return Err(e);
            }
            ring = waiter.wait(&self.not_empty, ring);
        }
    }
}

super::impl_blocking_queue!(CoarseGrainedQueue);

impl<T> std::fmt::Debug for CoarseGrainedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoarseGrainedQueue")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}
