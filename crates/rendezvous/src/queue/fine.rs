use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{lock, Condvar, Mutex};
use crate::wait::Wait;
use crate::{Error, Result};

// The implementation works as follows:
//
// - The enqueue side owns `tail` (inside `put_lock`) and waits on `not_full`.  The dequeue side owns `head` (inside
//   `take_lock`) and waits on `not_empty`.
// - `count` is the only state both sides touch.  It is only changed with read-modify-write operations, and only after
//   the slot in question has been written (enqueue) or read (dequeue).  Release on those RMWs and acquire on the loads
//   make the slot contents visible to the other side.
// - A slot is written only by the `put_lock` holder while `count < capacity`, so it is a slot no consumer can be
//   reading.  A slot is read only by the `take_lock` holder while `count > 0`, so it is a slot some producer finished
//   writing.
// - While the enqueue side holds `put_lock`, `count` can only go down; while the dequeue side holds `take_lock`, it
//   can only go up.  A waiter which observes its condition unsatisfied after acquiring its lock therefore cannot have
//   missed a notification: whoever changes `count` in its favour takes its lock before notifying.
// - Cross-side signalling happens only on the transitions which could have left the other side blocked: an enqueue
//   which takes `count` from 0 to 1 wakes one consumer, a dequeue which takes `count` from `capacity` down wakes one
//   producer.  To signal, the home lock is released first, then the foreign lock is taken, notified under, and dropped.
//   Both locks are never held at once, so there is no lock ordering to get wrong.
// - Everything else is a same-side cascade: a producer which leaves free space wakes the next producer, and a consumer
//   which leaves items wakes the next consumer.

/// A bounded blocking queue with separate locks for the enqueue and dequeue ends.
///
/// A producer and a consumer only contend on the shared atomic occupancy count, and on each other's lock when the
/// queue goes from empty to non-empty or from full to non-full.  [FineGrainedQueue::size] takes no lock at all.
pub struct FineGrainedQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,

    count: AtomicUsize,

    /// Guards `tail`, the next slot to write.
    put_lock: Mutex<usize>,
    not_full: Condvar,

    /// Guards `head`, the next slot to read.
    take_lock: Mutex<usize>,
    not_empty: Condvar,
}

// Safety: items are moved in by one thread and out by another, so `T: Send` is required and sufficient.  Shared slot
// access is serialized by the locks and the count as described above.
unsafe impl<T: Send> Send for FineGrainedQueue<T> {}
unsafe impl<T: Send> Sync for FineGrainedQueue<T> {}

impl<T> FineGrainedQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: (0..capacity.get())
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            count: AtomicUsize::new(0),
            put_lock: Mutex::new(0),
            not_full: Condvar::new(),
            take_lock: Mutex::new(0),
            not_empty: Condvar::new(),
        }
    }

    /// Fails if `capacity` is 0.
    pub fn try_new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(Error::zero_capacity)?;
        Ok(Self::new(capacity))
    }

    pub fn size(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn enqueue_with<W: Wait>(&self, item: T, waiter: &W) -> Result<(), (W::Error, T)> {
        let capacity = self.capacity();

        let previous = {
            let mut tail = lock(&self.put_lock);
            while self.count.load(Ordering::Acquire) == capacity {
                if let Err(e) = waiter.check() {
                    drop(tail);
                    log::debug!("Gave up waiting for space in a fine-grained queue");
                    return Err((e, item));
                }
                tail = waiter.wait(&self.not_full, tail);
            }

            // Safety: count < capacity and we hold put_lock, so this slot is empty and no one else can touch it.
            unsafe {
                (*self.slots[*tail].get()).write(item);
            }
            *tail = (*tail + 1) % capacity;

            let previous = self.count.fetch_add(1, Ordering::AcqRel);
            if previous + 1 < capacity {
                self.not_full.notify_one();
            }
            previous
        };

        if previous == 0 {
            self.signal_not_empty();
        }

        Ok(())
    }

    pub(crate) fn dequeue_with<W: Wait>(&self, waiter: &W) -> Result<T, W::Error> {
        let capacity = self.capacity();

        let (item, previous) = {
            let mut head = lock(&self.take_lock);
            while self.count.load(Ordering::Acquire) == 0 {
                if let Err(e) = waiter.check() {
                    drop(head);
                    log::debug!("Gave up waiting for an item in a fine-grained queue");
                    return Err(e);
                }
                head = waiter.wait(&self.not_empty, head);
            }

            // Safety: count > 0 and we hold take_lock, so this slot was fully written and is ours to move out of.
            let item = unsafe { (*self.slots[*head].get()).assume_init_read() };
            *head = (*head + 1) % capacity;

            let previous = self.count.fetch_sub(1, Ordering::AcqRel);
            if previous > 1 {
                self.not_empty.notify_one();
            }
            (item, previous)
        };

        if previous == capacity {
            self.signal_not_full();
        }

        Ok(item)
    }

    /// Wake a consumer.  Must not be called with `put_lock` held.
    fn signal_not_empty(&self) {
        let _guard = lock(&self.take_lock);
        self.not_empty.notify_one();
    }

    /// Wake a producer.  Must not be called with `take_lock` held.
    fn signal_not_full(&self) {
        let _guard = lock(&self.put_lock);
        self.not_full.notify_one();
    }
}

super::impl_blocking_queue!(FineGrainedQueue);

impl<T> Drop for FineGrainedQueue<T> {
    fn drop(&mut self) {
        let head = *lock(&self.take_lock);
        let count = self.count.load(Ordering::Acquire);
        let capacity = self.capacity();

        for i in 0..count {
            // Safety: we have exclusive access, and the `count` slots starting at head are initialized.
            unsafe {
                (*self.slots[(head + i) % capacity].get()).assume_init_drop();
            }
        }
    }
}

impl<T> std::fmt::Debug for FineGrainedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineGrainedQueue")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::queue::BlockingQueue;
    use crate::sync::Arc;

    crate::queue::shared_tests::queue_tests!(FineGrainedQueue::new);

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(FineGrainedQueue::<u32>::try_new(0)
            .unwrap_err()
            .is_construction());
    }

    /// A producer and a consumer on opposite ends, with the queue neither full nor empty, both go through the
    /// cross-side signalling paths several times.
    #[test]
    fn test_cross_signalling() {
        crate::sync::wrap_test(|| {
            let queue = Arc::new(FineGrainedQueue::new(NonZeroUsize::new(2).unwrap()));

            let producer = {
                let queue = queue.clone();
                crate::sync::spawn(move || {
                    for i in 0..4u32 {
                        queue.enqueue(i);
                    }
                })
            };

            let consumer = {
                let queue = queue.clone();
                crate::sync::spawn(move || (0..4).map(|_| queue.dequeue()).collect::<Vec<_>>())
            };

            producer.join().unwrap();
            assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3]);
            assert_eq!(queue.size(), 0);
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn remaining_items_are_dropped_with_the_queue() {
        let tracked = std::sync::Arc::new(());

        let queue = FineGrainedQueue::new(NonZeroUsize::new(4).unwrap());
        // Wrap around once so the live items straddle the end of the ring.
        for _ in 0..3 {
            queue.enqueue(tracked.clone());
        }
        drop(queue.dequeue());
        drop(queue.dequeue());
        for _ in 0..3 {
            queue.enqueue(tracked.clone());
        }
        assert_eq!(std::sync::Arc::strong_count(&tracked), 5);

        drop(queue);
        assert_eq!(std::sync::Arc::strong_count(&tracked), 1);
    }

    /// The size never leaves `0..=capacity`, even while both ends run flat out.
    #[cfg(not(loom))]
    #[test]
    fn size_stays_in_bounds_under_contention() {
        use std::sync::atomic::AtomicBool;

        const CAPACITY: usize = 2;
        let queue = Arc::new(FineGrainedQueue::new(NonZeroUsize::new(CAPACITY).unwrap()));
        let done = Arc::new(AtomicBool::new(false));

        let observer = {
            let queue = queue.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    assert!(queue.size() <= CAPACITY);
                }
            })
        };

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    queue.enqueue(i);
                }
            })
        };

        for i in 0..10_000u32 {
            assert_eq!(queue.dequeue(), i);
        }

        producer.join().unwrap();
        done.store(true, Ordering::Relaxed);
        observer.join().unwrap();
    }
}
