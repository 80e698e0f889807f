//! Bounded blocking FIFO queues.
//!
//! Two implementations of [BlockingQueue] are provided, differing only in how they lock:
//!
//! - [CoarseGrainedQueue] guards the whole ring buffer with one mutex.  At most one enqueue or dequeue makes progress at
//!   a time.
//! - [FineGrainedQueue] has one lock for the enqueue end and one for the dequeue end, with the occupancy count shared
//!   through an atomic.  A producer and a consumer can proceed at the same time whenever the queue is neither empty nor
//!   full.
//!
//! Both are fixed-capacity rings: `enqueue` blocks while full and `dequeue` blocks while empty.  Neither guarantees any
//! fairness among blocked threads beyond what the platform's condition variables provide.
#[cfg(not(loom))]
use std::time::Duration;

#[cfg(not(loom))]
use crate::{CancelToken, EnqueueError, Result};

mod coarse;
mod fine;

pub use coarse::CoarseGrainedQueue;
pub use fine::FineGrainedQueue;

/// A fixed-capacity, thread-safe FIFO queue whose operations block on full and empty.
pub trait BlockingQueue<T>: Send + Sync {
    /// Append `item`, blocking while the queue is full.
    fn enqueue(&self, item: T);

    /// Remove the oldest item, blocking while the queue is empty.
    fn dequeue(&self) -> T;

    /// Number of items currently in the queue.
    ///
    /// Concurrent operations may change this as soon as it is returned.
    fn size(&self) -> usize;

    fn capacity(&self) -> usize;

    #[cfg(not(loom))]
    fn enqueue_cancellable(&self, item: T, token: &CancelToken) -> Result<(), EnqueueError<T>>;

    #[cfg(not(loom))]
    fn dequeue_cancellable(&self, token: &CancelToken) -> Result<T>;

    #[cfg(not(loom))]
    fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), EnqueueError<T>>;

    #[cfg(not(loom))]
    fn dequeue_timeout(&self, timeout: Duration) -> Result<T>;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }
}

/// Both queues implement the trait the same way on top of their `enqueue_with`/`dequeue_with`.
macro_rules! impl_blocking_queue {
    ($queue: ident) => {
        impl<T: Send> $crate::queue::BlockingQueue<T> for $queue<T> {
            fn enqueue(&self, item: T) {
                $crate::wait::never_fails(
                    self.enqueue_with(item, &$crate::wait::Forever)
                        .map_err(|(never, _)| never),
                )
            }

            fn dequeue(&self) -> T {
                $crate::wait::never_fails(self.dequeue_with(&$crate::wait::Forever))
            }

            fn size(&self) -> usize {
                $queue::size(self)
            }

            fn capacity(&self) -> usize {
                $queue::capacity(self)
            }

            #[cfg(not(loom))]
            fn enqueue_cancellable(
                &self,
                item: T,
                token: &$crate::CancelToken,
            ) -> $crate::Result<(), $crate::EnqueueError<T>> {
                self.enqueue_with(item, &$crate::wait::Interruptible::cancellable(token))
                    .map_err(|(e, item)| $crate::EnqueueError::new(e, item))
            }

            #[cfg(not(loom))]
            fn dequeue_cancellable(&self, token: &$crate::CancelToken) -> $crate::Result<T> {
                self.dequeue_with(&$crate::wait::Interruptible::cancellable(token))
            }

            #[cfg(not(loom))]
            fn enqueue_timeout(
                &self,
                item: T,
                timeout: std::time::Duration,
            ) -> $crate::Result<(), $crate::EnqueueError<T>> {
                self.enqueue_with(item, &$crate::wait::Interruptible::timeout(timeout))
                    .map_err(|(e, item)| $crate::EnqueueError::new(e, item))
            }

            #[cfg(not(loom))]
            fn dequeue_timeout(&self, timeout: std::time::Duration) -> $crate::Result<T> {
                self.dequeue_with(&$crate::wait::Interruptible::timeout(timeout))
            }
        }
    };
}

pub(crate) use impl_blocking_queue;

/// Tests shared by both implementations, instantiated per queue with [queue_tests].
#[cfg(test)]
pub(crate) mod shared_tests {
    #[cfg(not(loom))]
    use std::collections::HashMap;
    use std::num::NonZeroUsize;

    use pretty_assertions::assert_eq;

    use super::BlockingQueue;
    use crate::sync::Arc;

    pub(crate) fn fifo_single_thread<Q: BlockingQueue<u32>>(make: impl Fn(NonZeroUsize) -> Q) {
        let queue = make(NonZeroUsize::new(3).unwrap());
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 3);

        // Go around the ring several times.
        let mut out = vec![];
        for i in 0..10 {
            queue.enqueue(i);
            queue.enqueue(i + 100);
            assert_eq!(queue.size(), 2);
            out.push(queue.dequeue());
            out.push(queue.dequeue());
        }

        let expected = (0..10).flat_map(|i| [i, i + 100]).collect::<Vec<_>>();
        assert_eq!(out, expected);

        for i in 0..3 {
            queue.enqueue(i);
        }
        assert!(queue.is_full());
    }

    /// One producer, one consumer, capacity 1: every enqueue after the first must wait for a dequeue.
    pub(crate) fn spsc_handoff<Q: BlockingQueue<u32> + 'static>(make: impl Fn(NonZeroUsize) -> Q) {
        const ITEMS: u32 = 3;

        let queue = Arc::new(make(NonZeroUsize::new(1).unwrap()));

        let producer = {
            let queue = queue.clone();
            crate::sync::spawn(move || {
                for i in 0..ITEMS {
                    queue.enqueue(i);
                }
            })
        };

        let got = (0..ITEMS).map(|_| queue.dequeue()).collect::<Vec<_>>();
        producer.join().unwrap();

        assert_eq!(got, (0..ITEMS).collect::<Vec<_>>());
        assert_eq!(queue.size(), 0);
    }

    /// Two producers and the main thread consuming; per-producer order must hold and nothing may be lost.
    pub(crate) fn mpsc_per_producer_order<Q: BlockingQueue<u32> + 'static>(
        make: impl Fn(NonZeroUsize) -> Q,
    ) {
        const PER_PRODUCER: u32 = 2;

        let queue = Arc::new(make(NonZeroUsize::new(2).unwrap()));

        let producers = (0..2u32)
            .map(|p| {
                let queue = queue.clone();
                crate::sync::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(p * 100 + i);
                    }
                })
            })
            .collect::<Vec<_>>();

        let got = (0..2 * PER_PRODUCER)
            .map(|_| queue.dequeue())
            .collect::<Vec<_>>();
        for p in producers {
            p.join().unwrap();
        }

        for p in 0..2u32 {
            let mine = got.iter().copied().filter(|x| x / 100 == p).collect::<Vec<_>>();
            assert_eq!(mine, (0..PER_PRODUCER).map(|i| p * 100 + i).collect::<Vec<_>>());
        }
    }

    /// Many producers and consumers; checks the size bound at every observation and exactly-once delivery.
    #[cfg(not(loom))]
    pub(crate) fn mpmc_stress<Q: BlockingQueue<u32> + 'static>(make: impl Fn(NonZeroUsize) -> Q) {
        const PRODUCERS: u32 = 4;
        const CONSUMERS: u32 = 4;
        const PER_PRODUCER: u32 = 500;
        const CAPACITY: usize = 3;

        let queue = Arc::new(make(NonZeroUsize::new(CAPACITY).unwrap()));

        let producers = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(p * 10_000 + i);
                        assert!(queue.size() <= CAPACITY);
                    }
                })
            })
            .collect::<Vec<_>>();

        let consumers = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    (0..PRODUCERS * PER_PRODUCER / CONSUMERS)
                        .map(|_| {
                            let item = queue.dequeue();
                            assert!(queue.size() <= CAPACITY);
                            item
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        for p in producers {
            p.join().unwrap();
        }

        let mut seen = HashMap::new();
        for c in consumers {
            let got = c.join().unwrap();
            // Each consumer sees each producer's items in increasing order.
            let mut last = HashMap::new();
            for item in got {
                let producer = item / 10_000;
                if let Some(prev) = last.insert(producer, item) {
                    assert!(prev < item, "{prev} was dequeued before {item}");
                }
                *seen.entry(item).or_insert(0) += 1;
            }
        }

        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert!(seen.values().all(|&count| count == 1));
        assert!(queue.is_empty());
    }

    #[cfg(not(loom))]
    pub(crate) fn blocked_dequeue_woken_by_enqueue<Q: BlockingQueue<u32> + 'static>(
        make: impl Fn(NonZeroUsize) -> Q,
    ) {
        use std::time::Duration;

        let queue = Arc::new(make(NonZeroUsize::new(2).unwrap()));
        let consumers = (0..2)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.dequeue_timeout(Duration::from_millis(300)))
            })
            .collect::<Vec<_>>();

        std::thread::sleep(Duration::from_millis(50));
        queue.enqueue(7);

        // Exactly one of the two blocked consumers gets the item; the other times out.
        let results = consumers
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert!(err.is_timed_out());
    }

    #[cfg(not(loom))]
    pub(crate) fn blocked_enqueue_woken_by_dequeue<Q: BlockingQueue<u32> + 'static>(
        make: impl Fn(NonZeroUsize) -> Q,
    ) {
        use std::time::Duration;

        let queue = Arc::new(make(NonZeroUsize::new(1).unwrap()));
        queue.enqueue(1);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.enqueue(2))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.size(), 1);

        assert_eq!(queue.dequeue(), 1);
        producer.join().unwrap();
        assert_eq!(queue.dequeue(), 2);
    }

    #[cfg(not(loom))]
    pub(crate) fn cancellation_leaves_queue_usable<Q: BlockingQueue<u32> + 'static>(
        make: impl Fn(NonZeroUsize) -> Q,
    ) {
        use std::time::Duration;

        use crate::CancelToken;

        let queue = Arc::new(make(NonZeroUsize::new(1).unwrap()));
        let token = CancelToken::new();

        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            std::thread::spawn(move || queue.dequeue_cancellable(&token))
        };
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(consumer.join().unwrap().unwrap_err().is_cancelled());

        queue.enqueue(1);
        token.reset();
        let producer = {
            let queue = queue.clone();
            let token = token.clone();
            std::thread::spawn(move || queue.enqueue_cancellable(2, &token))
        };
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        let rejected = producer.join().unwrap().unwrap_err();
        assert!(rejected.error().is_cancelled());
        assert_eq!(rejected.into_item(), 2);

        // Nothing was lost or duplicated, and no lock was left held.
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.dequeue(), 1);
        queue.enqueue(3);
        assert_eq!(queue.dequeue(), 3);

        assert!(queue.enqueue_timeout(4, Duration::ZERO).is_ok());
        let err = queue.enqueue_timeout(5, Duration::from_millis(5)).unwrap_err();
        assert!(err.error().is_timed_out());
    }

    /// Instantiate the shared tests for a queue type.
    macro_rules! queue_tests {
        ($make: expr) => {
            #[test]
            fn fifo_single_thread() {
                crate::queue::shared_tests::fifo_single_thread($make);
            }

            #[test]
            fn spsc_handoff() {
                crate::sync::wrap_test(|| crate::queue::shared_tests::spsc_handoff($make));
            }

            #[test]
            fn mpsc_per_producer_order() {
                crate::sync::wrap_test(|| {
                    crate::queue::shared_tests::mpsc_per_producer_order($make)
                });
            }

            #[cfg(not(loom))]
            #[test]
            fn mpmc_stress() {
                crate::queue::shared_tests::mpmc_stress($make);
            }

            #[cfg(not(loom))]
            #[test]
            fn blocked_dequeue_woken_by_enqueue() {
                crate::queue::shared_tests::blocked_dequeue_woken_by_enqueue($make);
            }

            #[cfg(not(loom))]
            #[test]
            fn blocked_enqueue_woken_by_dequeue() {
                crate::queue::shared_tests::blocked_enqueue_woken_by_dequeue($make);
            }

            #[cfg(not(loom))]
            #[test]
            fn cancellation_leaves_queue_usable() {
                crate::queue::shared_tests::cancellation_leaves_queue_usable($make);
            }
        };
    }

    pub(crate) use queue_tests;
}
