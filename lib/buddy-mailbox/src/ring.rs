//! The lock-free SPSC mailbox (spec.md §4.G): a bounded ring buffer with a
//! power-of-two capacity, one producer and one consumer. `head` (writer) and
//! `tail` (reader) live on separate cache lines; the producer publishes with
//! release ordering and the consumer observes with acquire ordering. No
//! blocking happens inside the ring — callers implement their own wait
//! policy (adaptive pause, bounded back-off).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

struct Inner<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

/// Creates a mailbox ring of the given capacity, split into a producer and a
/// consumer handle. `capacity` must be a nonzero power of two; one slot is
/// always kept empty to distinguish full from empty, so the usable depth is
/// `capacity - 1`.
pub fn mailbox<T>(capacity: usize) -> Option<(Sender<T>, Receiver<T>)> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return None;
    }
    let mut buffer = Vec::with_capacity(capacity);
    buffer.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
    let inner = Arc::new(Inner {
        buffer: buffer.into_boxed_slice(),
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    Some((
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver { inner },
    ))
}

/// The producer half of a mailbox. Not `Clone` — exactly one producer per
/// ring, per spec.md §4.G.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

/// The consumer half of a mailbox. Not `Clone` — exactly one consumer per
/// ring.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

unsafe impl<T: Send> Send for Sender<T> {}
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Sender<T> {
    /// Attempts to push one item. Returns the item back on failure (the ring
    /// is full): `(head + 1) mod cap == tail`.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let next = (head + 1) & self.inner.mask;
        let tail = self.inner.tail.load(Ordering::Acquire);
        if next == tail {
            return Err(value);
        }
        // SAFETY: slot `head` is owned by the producer until it publishes by
        // storing the new `head` value below; the consumer never reads past
        // the current `head`.
        unsafe {
            (*self.inner.buffer[head].get()).write(value);
        }
        self.inner.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Pushes as many items as fit, in order, stopping at the first failure.
    /// Returns the items that did not fit.
    pub fn try_push_batch(&self, values: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut leftover = Vec::new();
        let mut iter = values.into_iter();
        for value in iter.by_ref() {
            if let Err(rejected) = self.try_push(value) {
                leftover.push(rejected);
                break;
            }
        }
        leftover.extend(iter);
        leftover
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_full(&self) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        (head + 1) & self.inner.mask == tail
    }
}

impl<T> Receiver<T> {
    /// Attempts to pop one item. Returns `None` iff `head == tail` (empty).
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: slot `tail` was published by the producer's Release store
        // to `head`, observed here via Acquire.
        let value = unsafe { (*self.inner.buffer[tail].get()).assume_init_read() };
        let next = (tail + 1) & self.inner.mask;
        self.inner.tail.store(next, Ordering::Release);
        Some(value)
    }

    /// Pops every available item, in order.
    pub fn try_pop_batch(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(value) = self.try_pop() {
            out.push(value);
        }
        out
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        head == tail
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drain any items still logically in the ring so their destructors run.
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            unsafe {
                (*self.buffer[tail].get()).assume_init_drop();
            }
            tail = (tail + 1) & self.mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(mailbox::<u32>(0).is_none());
        assert!(mailbox::<u32>(3).is_none());
        assert!(mailbox::<u32>(4).is_some());
    }

    #[test]
    fn push_pop_round_trips_in_order() {
        let (tx, rx) = mailbox::<u32>(4).unwrap();
        assert!(rx.is_empty());
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        assert_eq!(rx.try_pop(), Some(1));
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn full_ring_rejects_push() {
        let (tx, _rx) = mailbox::<u32>(4).unwrap();
        // Usable depth is capacity - 1.
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        tx.try_push(3).unwrap();
        assert_eq!(tx.try_push(4), Err(4));
        assert!(tx.is_full());
    }

    #[test]
    fn batch_push_then_batch_pop() {
        let (tx, rx) = mailbox::<u32>(8).unwrap();
        let leftover = tx.try_push_batch(1..=5);
        assert!(leftover.is_empty());
        assert_eq!(rx.try_pop_batch(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn wraps_around_after_drain() {
        let (tx, rx) = mailbox::<u32>(4).unwrap();
        for round in 0..10u32 {
            tx.try_push(round).unwrap();
            assert_eq!(rx.try_pop(), Some(round));
        }
    }

    #[test]
    fn concurrent_producer_consumer_preserve_order() {
        use std::thread;

        let (tx, rx) = mailbox::<u32>(64).unwrap();
        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                while tx.try_push(i).is_err() {
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(v) = rx.try_pop() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    }
}
