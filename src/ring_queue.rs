//! Bounded lock-free multi-producer multi-consumer queue.
//!
//! Dmitry Vyukov's bounded MPMC algorithm. Every slot carries a sequence
//! number that says which lap around the array currently owns it:
//!
//! - Initial: slot index (0, 1, ..., C-1)
//! - Producer at cursor `t` may write when `seq == t`; publishes `seq = t + 1`
//! - Consumer at cursor `h` may read when `seq == h + 1`; releases `seq = h + C`
//!
//! Cursors only advance through CAS, so a failed `push`/`pop` leaves shared
//! state untouched and can be retried with whatever backoff the caller likes.
//! Items become visible to consumers in the order producers won their tail
//! cursor positions.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One element of storage plus the sequence number guarding it.
struct Slot<T> {
    seq: AtomicUsize,
    /// Initialized iff a producer has published into this slot and no
    /// consumer has taken it out since.
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(seq: usize) -> Self {
        Self {
            seq: AtomicUsize::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Keeps the two cursors on separate cache lines.
#[repr(align(64))]
struct CachePadded<T>(T);

pub struct RingQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Next position a producer will claim.
    tail: CachePadded<AtomicUsize>,
    /// Next position a consumer will claim.
    head: CachePadded<AtomicUsize>,
}

// SAFETY: access to each slot's value is handed between threads by the
// sequence protocol; a value is only ever touched by the single thread whose
// CAS claimed that position, and moves across threads require `T: Send`.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Queue holding at least `capacity` items; the real capacity is the
    /// next power of two, and never below 2.
    pub fn with_capacity(capacity: usize) -> Self {
        // With a single slot, a free slot and a full one carry the same
        // sequence number, so a second push would overwrite the first.
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Box<[Slot<T>]> = (0..capacity).map(Slot::new).collect();
        Self {
            slots,
            mask: capacity - 1,
            tail: CachePadded(AtomicUsize::new(0)),
            head: CachePadded(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Try to enqueue. Returns the value back if the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.tail.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this thread position `pos`, and
                        // `seq == pos` means the previous occupant was taken
                        // out. Nobody else reads or writes the slot until the
                        // store below publishes it.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Slot still holds last lap's value: full.
                return Err(value);
            } else {
                pos = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to dequeue. `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: `seq == pos + 1` was stored (Release) after
                        // the producer's write and observed here with Acquire;
                        // the CAS makes this thread the only reader.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.slots.len()), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Snapshot of the number of claimed positions; exact only when no other
    /// thread is pushing or popping.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: every published slot is drained and dropped here.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(RingQueue::<u8>::with_capacity(5).capacity(), 8);
        assert_eq!(RingQueue::<u8>::with_capacity(8).capacity(), 8);
        assert_eq!(RingQueue::<u8>::with_capacity(2).capacity(), 2);
        assert_eq!(RingQueue::<u8>::with_capacity(1).capacity(), 2);
        assert_eq!(RingQueue::<u8>::with_capacity(0).capacity(), 2);
        assert_eq!(RingQueue::<u8>::with_capacity(1000).capacity(), 1024);
    }

    #[test]
    fn fifo_single_thread() {
        let q = RingQueue::with_capacity(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn push_on_full_returns_value_without_blocking() {
        let q = RingQueue::with_capacity(4);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        assert_eq!(q.push(99), Err(99));
        assert_eq!(q.pop(), Some(0));
        q.push(4).unwrap();
        assert_eq!(q.push(100), Err(100));
    }

    #[test]
    fn smallest_queue_reports_full_instead_of_overwriting() {
        let q = RingQueue::with_capacity(1);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let q: RingQueue<String> = RingQueue::with_capacity(2);
        assert_eq!(q.pop(), None);
        q.push("a".to_string()).unwrap();
        assert_eq!(q.pop().as_deref(), Some("a"));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_around_many_laps() {
        let q = RingQueue::with_capacity(2);
        for i in 0..1000u32 {
            q.push(i).unwrap();
            q.push(i + 1).unwrap();
            assert_eq!(q.pop(), Some(i));
            assert_eq!(q.pop(), Some(i + 1));
        }
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drop_releases_resident_elements() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let q = RingQueue::with_capacity(8);
            for _ in 0..5 {
                assert!(q.push(DropCounter(drops.clone())).is_ok());
            }
            drop(q.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_producers_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let q = Arc::new(RingQueue::with_capacity(64));
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        while let Err(back) = q.push(v) {
                            v = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let q = q.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while consumed.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                        match q.pop() {
                            Some(v) => {
                                got.push(v);
                                consumed.fetch_add(1, Ordering::SeqCst);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<usize> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<usize> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(all, expected);
        assert!(q.is_empty());
    }
}
