//! bounded single producer / single consumer queue.
//!
//! Used in three places: worker to u/x for discrete events (lossy, the worker
//! drops when full), audio callback to worker for outgoing PCM, and worker to
//! audio callback for decoded peer PCM.  All storage is allocated when the
//! queue is built.  Capacity is rounded up to a power of two so slot lookup is
//! a mask.
//!
//! Release on publish, acquire on consume.  Head and tail are free running
//! counters, so full is `head - tail == capacity`.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct RingInner<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize, // next slot the producer will write
    tail: AtomicUsize, // next slot the consumer will read
}

// Safety: only the Producer writes slots at head, only the Consumer reads
// slots at tail, and the counters are published with release/acquire.
unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

impl<T> Drop for RingInner<T> {
    fn drop(&mut self) {
        // Both halves are gone, so the counters are quiescent
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.tail.load(Ordering::Relaxed);
        while tail != head {
            let idx = tail & self.mask;
            unsafe {
                (*self.slots[idx].get()).assume_init_drop();
            }
            tail = tail.wrapping_add(1);
        }
    }
}

pub struct Producer<T> {
    ring: Arc<RingInner<T>>,
    head: usize, // producer owned copy, published on store
}

pub struct Consumer<T> {
    ring: Arc<RingInner<T>>,
    tail: usize, // consumer owned copy, published on store
}

/// Build a ring with at least `capacity` slots and hand back the two halves.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let cap = capacity.max(2).next_power_of_two();
    let mut slots = Vec::with_capacity(cap);
    for _ in 0..cap {
        slots.push(UnsafeCell::new(MaybeUninit::uninit()));
    }
    let ring = Arc::new(RingInner {
        slots: slots.into_boxed_slice(),
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            ring: ring.clone(),
            head: 0,
        },
        Consumer { ring, tail: 0 },
    )
}

impl<T> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.mask + 1
    }
    /// slots open for writing right now
    pub fn space(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Acquire);
        self.capacity() - self.head.wrapping_sub(tail)
    }
    /// push one value.  Returns false (dropping the value) when full.
    pub fn try_push(&mut self, value: T) -> bool {
        if self.space() == 0 {
            return false;
        }
        let idx = self.head & self.ring.mask;
        unsafe {
            (*self.ring.slots[idx].get()).write(value);
        }
        self.head = self.head.wrapping_add(1);
        self.ring.head.store(self.head, Ordering::Release);
        true
    }
}

impl<T: Copy> Producer<T> {
    /// push as much of the slice as fits, one publish for the whole run.
    /// Returns how many items went in.
    pub fn push_slice(&mut self, values: &[T]) -> usize {
        let n = self.space().min(values.len());
        for v in &values[..n] {
            let idx = self.head & self.ring.mask;
            unsafe {
                (*self.ring.slots[idx].get()).write(*v);
            }
            self.head = self.head.wrapping_add(1);
        }
        if n > 0 {
            self.ring.head.store(self.head, Ordering::Release);
        }
        n
    }
}

impl<T> Consumer<T> {
    /// items ready to read
    pub fn len(&self) -> usize {
        let head = self.ring.head.load(Ordering::Acquire);
        head.wrapping_sub(self.tail)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn try_pop(&mut self) -> Option<T> {
        let head = self.ring.head.load(Ordering::Acquire);
        if head == self.tail {
            return None;
        }
        let idx = self.tail & self.ring.mask;
        let value = unsafe { (*self.ring.slots[idx].get()).assume_init_read() };
        self.tail = self.tail.wrapping_add(1);
        self.ring.tail.store(self.tail, Ordering::Release);
        Some(value)
    }
    /// pop everything, visiting in FIFO order
    pub fn drain<F: FnMut(T)>(&mut self, mut visitor: F) -> usize {
        let mut count = 0;
        while let Some(v) = self.try_pop() {
            visitor(v);
            count += 1;
        }
        count
    }
}

impl<T: Copy> Consumer<T> {
    /// fill as much of the slice as there is data, one publish for the run.
    /// Returns how many items came out.
    pub fn pop_slice(&mut self, out: &mut [T]) -> usize {
        let head = self.ring.head.load(Ordering::Acquire);
        let n = head.wrapping_sub(self.tail).min(out.len());
        for slot in out[..n].iter_mut() {
            let idx = self.tail & self.ring.mask;
            *slot = unsafe { (*self.ring.slots[idx].get()).assume_init_read() };
            self.tail = self.tail.wrapping_add(1);
        }
        if n > 0 {
            self.ring.tail.store(self.tail, Ordering::Release);
        }
        n
    }
}
