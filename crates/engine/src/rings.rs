// SPDX-License-Identifier: Apache-2.0

//! Inter-thread message rings.
//!
//! Each (listener, worker) pair owns two bounded single-producer
//! single-consumer rings, one per direction. The listener learns about
//! demand changes without sampling shared memory; the worker learns about
//! shed requests without taking a lock. Rings are lock-free: one atomic each
//! for head and tail, slots handed over by index.

use crate::sandbox::Sandbox;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Messages a worker sends its listener.
#[derive(Debug)]
pub enum WorkerToListener {
    /// The worker pulled a sandbox off the global queue on its own.
    PulledNewSandbox {
        /// The pulled sandbox's id.
        sandbox_id: u64,
    },
    /// The worker retired `cycles` of committed demand.
    ReduceDemand {
        /// The sandbox whose demand shrank.
        sandbox_id: u64,
        /// Cycles retired.
        cycles: u64,
    },
    /// A sandbox reached a terminal state.
    FinishedSandbox {
        /// The finished sandbox; carries the session for response delivery.
        sandbox: Arc<Sandbox>,
    },
    /// A sandbox ran past its route estimate.
    OvershotEstimate {
        /// The overshooting sandbox's id.
        sandbox_id: u64,
        /// How long it has actually run, in cycles.
        total_running: u64,
    },
    /// A preempted sandbox is handed back for centralized re-queueing
    /// (Shinjuku).
    WritebackPreemption {
        /// The preempted sandbox.
        sandbox: Arc<Sandbox>,
        /// Cycle timestamp of the preemption.
        at: u64,
    },
}

/// Messages a listener sends a worker.
#[derive(Debug)]
pub enum ListenerToWorker {
    /// Shed the job the worker is currently running (traffic control).
    ShedCurrentJob,
}

/// A bounded lock-free SPSC ring.
///
/// Exactly one thread pushes and exactly one thread pops; the type does not
/// enforce that split, the ring tables in [`crate::runtime`] do.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: a slot is accessed by the producer strictly before publishing
// (tail store) and by the consumer strictly after observing it published
// (tail load), so no slot is ever touched concurrently.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Creates a ring holding up to `capacity` messages (rounded up to a
    /// power of two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: enqueues `value`, handing it back when full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            return Err(value);
        }
        // SAFETY: the slot at `tail` is unpublished, so only the producer
        // touches it.
        unsafe {
            (*self.slots[tail & self.mask].get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: dequeues the oldest message, if any.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the slot at `head` was published by the producer and is
        // not yet consumed, so only the consumer touches it.
        let value = unsafe { (*self.slots[head & self.mask].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_capacity() {
        let ring = SpscRing::new(4);
        for i in 0..4 {
            ring.push(i).expect("capacity 4");
        }
        assert!(ring.push(99).is_err());
        assert_eq!(ring.len(), 4);
        for i in 0..4 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraps_around_many_times() {
        let ring = SpscRing::new(2);
        for round in 0..1000u32 {
            ring.push(round).expect("room");
            assert_eq!(ring.pop(), Some(round));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn cross_thread_handoff_preserves_order() {
        let ring = std::sync::Arc::new(SpscRing::new(64));
        let producer_ring = ring.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    if producer_ring.push(i).is_ok() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(got) = ring.pop() {
                assert_eq!(got, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().expect("producer");
    }

    #[test]
    fn queued_values_drop_with_the_ring() {
        let ring = SpscRing::new(8);
        let value = std::sync::Arc::new(());
        for _ in 0..4 {
            ring.push(value.clone()).expect("room");
        }
        assert_eq!(std::sync::Arc::strong_count(&value), 5);
        drop(ring);
        assert_eq!(std::sync::Arc::strong_count(&value), 1);
    }
}
