// SPDX-License-Identifier: Apache-2.0

//! The process-wide store of admitted-but-not-yet-dispatched sandboxes.
//!
//! Under deadline policies this is a locked min-heap with a wait-free head
//! snapshot; workers only take the lock when [`GlobalQueue::remove_if_earlier`]
//! sees a head that could actually displace their local one. Under FIFO it is
//! a work-stealing deque: the listener owns the bottom, idle workers steal
//! from the top, and a lost race is reported as [`StealOutcome::Retry`]
//! rather than retried under the hood.

use crate::QUEUE_CAPACITY;
use crate::sandbox::Sandbox;
use crossbeam_deque::{Steal, Stealer, Worker};
use parking_lot::Mutex;
use sledge_rt_scheduler::error::{PopError, PushError};
use sledge_rt_scheduler::min_heap::MinHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Result of a FIFO steal attempt.
#[derive(Debug)]
pub enum StealOutcome {
    /// A sandbox was stolen.
    Taken(Arc<Sandbox>),
    /// The store is empty.
    Empty,
    /// The CAS raced with another stealer; the caller may try again later.
    Retry,
}

struct FifoStore {
    owner: Mutex<Worker<Arc<Sandbox>>>,
    stealer: Stealer<Arc<Sandbox>>,
    len: AtomicUsize,
}

/// The global request queue, shaped by the scheduling policy.
pub enum GlobalQueue {
    /// Priority-ordered store for EDF/SRSF and the traffic-control policies.
    Deadline(MinHeap<Arc<Sandbox>>),
    /// Chase–Lev deque for FIFO.
    Fifo(FifoStoreHandle),
}

/// Public handle around the FIFO store internals.
pub struct FifoStoreHandle {
    store: FifoStore,
}

impl GlobalQueue {
    /// Builds the deadline-ordered variant.
    #[must_use]
    pub fn new_deadline() -> Self {
        Self::Deadline(MinHeap::new(QUEUE_CAPACITY))
    }

    /// Builds the FIFO variant.
    #[must_use]
    pub fn new_fifo() -> Self {
        let owner = Worker::new_fifo();
        let stealer = owner.stealer();
        Self::Fifo(FifoStoreHandle {
            store: FifoStore {
                owner: Mutex::new(owner),
                stealer,
                len: AtomicUsize::new(0),
            },
        })
    }

    /// Number of queued sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Deadline(heap) => heap.len(),
            Self::Fifo(handle) => handle.store.len.load(Ordering::Acquire),
        }
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an admitted sandbox. Hands it back when the store is at
    /// capacity so the caller can reply 429 and roll back admission.
    pub fn add(&self, sandbox: Arc<Sandbox>) -> Result<(), PushError<Arc<Sandbox>>> {
        match self {
            Self::Deadline(heap) => heap.enqueue(sandbox),
            Self::Fifo(handle) => {
                let len = handle.store.len.load(Ordering::Acquire);
                if len >= QUEUE_CAPACITY {
                    return Err(PushError::Full(sandbox));
                }
                handle.store.owner.lock().push(sandbox);
                let _ = handle.store.len.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Wait-free snapshot of the head priority; `u64::MAX` when empty (the
    /// FIFO store publishes only emptiness).
    #[must_use]
    pub fn peek(&self) -> u64 {
        match self {
            Self::Deadline(heap) => heap.peek(),
            Self::Fifo(handle) => {
                if handle.store.len.load(Ordering::Acquire) == 0 {
                    u64::MAX
                } else {
                    0
                }
            }
        }
    }

    /// Takes the head iff it is strictly earlier than `target`. Deadline
    /// variant only; FIFO workers pull with [`Self::remove`] when idle.
    #[must_use]
    pub fn remove_if_earlier(&self, target: u64) -> Option<Arc<Sandbox>> {
        match self {
            Self::Deadline(heap) => heap.remove_if_earlier(target),
            Self::Fifo(_) => None,
        }
    }

    /// Unconditional removal: dequeue (deadline) or steal (FIFO).
    pub fn remove(&self) -> StealOutcome {
        match self {
            Self::Deadline(heap) => match heap.dequeue() {
                Ok(sandbox) => StealOutcome::Taken(sandbox),
                Err(PopError::Empty) => StealOutcome::Empty,
                Err(PopError::Mismatch) => unreachable!("dequeue never mismatches"),
            },
            Self::Fifo(handle) => match handle.store.stealer.steal() {
                Steal::Success(sandbox) => {
                    let _ = handle.store.len.fetch_sub(1, Ordering::AcqRel);
                    StealOutcome::Taken(sandbox)
                }
                Steal::Empty => StealOutcome::Empty,
                Steal::Retry => StealOutcome::Retry,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use sledge_rt_scheduler::QueueItem;

    fn deadline_sandbox(deadline: u64) -> Arc<Sandbox> {
        let sandbox = testing::stub_sandbox();
        sandbox.set_priority(deadline);
        sandbox
    }

    #[test]
    fn deadline_store_orders_by_priority() {
        let queue = GlobalQueue::new_deadline();
        for d in [300, 100, 200] {
            queue.add(deadline_sandbox(d)).expect("capacity");
        }
        assert_eq!(queue.peek(), 100);
        match queue.remove() {
            StealOutcome::Taken(s) => assert_eq!(s.priority(), 100),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(queue.peek(), 200);
    }

    #[test]
    fn remove_if_earlier_respects_the_target() {
        let queue = GlobalQueue::new_deadline();
        queue.add(deadline_sandbox(500)).expect("capacity");
        assert!(queue.remove_if_earlier(500).is_none());
        assert!(queue.remove_if_earlier(400).is_none());
        let taken = queue.remove_if_earlier(501).expect("earlier than target");
        assert!(taken.priority() < 501);
        assert!(queue.is_empty());
    }

    #[test]
    fn two_peeks_without_mutation_agree() {
        let queue = GlobalQueue::new_deadline();
        queue.add(deadline_sandbox(42)).expect("capacity");
        assert_eq!(queue.peek(), queue.peek());
    }

    #[test]
    fn fifo_store_steals_in_arrival_order() {
        let queue = GlobalQueue::new_fifo();
        let first = testing::stub_sandbox();
        let second = testing::stub_sandbox();
        queue.add(first.clone()).expect("capacity");
        queue.add(second.clone()).expect("capacity");
        assert_eq!(queue.len(), 2);
        assert!(queue.peek() < u64::MAX);

        match queue.remove() {
            StealOutcome::Taken(s) => assert!(s.same(&first)),
            other => panic!("unexpected: {other:?}"),
        }
        match queue.remove() {
            StealOutcome::Taken(s) => assert!(s.same(&second)),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(queue.remove(), StealOutcome::Empty));
        assert_eq!(queue.peek(), u64::MAX);
    }
}
