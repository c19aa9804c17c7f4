// SPDX-License-Identifier: Apache-2.0

//! Per-worker run queues.
//!
//! Every worker owns one ordered store of the sandboxes currently resident on
//! it, including the one that is running (the head and the current sandbox
//! are usually the same). Three shapes exist: a min-heap for the deadline
//! policies, an ordered tree whose cost sums answer the dispatcher's
//! placement probe ([`LocalRunqueue::try_add`]), and an intrusive list
//! rotated round-robin for FIFO.
//!
//! The queue's lock is only ever contended by the dispatcher probing or
//! pushing from outside; the owning worker otherwise has it to itself.

use crate::QUEUE_CAPACITY;
use crate::sandbox::{ListAdapter, Sandbox};
use crossbeam_utils::CachePadded;
use intrusive_collections::LinkedList;
use parking_lot::Mutex;
use sledge_rt_scheduler::error::PushError;
use sledge_rt_scheduler::min_heap::MinHeap;
use sledge_rt_scheduler::ordered_tree::OrderedTree;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a dispatcher placement probe against one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAdd {
    /// The worker is idle; placing here runs the sandbox immediately.
    Idle,
    /// The worker's current sandbox is preemptable and later-deadlined;
    /// placing here plus an interrupt runs the sandbox immediately.
    Preempt,
    /// Placing here waits behind this many cycles of earlier work.
    Wait(u64),
}

/// One worker's ordered store of resident sandboxes.
pub enum LocalRunqueue {
    /// Priority-ordered heap (EDF, SRSF).
    Heap(MinHeap<Arc<Sandbox>>),
    /// Priority-ordered tree with cost-sum lookahead (cost-aware dispatch).
    Tree(Mutex<OrderedTree<Arc<Sandbox>>>),
    /// Arrival-ordered intrusive list, rotated for round-robin (FIFO).
    List(Mutex<LinkedList<ListAdapter>>),
}

impl LocalRunqueue {
    /// Builds the heap variant.
    #[must_use]
    pub fn new_heap() -> Self {
        Self::Heap(MinHeap::new(QUEUE_CAPACITY))
    }

    /// Builds the ordered-tree variant.
    #[must_use]
    pub fn new_tree() -> Self {
        Self::Tree(Mutex::new(OrderedTree::new()))
    }

    /// Builds the FIFO list variant.
    #[must_use]
    pub fn new_list() -> Self {
        Self::List(Mutex::new(LinkedList::new(ListAdapter::new())))
    }

    /// Number of resident sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Heap(heap) => heap.len(),
            Self::Tree(tree) => tree.lock().len(),
            Self::List(list) => list.lock().iter().count(),
        }
    }

    /// True when no sandbox is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Heap(heap) => heap.is_empty(),
            Self::Tree(tree) => tree.lock().is_empty(),
            Self::List(list) => list.lock().is_empty(),
        }
    }

    /// Priority of the head, `u64::MAX` when empty. Wait-free for the heap.
    #[must_use]
    pub fn head_priority(&self) -> u64 {
        match self {
            Self::Heap(heap) => heap.peek(),
            Self::Tree(tree) => tree.lock().min_priority(),
            Self::List(list) => list
                .lock()
                .front()
                .clone_pointer()
                .map_or(u64::MAX, |s| s.priority()),
        }
    }

    /// Adds a resident sandbox.
    pub fn add(&self, sandbox: Arc<Sandbox>) -> Result<(), PushError<Arc<Sandbox>>> {
        match self {
            Self::Heap(heap) => heap.enqueue(sandbox),
            Self::Tree(tree) => {
                tree.lock().insert(sandbox);
                Ok(())
            }
            Self::List(list) => {
                list.lock().push_back(sandbox);
                Ok(())
            }
        }
    }

    /// Removes a specific sandbox (completion, error, or writeback).
    pub fn delete(&self, sandbox: &Arc<Sandbox>) {
        match self {
            Self::Heap(heap) => {
                let result = match sandbox.heap_slot() {
                    Some(slot) => heap.delete_at(sandbox, slot),
                    None => heap.delete(sandbox),
                };
                assert!(result.is_ok(), "sandbox {} not on its run queue", sandbox.id);
            }
            Self::Tree(tree) => {
                let removed = tree.lock().remove(sandbox);
                assert!(removed, "sandbox {} not on its run queue", sandbox.id);
            }
            Self::List(list) => {
                let mut list = list.lock();
                let mut cursor = list.front_mut();
                loop {
                    match cursor.get() {
                        Some(entry) if std::ptr::eq(entry, Arc::as_ptr(sandbox)) => {
                            let _ = cursor.remove();
                            return;
                        }
                        Some(_) => cursor.move_next(),
                        None => panic!("sandbox {} not on its run queue", sandbox.id),
                    }
                }
            }
        }
    }

    /// The sandbox the worker should run next: the ordered head, without
    /// removing it.
    #[must_use]
    pub fn get_next(&self) -> Option<Arc<Sandbox>> {
        match self {
            Self::Heap(heap) => heap.top().ok(),
            Self::Tree(tree) => tree.lock().min(),
            Self::List(list) => list.lock().front().clone_pointer(),
        }
    }

    /// Round-robin rotation (FIFO only): the head moves to the back.
    pub fn rotate(&self) {
        if let Self::List(list) = self {
            let mut list = list.lock();
            if let Some(front) = list.pop_front() {
                list.push_back(front);
            }
        }
    }

    /// The dispatcher's placement probe. `current_priority` is the deadline
    /// of the sandbox the worker is running (`u64::MAX` when idle) and
    /// `current_preemptable` whether that sandbox is in its preemptable
    /// state.
    ///
    /// Returns [`TryAdd::Idle`] for an idle worker, [`TryAdd::Preempt`] when
    /// the candidate beats a preemptable current sandbox, and otherwise the
    /// cycles of strictly-earlier queued work the candidate would wait
    /// behind.
    #[must_use]
    pub fn try_add(
        &self,
        candidate: &Arc<Sandbox>,
        current_priority: u64,
        current_preemptable: bool,
    ) -> TryAdd {
        let idle = self.is_empty() && current_priority == u64::MAX;
        if idle {
            return TryAdd::Idle;
        }
        if current_preemptable && candidate.priority() < current_priority {
            return TryAdd::Preempt;
        }
        let ahead = match self {
            Self::Tree(tree) => tree.lock().cost_below(candidate.priority()),
            // The other shapes carry no order-statistic augmentation; the
            // dispatcher only probes tree-shaped queues.
            Self::Heap(_) | Self::List(_) => 0,
        };
        TryAdd::Wait(ahead)
    }
}

/// A worker's monotonic queueing-cost counter: the summed remaining cost of
/// everything resident on it. Decrements saturate, so transient reorderings
/// can never drive it negative.
#[derive(Debug, Default)]
pub struct QueuingCost(CachePadded<AtomicU64>);

impl QueuingCost {
    /// Current value in cycles.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Charges `cost` cycles on enqueue.
    pub fn increment(&self, cost: u64) {
        let _ = self.0.fetch_add(cost, Ordering::AcqRel);
    }

    /// Retires `cost` cycles on dequeue or completion, never crossing zero.
    pub fn decrement(&self, cost: u64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(cost);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn sandbox_with_priority(priority: u64) -> Arc<Sandbox> {
        let sandbox = testing::stub_sandbox();
        sandbox.set_priority(priority);
        sandbox
    }

    #[test]
    fn heap_queue_orders_and_deletes_by_slot() {
        let rq = LocalRunqueue::new_heap();
        let a = sandbox_with_priority(30);
        let b = sandbox_with_priority(10);
        let c = sandbox_with_priority(20);
        for s in [&a, &b, &c] {
            rq.add(s.clone()).expect("capacity");
        }
        assert_eq!(rq.head_priority(), 10);
        assert_eq!(rq.get_next().map(|s| s.id), Some(b.id));
        rq.delete(&b);
        assert_eq!(rq.head_priority(), 20);
        assert_eq!(rq.len(), 2);
    }

    #[test]
    fn list_queue_rotates_round_robin() {
        let rq = LocalRunqueue::new_list();
        let a = testing::stub_sandbox();
        let b = testing::stub_sandbox();
        rq.add(a.clone()).expect("list never fills");
        rq.add(b.clone()).expect("list never fills");
        assert_eq!(rq.get_next().map(|s| s.id), Some(a.id));
        rq.rotate();
        assert_eq!(rq.get_next().map(|s| s.id), Some(b.id));
        rq.rotate();
        assert_eq!(rq.get_next().map(|s| s.id), Some(a.id));
        rq.delete(&a);
        assert_eq!(rq.get_next().map(|s| s.id), Some(b.id));
    }

    #[test]
    fn try_add_distinguishes_idle_preempt_and_wait() {
        let rq = LocalRunqueue::new_tree();
        let candidate = sandbox_with_priority(100);

        // Idle worker.
        assert_eq!(rq.try_add(&candidate, u64::MAX, false), TryAdd::Idle);

        // Busy worker running a later, preemptable sandbox.
        assert_eq!(rq.try_add(&candidate, 500, true), TryAdd::Preempt);

        // Busy worker running an earlier sandbox; candidate waits behind the
        // strictly-earlier queued work.
        let earlier = sandbox_with_priority(50);
        let later = sandbox_with_priority(900);
        rq.add(earlier.clone()).expect("tree never fills");
        rq.add(later).expect("tree never fills");
        match rq.try_add(&candidate, 50, true) {
            TryAdd::Wait(cost) => {
                assert_eq!(cost, earlier.remaining_exec.load(Ordering::Acquire));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn queuing_cost_never_goes_negative() {
        let cost = QueuingCost::default();
        cost.increment(1000);
        cost.decrement(400);
        assert_eq!(cost.get(), 600);
        cost.decrement(5000);
        assert_eq!(cost.get(), 0);
    }
}
