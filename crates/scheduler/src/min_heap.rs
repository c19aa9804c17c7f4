// SPDX-License-Identifier: Apache-2.0

//! Capacity-bounded binary min-heap with slot tracking.
//!
//! The heap invokes [`QueueItem::set_heap_slot`] on every sift so each element
//! always knows its own position; [`HeapCore::delete_at`] uses that to remove
//! an arbitrary element in `O(log n)` without scanning. The head priority is
//! additionally published through an atomic so readers on other threads can
//! [`MinHeap::peek`] without taking the lock.

use crate::error::{PopError, PushError};
use crate::{EMPTY_PRIORITY, QueueItem};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Invoked with the new head element whenever the minimum changes.
pub type NewTopFn<T> = Box<dyn Fn(&T) + Send + Sync>;

/// The unlocked heap. All operations here assume the caller holds whatever
/// lock protects the structure; [`MinHeap`] is the locked facade.
pub struct HeapCore<T> {
    items: Vec<T>,
    capacity: usize,
    head_priority: Arc<AtomicU64>,
    on_new_top: Option<NewTopFn<T>>,
}

impl<T: QueueItem> HeapCore<T> {
    fn new(capacity: usize, head_priority: Arc<AtomicU64>, on_new_top: Option<NewTopFn<T>>) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            head_priority,
            on_new_top,
        }
    }

    /// Number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts `item`, failing when the heap is at capacity.
    pub fn enqueue(&mut self, item: T) -> Result<(), PushError<T>> {
        if self.items.len() == self.capacity {
            return Err(PushError::Full(item));
        }
        let slot = self.items.len();
        item.set_heap_slot(Some(slot));
        self.items.push(item);
        self.sift_up(slot);
        self.publish_head();
        Ok(())
    }

    /// Removes and returns the minimum element.
    pub fn dequeue(&mut self) -> Result<T, PopError> {
        if self.items.is_empty() {
            return Err(PopError::Empty);
        }
        let item = self.remove_slot(0);
        self.publish_head();
        Ok(item)
    }

    /// Returns the minimum element without removing it.
    pub fn top(&self) -> Result<T, PopError> {
        self.items.first().cloned().ok_or(PopError::Empty)
    }

    /// Removes the element claimed to be at `slot`. The claim is validated
    /// against [`QueueItem::same`]; a mismatch means the caller's slot cache
    /// is stale, which the runtime treats as a programming error.
    pub fn delete_at(&mut self, item: &T, slot: usize) -> Result<(), PopError> {
        match self.items.get(slot) {
            Some(stored) if stored.same(item) => {}
            _ => return Err(PopError::Mismatch),
        }
        let removed = self.remove_slot(slot);
        debug_assert!(removed.same(item));
        self.publish_head();
        Ok(())
    }

    /// Removes `item` by scanning for it. Used only by callers that do not
    /// track slots; everything on the hot path goes through [`Self::delete_at`].
    pub fn delete(&mut self, item: &T) -> Result<(), PopError> {
        let slot = self
            .items
            .iter()
            .position(|stored| stored.same(item))
            .ok_or(PopError::Mismatch)?;
        let _ = self.remove_slot(slot);
        self.publish_head();
        Ok(())
    }

    fn remove_slot(&mut self, slot: usize) -> T {
        let last = self.items.len() - 1;
        self.items.swap(slot, last);
        let removed = self.items.pop().expect("slot bounds checked by caller");
        removed.set_heap_slot(None);
        if slot < self.items.len() {
            self.items[slot].set_heap_slot(Some(slot));
            // The swapped-in element may violate the order in either direction.
            let slot = self.sift_down(slot);
            self.sift_up(slot);
        }
        removed
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.items[parent].priority() <= self.items[slot].priority() {
                break;
            }
            self.swap_slots(parent, slot);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        loop {
            let left = 2 * slot + 1;
            if left >= self.items.len() {
                return slot;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.items.len() && self.items[right].priority() < self.items[left].priority()
            {
                smallest = right;
            }
            if self.items[slot].priority() <= self.items[smallest].priority() {
                return slot;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.items[a].set_heap_slot(Some(a));
        self.items[b].set_heap_slot(Some(b));
    }

    fn publish_head(&self) {
        match self.items.first() {
            Some(head) => {
                self.head_priority.store(head.priority(), Ordering::Release);
                if let Some(cb) = &self.on_new_top {
                    cb(head);
                }
            }
            None => self.head_priority.store(EMPTY_PRIORITY, Ordering::Release),
        }
    }
}

/// Lock-protected min-heap with a wait-free head-priority snapshot.
pub struct MinHeap<T> {
    core: Mutex<HeapCore<T>>,
    head_priority: Arc<AtomicU64>,
}

impl<T: QueueItem> MinHeap<T> {
    /// Creates a heap bounded to `capacity` elements.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_new_top_callback(capacity, None)
    }

    /// Creates a heap that additionally invokes `on_new_top` (under the heap
    /// lock) whenever the minimum element changes.
    #[must_use]
    pub fn with_new_top_callback(capacity: usize, on_new_top: Option<NewTopFn<T>>) -> Self {
        let head_priority = Arc::new(AtomicU64::new(EMPTY_PRIORITY));
        Self {
            core: Mutex::new(HeapCore::new(capacity, head_priority.clone(), on_new_top)),
            head_priority,
        }
    }

    /// Wait-free snapshot of the head priority; [`EMPTY_PRIORITY`] when empty.
    ///
    /// The snapshot may be momentarily stale with respect to concurrent
    /// mutations; callers that need an exact answer must take the lock and
    /// re-check, which is exactly what `remove_if_earlier` does.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.head_priority.load(Ordering::Acquire)
    }

    /// Locks the heap for a compound operation.
    pub fn lock(&self) -> MutexGuard<'_, HeapCore<T>> {
        self.core.lock()
    }

    /// Inserts `item`; see [`HeapCore::enqueue`].
    pub fn enqueue(&self, item: T) -> Result<(), PushError<T>> {
        self.core.lock().enqueue(item)
    }

    /// Removes the minimum element; see [`HeapCore::dequeue`].
    pub fn dequeue(&self) -> Result<T, PopError> {
        self.core.lock().dequeue()
    }

    /// Returns the minimum element without removing it.
    pub fn top(&self) -> Result<T, PopError> {
        self.core.lock().top()
    }

    /// Removes the element at its tracked slot; see [`HeapCore::delete_at`].
    pub fn delete_at(&self, item: &T, slot: usize) -> Result<(), PopError> {
        self.core.lock().delete_at(item, slot)
    }

    /// Removes `item` by scan; see [`HeapCore::delete`].
    pub fn delete(&self, item: &T) -> Result<(), PopError> {
        self.core.lock().delete(item)
    }

    /// Number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }

    /// Removes and returns the head iff its priority is strictly earlier than
    /// `target`. The head snapshot is re-checked under the lock, so the
    /// returned element always satisfies `priority < target`.
    pub fn remove_if_earlier(&self, target: u64) -> Option<T> {
        if self.peek() >= target {
            return None;
        }
        let mut core = self.core.lock();
        match core.top() {
            Ok(head) if head.priority() < target => core.dequeue().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Item {
        priority: u64,
        cost: u64,
        slot: Cell<Option<usize>>,
    }

    // Test items never cross threads.
    type Handle = std::rc::Rc<Item>;

    fn item(priority: u64) -> Handle {
        std::rc::Rc::new(Item {
            priority,
            cost: 0,
            slot: Cell::new(None),
        })
    }

    impl QueueItem for Handle {
        fn priority(&self) -> u64 {
            self.priority
        }
        fn cost(&self) -> u64 {
            self.cost
        }
        fn set_heap_slot(&self, slot: Option<usize>) {
            self.slot.set(slot);
        }
        fn same(&self, other: &Self) -> bool {
            std::rc::Rc::ptr_eq(self, other)
        }
    }

    fn heap(capacity: usize) -> HeapCore<Handle> {
        HeapCore::new(capacity, Arc::new(AtomicU64::new(EMPTY_PRIORITY)), None)
    }

    #[test]
    fn enqueue_dequeue_orders_by_priority() {
        let mut pq = heap(16);
        for p in [50, 10, 40, 30, 20] {
            pq.enqueue(item(p)).expect("capacity");
        }
        let drained: Vec<u64> = std::iter::from_fn(|| pq.dequeue().ok())
            .map(|i| i.priority)
            .collect();
        assert_eq!(drained, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn single_element_round_trip_returns_same_handle() {
        let mut pq = heap(4);
        let only = item(7);
        pq.enqueue(only.clone()).expect("capacity");
        let back = pq.dequeue().expect("non-empty");
        assert!(back.same(&only));
        assert_eq!(back.slot.get(), None);
    }

    #[test]
    fn full_heap_hands_the_element_back() {
        let mut pq = heap(1);
        pq.enqueue(item(1)).expect("capacity");
        let rejected = item(2);
        match pq.enqueue(rejected.clone()) {
            Err(PushError::Full(back)) => assert!(back.same(&rejected)),
            Ok(()) => panic!("expected Full"),
        }
    }

    #[test]
    fn slots_always_match_positions() {
        let mut pq = heap(64);
        let handles: Vec<Handle> = (0..32).map(|i| item((i * 31) % 17)).collect();
        for h in &handles {
            pq.enqueue(h.clone()).expect("capacity");
        }
        // Delete a few from the middle, then verify every live element's
        // cached slot still points at itself.
        for victim in [&handles[5], &handles[20], &handles[31]] {
            let slot = victim.slot.get().expect("enqueued");
            pq.delete_at(victim, slot).expect("valid slot");
        }
        for h in handles.iter().filter(|h| h.slot.get().is_some()) {
            let slot = h.slot.get().expect("filtered");
            assert!(pq.items[slot].same(h));
        }
        assert_eq!(pq.len(), 29);
    }

    #[test]
    fn delete_at_rejects_stale_slots() {
        let mut pq = heap(8);
        let a = item(1);
        let b = item(2);
        pq.enqueue(a.clone()).expect("capacity");
        pq.enqueue(b.clone()).expect("capacity");
        assert_eq!(pq.delete_at(&a, 1), Err(PopError::Mismatch));
    }

    #[test]
    fn peek_is_stable_without_mutation() {
        let pq = MinHeap::new(8);
        pq.enqueue(item(42)).expect("capacity");
        assert_eq!(pq.peek(), 42);
        assert_eq!(pq.peek(), 42);
    }

    #[test]
    fn peek_reports_empty_sentinel() {
        let pq: MinHeap<Handle> = MinHeap::new(8);
        assert_eq!(pq.peek(), EMPTY_PRIORITY);
        pq.enqueue(item(3)).expect("capacity");
        pq.dequeue().expect("non-empty");
        assert_eq!(pq.peek(), EMPTY_PRIORITY);
    }

    #[test]
    fn remove_if_earlier_never_returns_late_work() {
        let pq = MinHeap::new(8);
        pq.enqueue(item(100)).expect("capacity");
        assert!(pq.remove_if_earlier(100).is_none());
        assert!(pq.remove_if_earlier(50).is_none());
        let got = pq.remove_if_earlier(101).expect("head earlier than target");
        assert_eq!(got.priority, 100);
    }

    #[test]
    fn new_top_callback_sees_every_head_change() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let pq = MinHeap::with_new_top_callback(
            8,
            Some(Box::new(move |_: &Handle| {
                let _ = seen_cb.fetch_add(1, Ordering::Relaxed);
            })),
        );
        pq.enqueue(item(10)).expect("capacity");
        pq.enqueue(item(5)).expect("capacity");
        pq.dequeue().expect("non-empty");
        assert!(seen.load(Ordering::Relaxed) >= 3);
    }
}
