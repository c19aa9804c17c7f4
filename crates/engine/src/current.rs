// SPDX-License-Identifier: Apache-2.0

//! Per-thread "current sandbox" and worker identity.
//!
//! The ABI shims sit between native module code and the runtime and must
//! reach the executing sandbox in O(1) without arguments; the preemption
//! handler must do the same without allocating or locking. Both read a raw
//! thread-local pointer kept alive by an owning slot that is set on sandbox
//! enter and cleared on exit.

use crate::sandbox::Sandbox;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    static CURRENT_PTR: Cell<*const Sandbox> = const { Cell::new(std::ptr::null()) };
    static CURRENT_OWNED: RefCell<Option<Arc<Sandbox>>> = const { RefCell::new(None) };
    static WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Installs `sandbox` as this thread's current sandbox.
pub fn set_current(sandbox: &Arc<Sandbox>) {
    CURRENT_PTR.with(|p| p.set(Arc::as_ptr(sandbox)));
    CURRENT_OWNED.with(|o| *o.borrow_mut() = Some(sandbox.clone()));
}

/// Clears the current sandbox, returning the owned handle if one was set.
pub fn clear_current() -> Option<Arc<Sandbox>> {
    CURRENT_PTR.with(|p| p.set(std::ptr::null()));
    CURRENT_OWNED.with(|o| o.borrow_mut().take())
}

/// The current sandbox as an owned handle. Not for use inside signal
/// handlers (it clones an `Arc`); handlers use [`current_ptr`].
#[must_use]
pub fn current() -> Option<Arc<Sandbox>> {
    CURRENT_OWNED.with(|o| o.borrow().clone())
}

/// Raw pointer to the current sandbox, readable from a signal handler. Valid
/// while the owning slot keeps the sandbox alive, which the worker guarantees
/// between set and clear.
#[must_use]
pub fn current_ptr() -> *const Sandbox {
    CURRENT_PTR.with(Cell::get)
}

/// Marks this thread as worker `index`.
pub fn set_worker_index(index: usize) {
    WORKER_INDEX.with(|w| w.set(index));
}

/// This thread's worker index, if it is a worker.
#[must_use]
pub fn worker_index() -> Option<usize> {
    let idx = WORKER_INDEX.with(Cell::get);
    (idx != usize::MAX).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn current_lifecycle_set_get_clear() {
        assert!(current().is_none());
        assert!(current_ptr().is_null());

        let sandbox = testing::stub_sandbox();
        set_current(&sandbox);
        assert_eq!(current_ptr(), Arc::as_ptr(&sandbox));
        assert_eq!(current().map(|s| s.id), Some(sandbox.id));

        let back = clear_current().expect("was set");
        assert_eq!(back.id, sandbox.id);
        assert!(current_ptr().is_null());
        assert!(current().is_none());
    }

    #[test]
    fn worker_index_defaults_to_none() {
        assert_eq!(worker_index(), None);
        set_worker_index(3);
        assert_eq!(worker_index(), Some(3));
        set_worker_index(usize::MAX);
    }
}
