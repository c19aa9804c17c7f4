// SPDX-License-Identifier: Apache-2.0

//! Guard-paged sandbox stacks.
//!
//! A stack grows down, so the guard page sits below the usable region and a
//! runaway recursion faults instead of corrupting its neighbor.

use crate::error::Error;
use crate::host_page_size;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A private stack for one sandbox.
pub struct WasmStack {
    buffer: NonNull<libc::c_void>,
    capacity: usize,
}

// SAFETY: exclusively owned by one sandbox; travels with the sandbox.
unsafe impl Send for WasmStack {}

impl WasmStack {
    /// Allocates a stack of `capacity` usable bytes above a guard page.
    /// `capacity` is rounded up to the host page size.
    pub fn allocate(capacity: usize) -> Result<Self, Error> {
        let page = host_page_size();
        let capacity = capacity.div_ceil(page) * page;
        let total = capacity + page;

        // SAFETY: anonymous private mapping with no backing file.
        let buffer = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(total).expect("guard page makes total non-zero"),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|source| Error::AllocationFailed {
            requested: total,
            source,
        })?;

        // SAFETY: the usable region sits wholly inside the fresh mapping,
        // one page above its base.
        let usable = unsafe { NonNull::new_unchecked(buffer.as_ptr().cast::<u8>().add(page)) };
        // SAFETY: protecting the usable region of our own mapping.
        unsafe { mprotect(usable.cast(), capacity, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
            .map_err(|source| {
                // SAFETY: unmapping the mapping we just created.
                let _ = unsafe { munmap(buffer, total) };
                Error::AllocationFailed {
                    requested: capacity,
                    source,
                }
            })?;

        Ok(Self { buffer, capacity })
    }

    /// Usable bytes, excluding the guard page.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest usable address, just above the guard page.
    #[must_use]
    pub fn low(&self) -> *mut u8 {
        // SAFETY: offset within the mapping.
        unsafe { self.buffer.as_ptr().cast::<u8>().add(host_page_size()) }
    }

    /// One past the highest usable address; execution starts here and grows
    /// down.
    #[must_use]
    pub fn high(&self) -> *mut u8 {
        // SAFETY: offset within the mapping (one past the end is allowed).
        unsafe { self.low().add(self.capacity) }
    }

    /// Zeroes the usable region so a pooled stack starts clean.
    pub fn reinit(&mut self) {
        // SAFETY: the usable region is RW and exclusively ours.
        unsafe { std::ptr::write_bytes(self.low(), 0, self.capacity) };
    }
}

impl Drop for WasmStack {
    fn drop(&mut self) {
        let total = self.capacity + host_page_size();
        // SAFETY: unmapping the mapping made in allocate().
        if unsafe { munmap(self.buffer, total) }.is_err() {
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_guard_below_usable_region() {
        let stack = WasmStack::allocate(64 * 1024).expect("mmap");
        assert_eq!(stack.capacity(), 64 * 1024);
        assert_eq!(stack.low() as usize % host_page_size(), 0);
        assert_eq!(stack.high() as usize - stack.low() as usize, stack.capacity());
    }

    #[test]
    fn usable_region_is_writable_after_reinit() {
        let mut stack = WasmStack::allocate(16 * 1024).expect("mmap");
        // SAFETY: low..high is RW.
        unsafe {
            *stack.low() = 0xAB;
            *stack.high().sub(1) = 0xCD;
        }
        stack.reinit();
        // SAFETY: same region.
        unsafe {
            assert_eq!(*stack.low(), 0);
            assert_eq!(*stack.high().sub(1), 0);
        }
    }

    #[test]
    fn odd_sizes_round_up_to_pages() {
        let stack = WasmStack::allocate(1000).expect("mmap");
        assert_eq!(stack.capacity() % host_page_size(), 0);
        assert!(stack.capacity() >= 1000);
    }
}
