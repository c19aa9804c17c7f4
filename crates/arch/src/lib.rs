// SPDX-License-Identifier: Apache-2.0

//! User-level register contexts for sandbox switching.
//!
//! A sandbox suspends in one of two shapes. A *fast* context holds only a
//! stack pointer and an instruction pointer: it is enough for a sandbox that
//! has never run, or one that stopped at a cooperative yield point, because
//! everything else it needs lives in its stack frames. A *slow* context holds
//! the full machine state captured by the kernel when a timer signal landed in
//! the middle of guest code.
//!
//! Restoring a slow context from user space is only possible by letting the
//! kernel do it on return from a signal handler. That dance is hidden here:
//! [`ArchContext::switch`] self-raises the restore signal for slow targets and
//! the runtime's handler finishes the job through [`apply_slow_restore`].
//! Nothing outside this crate depends on the mechanism being signal-based.
//!
//! x86-64 Linux only. Scheduling across heterogeneous ISAs is explicitly out
//! of scope, and the register banks and assembly below encode the System V
//! ABI directly.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("sledge-rt-arch supports x86-64 Linux only");

mod context;
mod x86_64;

pub use context::{ArchContext, ContextVariant, RESTORE_SIGNAL, apply_slow_restore};

/// Reads the CPU cycle counter. All deadlines, budgets and state durations in
/// the runtime are expressed in these units.
#[inline]
#[must_use]
pub fn cycles() -> u64 {
    // SAFETY: rdtsc has no preconditions on x86-64.
    unsafe { core::arch::x86_64::_rdtsc() }
}
