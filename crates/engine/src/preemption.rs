// SPDX-License-Identifier: Apache-2.0

//! The preemption signal fabric.
//!
//! A process-wide interval timer fires SIGALRM every quantum. The first
//! thread to receive the kernel-generated signal rebroadcasts it to every
//! worker with `pthread_kill`; each worker's handler then consults the
//! scheduler ([`crate::scheduler::preempt`]) unless the worker was inside the
//! scheduler already, in which case the tick is deferred and counted. SIGUSR1
//! carries the slow-restore half of the context switch.

use crate::{current, runtime, scheduler};
use sledge_rt_arch::RESTORE_SIGNAL;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

thread_local! {
    static IN_SCHEDULER: Cell<bool> = const { Cell::new(false) };
    static DEFERRED: Cell<u64> = const { Cell::new(0) };
}

/// Largest run of deferred ticks any thread has accumulated, a health signal
/// for oversized scheduler sections.
pub static DEFERRED_SIGALRM_MAX: AtomicU64 = AtomicU64::new(0);

/// RAII marker for "this thread is inside the scheduler": while held, the
/// SIGALRM handler defers instead of re-entering queue code.
pub struct SchedulerGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Enters the scheduler section.
#[must_use]
pub fn enter_scheduler() -> SchedulerGuard {
    IN_SCHEDULER.with(|f| f.set(true));
    SchedulerGuard {
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let deferred = DEFERRED.with(|d| d.replace(0));
        if deferred > 0 {
            let _ = DEFERRED_SIGALRM_MAX.fetch_max(deferred, Ordering::AcqRel);
        }
        IN_SCHEDULER.with(|f| f.set(false));
    }
}

/// True while the calling thread holds a [`SchedulerGuard`].
#[must_use]
pub fn in_scheduler() -> bool {
    IN_SCHEDULER.with(Cell::get)
}

extern "C" fn sigalrm_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    // A kernel-generated tick is rebroadcast to every worker; the targeted
    // pthread_kill copies arrive with a different si_code and are handled
    // locally.
    // SAFETY: info is the kernel-provided siginfo.
    let from_kernel = unsafe { (*info).si_code } == libc::SI_KERNEL;
    let rt = match runtime::try_get() {
        Some(rt) => rt,
        None => return,
    };
    if from_kernel {
        for worker in &rt.workers {
            worker.interrupt();
        }
        return;
    }

    let Some(index) = current::worker_index() else {
        return;
    };
    if in_scheduler() {
        DEFERRED.with(|d| d.set(d.get() + 1));
        return;
    }
    let guard = enter_scheduler();
    let worker = &rt.workers[index];
    // SAFETY: we are in the SIGALRM handler of a worker thread with the
    // in-scheduler flag held; uc is the kernel-provided ucontext.
    unsafe { scheduler::preempt(rt, worker, uc.cast::<libc::ucontext_t>()) };
    drop(guard);
}

extern "C" fn restore_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    // SAFETY: called as the restore-signal handler with the kernel-provided
    // ucontext.
    let applied = unsafe { sledge_rt_arch::apply_slow_restore(uc.cast::<libc::ucontext_t>()) };
    if !applied {
        // A stray restore signal with nothing pending is harmless.
        debug!("restore signal with no pending slow restore");
    }
}

/// Installs the SIGALRM and restore-signal handlers process-wide.
pub fn install_handlers() -> Result<(), crate::error::Error> {
    // SAFETY: zeroed sigaction is a valid starting point; handler pointers
    // outlive the process.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        sa.sa_sigaction = sigalrm_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGALRM, &sa, std::ptr::null_mut()) != 0 {
            return Err(crate::error::Error::Setup {
                detail: "sigaction SIGALRM",
                source: nix::Error::last(),
            });
        }

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        sa.sa_sigaction = restore_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(RESTORE_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            return Err(crate::error::Error::Setup {
                detail: "sigaction restore signal",
                source: nix::Error::last(),
            });
        }
    }
    Ok(())
}

/// Arms the process-wide quantum timer.
pub fn arm_timer(quantum_us: u64) -> Result<(), crate::error::Error> {
    let interval = libc::timeval {
        tv_sec: (quantum_us / 1_000_000) as libc::time_t,
        tv_usec: (quantum_us % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    // SAFETY: plain syscall with a valid itimerval.
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } != 0 {
        return Err(crate::error::Error::Setup {
            detail: "setitimer",
            source: nix::Error::last(),
        });
    }
    Ok(())
}

/// Disarms the quantum timer (shutdown paths).
pub fn disarm_timer() {
    let zero = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let timer = libc::itimerval {
        it_interval: zero,
        it_value: zero,
    };
    // SAFETY: plain syscall with a valid itimerval.
    let _ = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
}

/// Unblocks SIGALRM and the restore signal on the calling thread. Workers
/// and the listener call this once at startup; other threads keep both
/// blocked.
pub fn unblock_worker_signals() {
    use nix::sys::signal::{SigSet, Signal};
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    set.add(Signal::SIGUSR1);
    let _ = set.thread_unblock();
}

/// Blocks SIGALRM and the restore signal on the calling thread.
pub fn block_worker_signals() {
    use nix::sys::signal::{SigSet, Signal};
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    set.add(Signal::SIGUSR1);
    let _ = set.thread_block();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_guard_tracks_deferred_ticks() {
        assert!(!in_scheduler());
        let guard = enter_scheduler();
        assert!(in_scheduler());
        DEFERRED.with(|d| d.set(3));
        drop(guard);
        assert!(!in_scheduler());
        assert!(DEFERRED_SIGALRM_MAX.load(Ordering::Acquire) >= 3);
        // The per-thread counter was consumed.
        assert_eq!(DEFERRED.with(Cell::get), 0);
    }
}
