// SPDX-License-Identifier: Apache-2.0

//! The context record and its save/restore operations.

use crate::x86_64::{PENDING_SLOW_RESTORE, sledge_context_switch};

/// The signal used to reload a slow context. Workers install the runtime's
/// restore handler for it and must keep it unblocked while switching.
pub const RESTORE_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Which register bank of a context is meaningful.
///
/// The discriminants are compared directly in the switch assembly; keep them
/// integral and in sync with `x86_64.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ContextVariant {
    /// Freshly zeroed; not a valid switch target.
    Unused = 0,
    /// Only `{sp, ip}` are valid: a fresh sandbox or a cooperative yield.
    Fast = 1,
    /// The full machine context is valid: the sandbox was preempted.
    Slow = 2,
    /// The context's thread of control is live; never a switch target.
    Running = 3,
}

/// A user-level execution context: a fast `{sp, ip}` bank plus a slow bank
/// holding the signal-time machine state.
///
/// Layout is `#[repr(C)]` because the switch assembly addresses the variant
/// and the fast bank by fixed offsets (0, 8, 16).
#[repr(C)]
pub struct ArchContext {
    variant: ContextVariant,
    regs: [u64; 2],
    mctx: libc::mcontext_t,
    fpstate: libc::_libc_fpstate,
    has_fpstate: bool,
}

impl Default for ArchContext {
    fn default() -> Self {
        Self::unused()
    }
}

impl ArchContext {
    /// An unused context. Not a valid switch target until [`Self::init`] or a
    /// slow save gives it content.
    #[must_use]
    pub fn unused() -> Self {
        // SAFETY: all-zero bytes are a valid representation of every field
        // (variant 0 is Unused, the mcontext banks are plain data).
        unsafe { std::mem::zeroed() }
    }

    /// Initializes the fast bank for a sandbox that has never run: execution
    /// will begin at `entry` on the stack topped by `stack_top`.
    ///
    /// The stored stack pointer is aligned so `entry` observes the stack
    /// layout the System V ABI guarantees just after a `call`.
    pub fn init(&mut self, entry: extern "C" fn() -> !, stack_top: *mut u8) {
        let sp = (stack_top as u64 & !0xF) - 8;
        self.regs = [sp, entry as usize as u64];
        self.variant = ContextVariant::Fast;
    }

    /// Current variant.
    #[must_use]
    pub fn variant(&self) -> ContextVariant {
        self.variant
    }

    /// Forces the variant. Used by the worker when it adopts a context whose
    /// thread of control arrived by sigreturn rather than through
    /// [`Self::switch`].
    pub fn set_variant(&mut self, variant: ContextVariant) {
        self.variant = variant;
    }

    /// Instruction pointer of the fast bank (diagnostics only).
    #[must_use]
    pub fn fast_ip(&self) -> u64 {
        self.regs[1]
    }

    /// Suspends the calling thread of control into `from` (as a fast context)
    /// and resumes `to`.
    ///
    /// `from` is `None` when the caller is abandoning its context (a sandbox
    /// that exited). A `Slow` target is resumed by the restore-signal dance;
    /// control then continues inside the target, and the caller's saved
    /// context resumes only when something later switches back to it.
    ///
    /// # Panics
    ///
    /// Panics when `to` is `Running` (its thread of control is live) or
    /// `Unused`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `to` owns a live stack, that no other
    /// thread resumes either context concurrently, and that preemption is
    /// disabled for the duration of the switch.
    pub unsafe fn switch(from: Option<&mut ArchContext>, to: &mut ArchContext) {
        assert!(
            to.variant == ContextVariant::Fast || to.variant == ContextVariant::Slow,
            "context switch target must be Fast or Slow, was {:?}",
            to.variant,
        );
        let save = match from {
            Some(ctx) => {
                ctx.variant = ContextVariant::Fast;
                ctx.regs.as_mut_ptr()
            }
            None => core::ptr::null_mut(),
        };
        // SAFETY: offsets validated by the repr(C) layout; preconditions are
        // the caller's per the function contract.
        unsafe { sledge_context_switch(save, to as *mut ArchContext) };
    }

    /// Captures the full machine state of an interrupted sandbox from the
    /// signal handler's `ucontext`. The floating-point state is copied out of
    /// the signal frame, which dies when the handler returns.
    pub fn mcontext_save(&mut self, uc: &libc::ucontext_t) {
        self.mctx = uc.uc_mcontext;
        self.has_fpstate = !uc.uc_mcontext.fpregs.is_null();
        if self.has_fpstate {
            // SAFETY: non-null fpregs points into the live signal frame.
            self.fpstate = unsafe { *uc.uc_mcontext.fpregs };
        }
        self.variant = ContextVariant::Slow;
    }

    /// Reloads the saved machine state into the handler's `ucontext` so the
    /// kernel resumes the sandbox on return from the handler. The frame's own
    /// fpstate buffer is kept and overwritten in place.
    pub fn mcontext_restore(&self, uc: &mut libc::ucontext_t) {
        let live_fpregs = uc.uc_mcontext.fpregs;
        uc.uc_mcontext = self.mctx;
        uc.uc_mcontext.fpregs = live_fpregs;
        if self.has_fpstate && !live_fpregs.is_null() {
            // SAFETY: the frame's fpstate buffer is live for the handler.
            unsafe { *live_fpregs = self.fpstate };
        }
    }

    /// Redirects the handler's `ucontext` to this context's fast bank, used
    /// when the preemption handler dispatches a sandbox that yielded
    /// cooperatively (or never ran).
    pub fn fast_restore_into(&self, uc: &mut libc::ucontext_t) {
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = self.regs[0] as libc::greg_t;
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = self.regs[1] as libc::greg_t;
    }
}

/// Completes an in-flight slow restore from inside the restore-signal
/// handler: consumes the pending target published by the switch path and
/// rewrites `uc` so sigreturn lands in the target context.
///
/// Returns `false` when no restore is pending (a stray signal), in which case
/// `uc` is untouched.
///
/// # Safety
///
/// Must be called from the restore-signal handler with the `ucontext`
/// argument the kernel passed to it.
pub unsafe fn apply_slow_restore(uc: *mut libc::ucontext_t) -> bool {
    let target = PENDING_SLOW_RESTORE.with(|slot| slot.replace(core::ptr::null_mut()));
    if target.is_null() {
        return false;
    }
    // SAFETY: target was published by the switch trampoline on this thread
    // and uc is the live handler frame per the function contract.
    unsafe {
        (*target).mcontext_restore(&mut *uc);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn init_sets_fast_bank_and_alignment() {
        extern "C" fn never() -> ! {
            unreachable!()
        }
        let mut stack = vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let mut ctx = ArchContext::unused();
        assert_eq!(ctx.variant(), ContextVariant::Unused);
        ctx.init(never, top);
        assert_eq!(ctx.variant(), ContextVariant::Fast);
        assert_eq!(ctx.fast_ip(), never as usize as u64);
        // One slot below a 16-byte boundary, as if entered by a call.
        assert_eq!(ctx.regs[0] % 16, 8);
        assert!(ctx.regs[0] < top as u64);
    }

    // The cooperative round trip: main saves itself, runs a guest entry on a
    // private stack, and the guest switches back.
    static BASE: AtomicUsize = AtomicUsize::new(0);
    static GUEST: AtomicUsize = AtomicUsize::new(0);
    static ENTERED: AtomicU32 = AtomicU32::new(0);

    extern "C" fn guest_entry() -> ! {
        let _ = ENTERED.fetch_add(1, Ordering::SeqCst);
        let base = BASE.load(Ordering::SeqCst) as *mut ArchContext;
        let guest = GUEST.load(Ordering::SeqCst) as *mut ArchContext;
        unsafe {
            ArchContext::switch(Some(&mut *guest), &mut *base);
        }
        unreachable!("guest context is never resumed");
    }

    #[test]
    fn fast_switch_round_trip_returns_to_caller() {
        let mut stack = vec![0u8; 128 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };

        let mut base = Box::new(ArchContext::unused());
        let mut guest = Box::new(ArchContext::unused());
        guest.init(guest_entry, top);

        BASE.store(base.as_mut() as *mut ArchContext as usize, Ordering::SeqCst);
        GUEST.store(guest.as_mut() as *mut ArchContext as usize, Ordering::SeqCst);

        unsafe {
            ArchContext::switch(Some(&mut base), &mut guest);
        }

        assert_eq!(ENTERED.load(Ordering::SeqCst), 1);
        // The guest marked itself Fast on its way out; our own context was
        // marked Running by the switch back into it.
        assert_eq!(base.variant(), ContextVariant::Running);
        assert_eq!(guest.variant(), ContextVariant::Fast);
    }

    #[test]
    #[should_panic(expected = "context switch target")]
    fn running_context_is_never_a_target() {
        let mut from = ArchContext::unused();
        let mut to = ArchContext::unused();
        to.variant = ContextVariant::Running;
        unsafe { ArchContext::switch(Some(&mut from), &mut to) };
    }
}
