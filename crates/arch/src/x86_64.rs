// SPDX-License-Identifier: Apache-2.0

//! The assembly half of the context switch.
//!
//! `sledge_context_switch` is an `extern "C"` routine defined in global
//! assembly rather than inline asm so it owns its whole frame: it pushes the
//! callee-saved registers, records `{rsp, rip}` in the outgoing fast bank,
//! and either jumps into a fast target or tail-calls the slow-restore
//! trampoline for a preempted one. A context saved here resumes at `3:`,
//! pops the callee-saved registers and returns to the original caller of the
//! switch.
//!
//! Offsets into `ArchContext` are fixed by `#[repr(C)]`: variant at 0, the
//! fast bank at 8 (sp) and 16 (ip). The variant values are compared directly
//! in the assembly, so [`super::ContextVariant`] must keep its integral
//! representation.

use super::context::ArchContext;
use core::cell::Cell;

std::arch::global_asm!(
    ".text",
    ".align 16",
    ".globl sledge_context_switch",
    ".type sledge_context_switch, @function",
    "sledge_context_switch:",
    // Spill the callee-saved set; the fast bank only records {rsp, rip} and
    // the resume path at 3: undoes these pushes.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // rdi = outgoing fast bank (nullable), rsi = target ArchContext.
    "test rdi, rdi",
    "jz 1f",
    "mov [rdi + 0], rsp",
    "lea rax, [rip + 3f]",
    "mov [rdi + 8], rax",
    "1:",
    "mov rax, [rsi + 0]",
    "cmp rax, 2", // ContextVariant::Slow
    "je 2f",
    // Fast target: mark running, adopt its stack, jump to its resume point.
    "mov qword ptr [rsi + 0], 3", // ContextVariant::Running
    "mov rsp, [rsi + 8]",
    "jmp qword ptr [rsi + 16]",
    "2:",
    // Slow target: the only way to reload a full machine context from user
    // space is sigreturn, so hand the target to the trampoline which raises
    // the restore signal. The handler redirects its own return straight into
    // the target, so the trampoline never comes back.
    "mov qword ptr [rsi + 0], 3",
    "mov rdi, rsi",
    "sub rsp, 8",
    "call sledge_slow_restore_trampoline",
    "ud2",
    "3:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size sledge_context_switch, . - sledge_context_switch",
);

extern "C" {
    /// Saves the current thread of control into `save` (fast bank, nullable)
    /// and resumes `target`.
    pub fn sledge_context_switch(save: *mut u64, target: *mut ArchContext);
}

thread_local! {
    /// Target of an in-flight slow restore, consumed by the restore-signal
    /// handler via [`super::apply_slow_restore`].
    pub(crate) static PENDING_SLOW_RESTORE: Cell<*mut ArchContext> =
        const { Cell::new(core::ptr::null_mut()) };
}

/// Called from the assembly above for slow targets. Publishes the target for
/// the restore-signal handler and raises the signal; if the handler is not
/// installed the process cannot continue, so this aborts.
#[no_mangle]
extern "C" fn sledge_slow_restore_trampoline(target: *mut ArchContext) -> ! {
    PENDING_SLOW_RESTORE.with(|slot| slot.set(target));
    // SAFETY: raising a signal at a known-good point; the handler rewrites
    // its own ucontext so a successful restore never returns here.
    unsafe {
        let _ = libc::raise(super::context::RESTORE_SIGNAL);
    }
    std::process::abort();
}
