// SPDX-License-Identifier: Apache-2.0

//! State transitions.
//!
//! Every transition runs the same bookkeeping: close the open interval of the
//! source state into its duration accumulator, stamp the new state, append to
//! the bounded history ring, and fire the registered from/to hooks. Illegal
//! transitions are programming errors and panic.
//!
//! Hooks are bare function pointers in atomics so the preemption signal
//! handler can fire them without taking a lock.

use super::Sandbox;
use super::state::{STATE_COUNT, SandboxState, SandboxState as S};
use sledge_rt_arch::cycles;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A transition hook. Runs inline in the transitioning thread, possibly
/// inside a signal handler; keep it async-signal-safe.
pub type TransitionHook = fn(&Sandbox, SandboxState);

const NO_HOOK: usize = 0;

static FROM_HOOKS: [AtomicUsize; STATE_COUNT] = [const { AtomicUsize::new(NO_HOOK) }; STATE_COUNT];
static TO_HOOKS: [AtomicUsize; STATE_COUNT] = [const { AtomicUsize::new(NO_HOOK) }; STATE_COUNT];

/// Registers a hook fired whenever a sandbox leaves `state`.
pub fn register_from_hook(state: SandboxState, hook: TransitionHook) {
    FROM_HOOKS[state.as_raw() as usize].store(hook as usize, Ordering::Release);
}

/// Registers a hook fired whenever a sandbox enters `state`.
pub fn register_to_hook(state: SandboxState, hook: TransitionHook) {
    TO_HOOKS[state.as_raw() as usize].store(hook as usize, Ordering::Release);
}

fn fire(table: &[AtomicUsize; STATE_COUNT], keyed_by: SandboxState, sandbox: &Sandbox, other: SandboxState) {
    let raw = table[keyed_by.as_raw() as usize].load(Ordering::Acquire);
    if raw != NO_HOOK {
        // SAFETY: only TransitionHook values are ever stored in the tables.
        let hook: TransitionHook = unsafe { std::mem::transmute::<usize, TransitionHook>(raw) };
        hook(sandbox, other);
    }
}

impl Sandbox {
    /// Closes the open interval of the current state and installs `to`.
    /// Returns the source state after validating it against `allowed`.
    fn transition(&self, to: SandboxState, allowed: &[SandboxState]) -> SandboxState {
        let from = self.state();
        assert!(
            allowed.contains(&from),
            "sandbox {} | illegal transition from {} to {}",
            self.id,
            from,
            to,
        );

        let now = cycles();
        let last = self.timestamps.last_state_change.swap(now, Ordering::AcqRel);
        self.add_duration(from, now.saturating_sub(last));
        self.store_state(to);
        self.record_history(to, now);

        tracing::trace!(sandbox = self.id, %from, %to, "state transition");
        fire(&FROM_HOOKS, from, self, to);
        fire(&TO_HOOKS, to, self, from);
        from
    }

    /// Uninitialized → Allocated: the struct and its resources exist.
    pub fn set_as_allocated(&self) {
        let _ = self.transition(S::Allocated, &[S::Uninitialized]);
    }

    /// Allocated → Initialized: ready for first dispatch.
    pub fn set_as_initialized(&self) {
        let _ = self.transition(S::Initialized, &[S::Allocated]);
    }

    /// → Runnable: queued and eligible to run. From Initialized on first
    /// dispatch, from Asleep on an epoll wake, from Preempted when a policy
    /// re-queues rather than resumes.
    pub fn set_as_runnable(&self) {
        let _ = self.transition(S::Runnable, &[S::Initialized, S::Asleep, S::Preempted]);
    }

    /// → RunningSys: executing host-side code. From Runnable when a worker
    /// picks it up, from RunningUser on a host call.
    pub fn set_as_running_sys(&self) {
        let _ = self.transition(S::RunningSys, &[S::Runnable, S::RunningUser]);
    }

    /// → RunningUser: executing guest code. From RunningSys when the host
    /// boundary returns, from Preempted via slow restore.
    pub fn set_as_running_user(&self) {
        let _ = self.transition(S::RunningUser, &[S::RunningSys, S::Preempted]);
    }

    /// RunningUser → Interrupted: the preemption signal landed and the
    /// machine state is being captured.
    pub fn set_as_interrupted(&self) {
        let _ = self.transition(S::Interrupted, &[S::RunningUser]);
    }

    /// Interrupted → Preempted: full context saved; resumable by slow
    /// restore.
    pub fn set_as_preempted(&self) {
        let _ = self.transition(S::Preempted, &[S::Interrupted]);
    }

    /// RunningSys → Asleep: a host call would block; parked until an epoll
    /// edge.
    pub fn set_as_asleep(&self) {
        let _ = self.transition(S::Asleep, &[S::RunningSys]);
    }

    /// RunningSys → Returned: the response is written. Releases the linear
    /// memory; the stack stays live because the sandbox may still be
    /// standing on it.
    ///
    /// # Safety
    ///
    /// Caller must be the owning thread (it is: the transition happens in
    /// sandbox context).
    pub unsafe fn set_as_returned(&self) {
        let _ = self.transition(S::Returned, &[S::RunningSys]);
        // SAFETY: owning-thread contract is this function's contract.
        unsafe { self.release_memory() };
    }

    /// Returned → Complete: terminal success. The caller pushes the sandbox
    /// onto the owning worker's cleanup list immediately after.
    pub fn set_as_complete(&self) {
        let _ = self.transition(S::Complete, &[S::Returned]);
        self.timestamps
            .completion
            .store(cycles(), Ordering::Release);
    }

    /// → Error: terminal failure, from any non-terminal state. Releases the
    /// linear memory if still held. The caller pushes the sandbox onto the
    /// owning worker's cleanup list (or drops it, if it never reached one).
    ///
    /// # Safety
    ///
    /// Caller must be the thread that currently owns the sandbox.
    pub unsafe fn set_as_error(&self) {
        let _ = self.transition(
            S::Error,
            &[
                S::Allocated,
                S::Initialized,
                S::Runnable,
                S::RunningSys,
                S::RunningUser,
                S::Interrupted,
                S::Preempted,
                S::Asleep,
                S::Returned,
            ],
        );
        // SAFETY: owning-thread contract is this function's contract.
        unsafe { self.release_memory() };
        self.timestamps
            .completion
            .store(cycles(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn happy_path_reaches_complete_with_closed_accounting() {
        let sandbox = testing::stub_sandbox();
        assert_eq!(sandbox.state(), S::Initialized);

        sandbox.set_as_runnable();
        sandbox.set_as_running_sys();
        sandbox.set_as_running_user();
        sandbox.set_as_running_sys();
        // SAFETY: the test thread owns the sandbox throughout.
        unsafe { sandbox.set_as_returned() };
        sandbox.set_as_complete();

        assert_eq!(sandbox.state(), S::Complete);
        assert!(sandbox.state().is_terminal());
        // SAFETY: still the owning thread.
        assert!(unsafe { sandbox.memory_released() });

        // Sum of per-state durations equals the span from allocation to the
        // last transition; the terminal state's interval is still open.
        let last_change = sandbox
            .timestamps
            .last_state_change
            .load(std::sync::atomic::Ordering::Acquire);
        assert_eq!(
            sandbox.total_accounted(),
            last_change - sandbox.timestamps.allocation,
        );
    }

    #[test]
    fn preemption_round_trip() {
        let sandbox = testing::stub_sandbox();
        sandbox.set_as_runnable();
        sandbox.set_as_running_sys();
        sandbox.set_as_running_user();
        sandbox.set_as_interrupted();
        sandbox.set_as_preempted();
        assert_eq!(sandbox.state(), S::Preempted);
        sandbox.set_as_running_user();
        assert_eq!(sandbox.state(), S::RunningUser);
        assert!(sandbox.duration_in(S::RunningUser) > 0);
    }

    #[test]
    fn history_keeps_the_most_recent_transitions() {
        let sandbox = testing::stub_sandbox();
        sandbox.set_as_runnable();
        sandbox.set_as_running_sys();
        for _ in 0..12 {
            sandbox.set_as_running_user();
            sandbox.set_as_running_sys();
        }
        let history = sandbox.history();
        assert_eq!(history.len(), super::super::STATE_HISTORY_CAPACITY);
        // Oldest-first ordering by timestamp.
        assert!(history.windows(2).all(|w| w[0].at <= w[1].at));
        assert_eq!(history.last().map(|e| e.state), Some(S::RunningSys));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn skipping_runnable_panics() {
        let sandbox = testing::stub_sandbox();
        sandbox.set_as_running_sys();
    }

    #[test]
    fn error_from_asleep_releases_memory() {
        let sandbox = testing::stub_sandbox();
        sandbox.set_as_runnable();
        sandbox.set_as_running_sys();
        sandbox.set_as_asleep();
        // SAFETY: the test thread owns the sandbox.
        unsafe { sandbox.set_as_error() };
        assert_eq!(sandbox.state(), S::Error);
        // SAFETY: still the owning thread.
        assert!(unsafe { sandbox.memory_released() });
    }

    #[test]
    fn hooks_observe_transitions() {
        use std::sync::atomic::AtomicU64;
        static TARGET: AtomicU64 = AtomicU64::new(0);
        static ENTERED_RUNNABLE: AtomicU32 = AtomicU32::new(0);
        // Hooks are global; count only our own sandbox so concurrent tests
        // cannot interfere.
        fn on_runnable(sandbox: &Sandbox, _from: SandboxState) {
            if sandbox.id == TARGET.load(Ordering::SeqCst) {
                let _ = ENTERED_RUNNABLE.fetch_add(1, Ordering::SeqCst);
            }
        }
        let sandbox = testing::stub_sandbox();
        TARGET.store(sandbox.id, Ordering::SeqCst);
        register_to_hook(S::Runnable, on_runnable);
        sandbox.set_as_runnable();
        assert_eq!(ENTERED_RUNNABLE.load(Ordering::SeqCst), 1);
    }
}
