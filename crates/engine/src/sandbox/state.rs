// SPDX-License-Identifier: Apache-2.0

//! Sandbox lifecycle states.

/// The states a sandbox moves through between allocation and teardown.
///
/// Stored as a `u8` atomic inside the sandbox; the discriminants index the
/// per-state duration accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SandboxState {
    /// Struct exists, resources not yet attached.
    Uninitialized = 0,
    /// Linear memory, stack, and HTTP buffers are attached.
    Allocated = 1,
    /// Ready for its first dispatch; context points at the entry trampoline.
    Initialized = 2,
    /// On a run queue, waiting to be (re)started.
    Runnable = 3,
    /// Executing host-side code on its own stack (never preempted).
    RunningSys = 4,
    /// Executing guest code; the only preemptable state.
    RunningUser = 5,
    /// Stopped by the preemption signal, machine state being captured.
    Interrupted = 6,
    /// Full context saved; waiting to be resumed by slow restore.
    Preempted = 7,
    /// Parked on a blocking host call until an epoll edge wakes it.
    Asleep = 8,
    /// Guest finished and the response is written; memory released.
    Returned = 9,
    /// Terminal success; sitting on the owning worker's cleanup list.
    Complete = 10,
    /// Terminal failure; sitting on the owning worker's cleanup list.
    Error = 11,
}

/// Number of states, sizing the duration accumulators.
pub const STATE_COUNT: usize = 12;

impl SandboxState {
    /// Decodes the atomic representation.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Allocated,
            2 => Self::Initialized,
            3 => Self::Runnable,
            4 => Self::RunningSys,
            5 => Self::RunningUser,
            6 => Self::Interrupted,
            7 => Self::Preempted,
            8 => Self::Asleep,
            9 => Self::Returned,
            10 => Self::Complete,
            11 => Self::Error,
            _ => unreachable!("corrupt sandbox state {raw}"),
        }
    }

    /// The atomic representation.
    #[must_use]
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    /// Complete and Error admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Only guest execution may be interrupted by the preemption timer;
    /// every other state is entered and left with preemption effectively
    /// disabled.
    #[must_use]
    pub fn is_preemptable(self) -> bool {
        matches!(self, Self::RunningUser)
    }

    /// True for both running flavors.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::RunningSys | Self::RunningUser)
    }

    /// Stable label for logs and perf records.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Allocated => "allocated",
            Self::Initialized => "initialized",
            Self::Runnable => "runnable",
            Self::RunningSys => "running_sys",
            Self::RunningUser => "running_user",
            Self::Interrupted => "interrupted",
            Self::Preempted => "preempted",
            Self::Asleep => "asleep",
            Self::Returned => "returned",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for raw in 0..STATE_COUNT as u8 {
            assert_eq!(SandboxState::from_raw(raw).as_raw(), raw);
        }
    }

    #[test]
    fn only_running_user_is_preemptable() {
        for raw in 0..STATE_COUNT as u8 {
            let state = SandboxState::from_raw(raw);
            assert_eq!(state.is_preemptable(), state == SandboxState::RunningUser);
        }
    }
}
