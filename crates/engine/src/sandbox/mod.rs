// SPDX-License-Identifier: Apache-2.0

//! The sandbox: one in-flight request's guest environment and the unit of
//! scheduling.

pub mod state;
pub mod transition;

use crate::module::Module;
use crate::session::HttpSession;
use crate::tenant::{Route, Tenant};
use intrusive_collections::{LinkedListLink, intrusive_adapter};
use sledge_rt_arch::ArchContext;
use sledge_rt_scheduler::QueueItem;
use sledge_rt_wasm::globals::WasmGlobals;
use sledge_rt_wasm::memory::LinearMemory;
use sledge_rt_wasm::stack::WasmStack;
use sledge_rt_wasm::trap::Trap;
use state::{STATE_COUNT, SandboxState};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU64, AtomicUsize, Ordering};

/// Sentinel for "not in any heap".
pub const NO_HEAP_SLOT: usize = usize::MAX;

/// Sentinel for "not owned by any worker".
pub const NO_WORKER: usize = usize::MAX;

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

/// Resources and mutable working set touched only by the thread that
/// currently owns the sandbox: the dispatcher before handoff, then exactly
/// one worker and its signal handler, never two threads at once.
pub struct SandboxBody {
    /// Register context; the signal handler saves into and restores from it.
    pub ctx: ArchContext,
    /// Guest linear memory; `None` once released on Returned/Error.
    pub memory: Option<LinearMemory>,
    /// The sandbox's execution stack; lives until teardown.
    pub stack: Option<WasmStack>,
    /// Spilled guest globals.
    pub globals: WasmGlobals,
    /// The client session; consumed when the response is fully sent.
    pub session: Option<HttpSession>,
    /// Guest trap, if one was raised.
    pub trap: Option<Trap>,
    /// Guest `entrypoint` return value (or `proc_exit` code).
    pub return_value: i32,
    /// Bytes the guest wrote to stdout; becomes the response body.
    pub response_body: Vec<u8>,
    /// Read cursor of the guest's stdin view of the request body.
    pub request_cursor: usize,
}

/// Timestamps of the lifecycle milestones, in cycles.
#[derive(Debug)]
pub struct SandboxTimestamps {
    /// When the sandbox was allocated.
    pub allocation: u64,
    /// When it first landed on a worker's run queue.
    pub dispatched: AtomicU64,
    /// When it reached a terminal state.
    pub completion: AtomicU64,
    /// When the current state was entered; "the open timestamp".
    pub last_state_change: AtomicU64,
    /// When the current dispatch started running (Shinjuku's aging clock).
    pub last_run_start: AtomicU64,
    /// Anchor of the last execution-budget charge.
    pub last_charge: AtomicU64,
}

/// One bounded-history record of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHistoryEntry {
    /// The state entered.
    pub state: SandboxState,
    /// Cycle timestamp of the transition.
    pub at: u64,
}

/// Bounded ring of the most recent transitions, for post-mortems.
#[derive(Debug, Default)]
pub struct StateHistory {
    entries: Vec<StateHistoryEntry>,
    next: usize,
}

/// Capacity of the transition history ring.
pub const STATE_HISTORY_CAPACITY: usize = 16;

impl StateHistory {
    /// Appends a record, overwriting the oldest once full.
    pub fn append(&mut self, state: SandboxState, at: u64) {
        let entry = StateHistoryEntry { state, at };
        if self.entries.len() < STATE_HISTORY_CAPACITY {
            self.entries.push(entry);
        } else {
            self.entries[self.next] = entry;
        }
        self.next = (self.next + 1) % STATE_HISTORY_CAPACITY;
    }

    /// The records, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<StateHistoryEntry> {
        if self.entries.len() < STATE_HISTORY_CAPACITY {
            self.entries.clone()
        } else {
            let (tail, head) = self.entries.split_at(self.next);
            head.iter().chain(tail).copied().collect()
        }
    }
}

/// One in-flight request's instantiated guest environment.
pub struct Sandbox {
    /// Unique id, assigned at allocation.
    pub id: u64,
    /// The module this sandbox instantiates.
    pub module: Arc<Module>,
    /// The route that admitted the request.
    pub route: Arc<Route>,
    /// The owning tenant.
    pub tenant: Arc<Tenant>,

    state: AtomicU8,
    /// Current queue key; meaning depends on the scheduling policy.
    priority: AtomicU64,
    /// Absolute deadline in cycles.
    pub absolute_deadline: u64,
    /// Estimated total execution cost in cycles.
    pub estimated_cost: u64,
    /// Remaining execution budget in cycles.
    pub remaining_exec: AtomicU64,
    /// Unitless admission estimate charged against process capacity.
    pub admissions_estimate: u64,

    response_code: AtomicU16,
    /// Lifecycle milestone timestamps.
    pub timestamps: SandboxTimestamps,
    durations: [AtomicU64; STATE_COUNT],
    history: parking_lot::Mutex<StateHistory>,

    heap_slot: AtomicUsize,
    owner_worker: AtomicUsize,
    shed_requested: AtomicBool,
    /// Set once actual execution exceeds the route estimate.
    pub exceeded_estimation: AtomicBool,

    /// Intrusive hook for the FIFO run queue or the cleanup list; a sandbox
    /// is on at most one such list, which the link type enforces.
    pub list_link: LinkedListLink,

    body: UnsafeCell<SandboxBody>,
}

// SAFETY: every field is either atomic, internally locked, or lives in
// `body`, which is touched only by the single thread that owns the sandbox at
// that point of its lifecycle (dispatcher until handoff, then the worker it
// was placed on, including that worker's signal handler).
unsafe impl Send for Sandbox {}
unsafe impl Sync for Sandbox {}

intrusive_adapter!(pub ListAdapter = Arc<Sandbox>: Sandbox { list_link: LinkedListLink });

impl Sandbox {
    /// Allocates the full guest environment for one admitted request: the
    /// struct, the linear memory reservation, the stack, and the globals.
    /// Leaves the sandbox in `Initialized`, consuming the session per the
    /// single-owner rule. On failure the session is handed back so the
    /// caller can still answer the client.
    pub fn allocate(
        route: &Arc<Route>,
        tenant: &Arc<Tenant>,
        session: HttpSession,
        admissions_estimate: u64,
        now: u64,
    ) -> Result<Arc<Self>, (crate::error::Error, HttpSession)> {
        let module = route.module.clone();
        let memory = match LinearMemory::allocate(
            module.initial_memory_bytes(),
            module.max_memory_bytes(),
        ) {
            Ok(memory) => memory,
            Err(e) => return Err((e.into(), session)),
        };
        let stack = match WasmStack::allocate(module.stack_size()) {
            Ok(stack) => stack,
            Err(e) => return Err((e.into(), session)),
        };
        let globals = WasmGlobals::new(module.globals_count());

        let sandbox = Arc::new(Self {
            id: NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed),
            module,
            route: route.clone(),
            tenant: tenant.clone(),
            state: AtomicU8::new(SandboxState::Uninitialized.as_raw()),
            priority: AtomicU64::new(u64::MAX),
            absolute_deadline: now + route.relative_deadline_cycles,
            estimated_cost: route.estimated_cost_cycles,
            remaining_exec: AtomicU64::new(route.estimated_cost_cycles),
            admissions_estimate,
            response_code: AtomicU16::new(0),
            timestamps: SandboxTimestamps {
                allocation: now,
                dispatched: AtomicU64::new(0),
                completion: AtomicU64::new(0),
                last_state_change: AtomicU64::new(now),
                last_run_start: AtomicU64::new(0),
                last_charge: AtomicU64::new(0),
            },
            durations: Default::default(),
            history: parking_lot::Mutex::new(StateHistory::default()),
            heap_slot: AtomicUsize::new(NO_HEAP_SLOT),
            owner_worker: AtomicUsize::new(NO_WORKER),
            shed_requested: AtomicBool::new(false),
            exceeded_estimation: AtomicBool::new(false),
            list_link: LinkedListLink::new(),
            body: UnsafeCell::new(SandboxBody {
                ctx: ArchContext::unused(),
                memory: Some(memory),
                stack: Some(stack),
                globals,
                session: Some(session),
                trap: None,
                return_value: 0,
                response_body: Vec::new(),
                request_cursor: 0,
            }),
        });

        sandbox.set_as_allocated();
        sandbox.set_as_initialized();
        Ok(sandbox)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        SandboxState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn store_state(&self, state: SandboxState) {
        self.state.store(state.as_raw(), Ordering::Release);
    }

    /// Current queue key.
    #[must_use]
    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::Acquire)
    }

    /// Sets the queue key. Must not be called while the sandbox sits in an
    /// ordered store.
    pub fn set_priority(&self, priority: u64) {
        self.priority.store(priority, Ordering::Release);
    }

    /// The response code chosen for this sandbox, if any yet.
    #[must_use]
    pub fn response_code(&self) -> Option<crate::response::ResponseCode> {
        match self.response_code.load(Ordering::Acquire) {
            0 => None,
            code => Some(crate::response::ResponseCode(code)),
        }
    }

    /// Records the response code; the first write wins so an early rejection
    /// is not masked by later cleanup.
    pub fn set_response_code(&self, code: crate::response::ResponseCode) {
        let _ = self.response_code.compare_exchange(
            0,
            code.as_u16(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Worker index this sandbox is placed on, if any.
    #[must_use]
    pub fn owner_worker(&self) -> Option<usize> {
        match self.owner_worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            idx => Some(idx),
        }
    }

    /// Records (or clears) the owning worker.
    pub fn set_owner_worker(&self, worker: Option<usize>) {
        self.owner_worker
            .store(worker.unwrap_or(NO_WORKER), Ordering::Release);
    }

    /// Marks this sandbox for shedding; honored at the next scheduler entry.
    pub fn request_shed(&self) {
        self.shed_requested.store(true, Ordering::Release);
    }

    /// Consumes a pending shed request.
    pub fn take_shed_request(&self) -> bool {
        self.shed_requested.swap(false, Ordering::AcqRel)
    }

    /// Charges `cycles` of execution against the remaining budget, returning
    /// the new remainder. Saturates at zero and flags overshoot.
    pub fn consume_exec(&self, cycles: u64) -> u64 {
        let mut current = self.remaining_exec.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(cycles);
            match self.remaining_exec.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == 0 && cycles > 0 {
                        self.exceeded_estimation.store(true, Ordering::Release);
                    }
                    return next;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Accumulated time spent in `state`, in cycles.
    #[must_use]
    pub fn duration_in(&self, state: SandboxState) -> u64 {
        self.durations[state.as_raw() as usize].load(Ordering::Acquire)
    }

    pub(crate) fn add_duration(&self, state: SandboxState, cycles: u64) {
        self.durations[state.as_raw() as usize].fetch_add(cycles, Ordering::AcqRel);
    }

    /// Sum of all per-state accumulators; equals the open-interval-adjusted
    /// lifetime at every instant.
    #[must_use]
    pub fn total_accounted(&self) -> u64 {
        self.durations
            .iter()
            .map(|d| d.load(Ordering::Acquire))
            .sum()
    }

    /// Snapshot of the transition history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<StateHistoryEntry> {
        self.history.lock().entries()
    }

    pub(crate) fn record_history(&self, state: SandboxState, at: u64) {
        self.history.lock().append(state, at);
    }

    /// Exclusive access to the owner-thread working set.
    ///
    /// # Safety
    ///
    /// The caller must be the thread that currently owns the sandbox and must
    /// not let two references to the body coexist (in particular, not across
    /// a point where the preemption handler could run and take its own).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn body_mut(&self) -> &mut SandboxBody {
        // SAFETY: per the function contract.
        unsafe { &mut *self.body.get() }
    }

    /// Releases the linear memory, on the Returned/Error transitions. The
    /// stack stays live: the sandbox may still be standing on it.
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Self::body_mut`].
    pub unsafe fn release_memory(&self) {
        // SAFETY: per the function contract.
        let body = unsafe { self.body_mut() };
        body.memory = None;
    }

    /// True once the linear memory has been released.
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Self::body_mut`].
    #[must_use]
    pub unsafe fn memory_released(&self) -> bool {
        // SAFETY: per the function contract.
        unsafe { self.body_mut().memory.is_none() }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("route", &self.route.config.route)
            .field("absolute_deadline", &self.absolute_deadline)
            .finish_non_exhaustive()
    }
}

impl QueueItem for Arc<Sandbox> {
    fn priority(&self) -> u64 {
        Sandbox::priority(self)
    }

    fn cost(&self) -> u64 {
        self.remaining_exec.load(Ordering::Acquire)
    }

    fn set_heap_slot(&self, slot: Option<usize>) {
        self.heap_slot
            .store(slot.unwrap_or(NO_HEAP_SLOT), Ordering::Release);
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl Sandbox {
    /// The heap slot recorded by the store's index callback, if any.
    #[must_use]
    pub fn heap_slot(&self) -> Option<usize> {
        match self.heap_slot.load(Ordering::Acquire) {
            NO_HEAP_SLOT => None,
            slot => Some(slot),
        }
    }
}
