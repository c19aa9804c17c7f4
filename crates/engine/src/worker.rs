// SPDX-License-Identifier: Apache-2.0

//! Worker threads.
//!
//! Each worker pins itself to a core and drives sandboxes cooperatively: it
//! picks the scheduler's head, fast-switches into fresh or yielded sandboxes
//! and slow-restores preempted ones, and cleans up after the ones that
//! finished. All sandbox-side suspension points (blocking host calls, guest
//! exit, traps) live here too, because they run on the sandbox's own stack
//! and must hand control back to the worker's base context themselves.

use crate::current;
use crate::preemption;
use crate::response::ResponseCode;
use crate::rings::WorkerToListener;
use crate::runtime::{self, Runtime, WorkerHandle};
use crate::sandbox::Sandbox;
use crate::sandbox::state::SandboxState;
use crate::scheduler;
use crate::session::Progress;
use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};
use sledge_rt_arch::{ArchContext, ContextVariant, cycles};
use sledge_rt_wasm::trap::Trap;
use std::cell::UnsafeCell;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

thread_local! {
    static BASE_CTX: UnsafeCell<ArchContext> = UnsafeCell::new(ArchContext::unused());
}

/// This worker thread's base context.
pub(crate) fn base_context() -> *mut ArchContext {
    BASE_CTX.with(UnsafeCell::get)
}

/// Lands the handler's return in the worker's base loop, used when the
/// running sandbox was killed and nothing else is runnable.
///
/// # Safety
///
/// Handler context on a worker thread whose base context is suspended in a
/// switch; `uc` is the live handler frame.
pub unsafe fn restore_base_into_ucontext(uc: *mut libc::ucontext_t) {
    // SAFETY: base context address is stable for the thread's lifetime.
    let base = unsafe { &mut *base_context() };
    assert_eq!(base.variant(), ContextVariant::Fast, "base context not suspended");
    // SAFETY: uc is the live handler frame per the contract.
    base.fast_restore_into(unsafe { &mut *uc });
    base.set_variant(ContextVariant::Running);
}

/// The worker thread body: pin, register, arm, then loop forever.
pub fn worker_main(rt: Arc<Runtime>, index: usize) {
    let worker = rt.workers[index].clone();
    current::set_worker_index(index);
    *worker.pthread.lock() = Some(nix::sys::pthread::pthread_self());

    if !core_affinity::set_for_current(core_affinity::CoreId { id: index + 1 }) {
        warn!(worker = index, "failed to pin worker to its core");
    }
    preemption::unblock_worker_signals();
    debug!(worker = index, "worker online");

    loop {
        run_once(&rt, &worker);
    }
}

/// One scheduler iteration, separated from the loop for tests.
pub fn run_once(rt: &Runtime, worker: &Arc<WorkerHandle>) {
    let guard = preemption::enter_scheduler();

    drain_cleanup(worker);
    drain_wakeups(rt, worker);

    let Some(next) = scheduler::get_next(rt, worker) else {
        drop(guard);
        idle_wait(rt, worker);
        return;
    };

    let now = cycles();
    if now >= next.absolute_deadline {
        expire(rt, worker, &next, now);
        return;
    }

    // Install as current and publish the dispatcher-visible snapshots.
    current::set_current(&next);
    worker
        .current_deadline
        .store(next.absolute_deadline, Ordering::Release);
    worker
        .current_best_effort
        .store(!next.tenant.is_reserved(), Ordering::Release);
    worker.run_start.store(now, Ordering::Release);
    next.timestamps.last_run_start.store(now, Ordering::Release);
    next.timestamps.last_charge.store(now, Ordering::Release);

    // SAFETY: this worker owns the sandbox; its body is quiescent until we
    // switch into it.
    let body = unsafe { next.body_mut() };
    match next.state() {
        SandboxState::Runnable => {
            if body.ctx.variant() == ContextVariant::Unused {
                // First dispatch: the context starts at the entry trampoline
                // on the sandbox's own stack.
                let stack_top = body.stack.as_ref().expect("stack lives").high();
                body.ctx.init(sandbox_entry, stack_top);
            }
            next.set_as_running_sys();
        }
        SandboxState::Preempted => {
            next.set_as_running_user();
        }
        other => unreachable!("scheduled a sandbox in state {other}"),
    }

    drop(guard);
    // SAFETY: the target owns a live stack and nothing else resumes it; the
    // base context is ours. Slow targets go through the restore signal.
    unsafe {
        ArchContext::switch(Some(&mut *base_context()), &mut body.ctx);
    }
    // Back in base context: whichever sandbox just yielded did its own
    // bookkeeping on the way out.
}

fn drain_cleanup(worker: &WorkerHandle) {
    let mut cleanup = worker.cleanup.lock();
    while let Some(sandbox) = cleanup.pop_front() {
        debug_assert!(sandbox.state().is_terminal());
        drop(sandbox);
    }
}

fn drain_wakeups(rt: &Runtime, worker: &WorkerHandle) {
    let mut events = [EpollEvent::empty(); 16];
    let timeout = EpollTimeout::ZERO;
    let Ok(n) = worker.epoll.wait(&mut events, timeout) else {
        return;
    };
    for event in &events[..n] {
        wake_sandbox(rt, worker, event.data());
    }
}

fn wake_sandbox(rt: &Runtime, worker: &WorkerHandle, sandbox_id: u64) {
    let Some(sandbox) = worker.sleeping.lock().remove(&sandbox_id) else {
        return;
    };
    // SAFETY: the sleeping sandbox is quiescent and owned by this worker.
    if let Some(session) = unsafe { sandbox.body_mut() }.session.as_ref() {
        // SAFETY: the fd is live for as long as the session owns it.
        let fd = unsafe { BorrowedFd::borrow_raw(session.raw_fd()) };
        let _ = worker.epoll.delete(fd);
    }
    sandbox.set_as_runnable();
    // Slack decays while sleeping; re-key before re-queueing.
    rt.assign_priority(&sandbox, cycles());
    scheduler::place_on_worker(rt, worker, sandbox);
}

fn idle_wait(rt: &Runtime, worker: &WorkerHandle) {
    // Nothing runnable: park briefly on the epoll so sleeping sandboxes and
    // fresh global work are both noticed promptly.
    let mut events = [EpollEvent::empty(); 16];
    let Ok(n) = worker.epoll.wait(&mut events, EpollTimeout::from(1u8)) else {
        return;
    };
    let guard = preemption::enter_scheduler();
    for event in &events[..n] {
        wake_sandbox(rt, worker, event.data());
    }
    drop(guard);
}

fn expire(rt: &Runtime, worker: &WorkerHandle, sandbox: &Arc<Sandbox>, now: u64) {
    let ran = sandbox.duration_in(SandboxState::RunningUser)
        + sandbox.duration_in(SandboxState::RunningSys)
        > 0;
    let code = if ran {
        ResponseCode::DEADLINE_MISSED_STARTED
    } else {
        ResponseCode::DEADLINE_MISSED_UNSTARTED
    };
    debug!(sandbox = sandbox.id, code = code.as_u16(), now, "deadline missed");
    sandbox.set_response_code(code);

    worker.runqueue.delete(sandbox);
    worker
        .queuing_cost
        .decrement(sandbox.remaining_exec.load(Ordering::Acquire));
    // SAFETY: this worker owns the sandbox.
    let body = unsafe { sandbox.body_mut() };
    if let Some(session) = body.session.as_mut() {
        session.send_error_response(code);
    }
    // SAFETY: owning worker.
    unsafe { sandbox.set_as_error() };
    rt.finalize(sandbox);
    worker.cleanup.lock().push_back(sandbox.clone());
    let _ = worker.outbox.push(WorkerToListener::FinishedSandbox {
        sandbox: sandbox.clone(),
    });
}

/// The first instruction every sandbox executes, on its own stack. Runs the
/// module initializers and the guest entrypoint, then sends the response and
/// exits. Never returns; every way out is a context switch.
extern "C" fn sandbox_entry() -> ! {
    let sandbox = current::current().expect("entry with no current sandbox");

    match sandbox.module.abi() {
        Some(abi) => {
            let abi = *abi;
            // SAFETY: module initializers are called once per instance with
            // the current-sandbox shims installed, per the ABI contract.
            unsafe {
                (abi.init_globals)();
                (abi.init_mem)();
                (abi.init_tbl)();
            }
            sandbox.set_as_running_user();
            // SAFETY: the guest entrypoint; traps leave via the trap shim
            // and never return here.
            let rc = unsafe { (abi.entrypoint)() };
            sandbox.set_as_running_sys();
            // SAFETY: sandbox context owns the body.
            unsafe { sandbox.body_mut() }.return_value = rc;
        }
        None => {
            // Stub module: echo the request body. Exercised by tests only.
            sandbox.set_as_running_user();
            sandbox.set_as_running_sys();
            // SAFETY: sandbox context owns the body.
            let body = unsafe { sandbox.body_mut() };
            let echoed: Vec<u8> = body
                .session
                .as_ref()
                .map(|s| s.request_body().to_vec())
                .unwrap_or_default();
            body.response_body = echoed;
        }
    }

    finish_and_exit(&sandbox)
}

/// Sends the response from sandbox context (sleeping on backpressure), then
/// retires the sandbox. Never returns.
fn finish_and_exit(sandbox: &Arc<Sandbox>) -> ! {
    let rt = runtime::get();
    let code = sandbox.response_code().unwrap_or(ResponseCode::OK);
    sandbox.set_response_code(code);

    // SAFETY: sandbox context owns the body.
    let body = unsafe { sandbox.body_mut() };
    let response_body = std::mem::take(&mut body.response_body);
    let content_type = sandbox.route.config.expected_content_type.clone();
    let sent = if let Some(session) = body.session.as_mut() {
        let capped = &response_body[..response_body
            .len()
            .min(sandbox.route.config.max_response_size)];
        session.set_response(code, &content_type, capped);
        send_current_response(sandbox)
    } else {
        true
    };

    let guard = preemption::enter_scheduler();
    let worker = &rt.workers[sandbox.owner_worker().expect("resident sandbox")];
    worker.runqueue.delete(sandbox);
    worker
        .queuing_cost
        .decrement(sandbox.remaining_exec.load(Ordering::Acquire));
    if sent {
        // SAFETY: sandbox context is the owning thread.
        unsafe { sandbox.set_as_returned() };
        sandbox.set_as_complete();
    } else {
        // The client went away mid-response; the work is torn down as a
        // failure even though the guest finished.
        // SAFETY: sandbox context is the owning thread.
        unsafe { sandbox.set_as_error() };
    }
    rt.finalize(sandbox);
    worker.cleanup.lock().push_back(sandbox.clone());
    let _ = worker.outbox.push(WorkerToListener::FinishedSandbox {
        sandbox: sandbox.clone(),
    });
    exit_to_base(worker, guard)
}

/// Drives the nonblocking response send, sleeping the sandbox on
/// backpressure until the worker's epoll wakes it. Returns false when the
/// client socket failed terminally.
fn send_current_response(sandbox: &Arc<Sandbox>) -> bool {
    loop {
        // SAFETY: sandbox context owns the body.
        let body = unsafe { sandbox.body_mut() };
        let Some(session) = body.session.as_mut() else {
            return false;
        };
        match session.try_send(cycles()) {
            Ok(Progress::Complete) => {
                let rt = runtime::get();
                if let Some(log) = &rt.http_perf_log {
                    log.append(&format!(
                        "{},{},{},{},{}",
                        sandbox.route.config.route,
                        sandbox
                            .response_code()
                            .map_or(0, crate::response::ResponseCode::as_u16),
                        session.request_arrival,
                        session.request_downloaded,
                        session.response_sent_at,
                    ));
                }
                return true;
            }
            Ok(Progress::WouldBlock) => block_current(sandbox, EpollFlags::EPOLLOUT),
            Err(e) => {
                debug!(sandbox = sandbox.id, error = %e, "response write failed");
                body.session = None;
                return false;
            }
        }
    }
}

/// Parks the current sandbox on its client socket: registers the fd with the
/// worker epoll, leaves the run queue, and switches to the base context.
/// Returns when the worker wakes and re-dispatches the sandbox.
fn block_current(sandbox: &Arc<Sandbox>, interest: EpollFlags) {
    let rt = runtime::get();
    let guard = preemption::enter_scheduler();
    let worker = &rt.workers[sandbox.owner_worker().expect("resident sandbox")];

    // SAFETY: sandbox context owns the body.
    let body = unsafe { sandbox.body_mut() };
    let session = body.session.as_ref().expect("blocking on the client socket");
    // SAFETY: the session keeps the fd open while parked.
    let fd = unsafe { BorrowedFd::borrow_raw(session.raw_fd()) };
    let event = EpollEvent::new(interest | EpollFlags::EPOLLONESHOT, sandbox.id);
    if worker.epoll.add(fd, event).is_err() {
        // Registration failed; treat the socket as dead and give up on the
        // response rather than spin.
        body.session = None;
        return;
    }
    let _ = worker.sleeping.lock().insert(sandbox.id, sandbox.clone());

    worker.runqueue.delete(sandbox);
    worker
        .queuing_cost
        .decrement(sandbox.remaining_exec.load(Ordering::Acquire));
    sandbox.set_as_asleep();

    let _ = current::clear_current();
    worker.current_deadline.store(u64::MAX, Ordering::Release);
    worker.current_best_effort.store(false, Ordering::Release);
    drop(guard);

    // SAFETY: our context and the base context are both owned by this
    // worker thread; preemption is off (not Running-User).
    unsafe {
        ArchContext::switch(Some(&mut body.ctx), &mut *base_context());
    }
    // Woken: the worker re-dispatched us; carry on where we left off.
}

/// Leaves sandbox context for good: clears current, resets the worker
/// snapshots, and switches to the base context without saving.
fn exit_to_base(worker: &WorkerHandle, guard: preemption::SchedulerGuard) -> ! {
    let _ = current::clear_current();
    worker.current_deadline.store(u64::MAX, Ordering::Release);
    worker.current_best_effort.store(false, Ordering::Release);
    drop(guard);
    // SAFETY: the base context is suspended in this worker's switch; our own
    // (dying) context is abandoned, never resumed.
    unsafe {
        ArchContext::switch(None, &mut *base_context());
    }
    unreachable!("abandoned sandbox context was resumed");
}

/// The trap exit: called by the ABI shims when the guest raises `trapno`.
/// `proc_exit(0)` completes normally; everything else is a 500 and Error.
/// Never returns.
pub(crate) fn trap_out(trap: Trap) -> ! {
    let rt = runtime::get();
    let sandbox = current::current().expect("trap with no current sandbox");
    // Traps can fire from guest code (Running-User); host bookkeeping below
    // runs in system state.
    if sandbox.state() == SandboxState::RunningUser {
        sandbox.set_as_running_sys();
    }

    // SAFETY: sandbox context owns the body.
    let body = unsafe { sandbox.body_mut() };
    body.trap = Some(trap);

    if trap == Trap::Exit && body.return_value == 0 {
        finish_and_exit(&sandbox);
    }

    debug!(sandbox = sandbox.id, %trap, "guest trap");
    sandbox.set_response_code(ResponseCode::INTERNAL_ERROR);
    if let Some(session) = body.session.as_mut() {
        session.send_error_response(ResponseCode::INTERNAL_ERROR);
    }

    let guard = preemption::enter_scheduler();
    let worker = &rt.workers[sandbox.owner_worker().expect("resident sandbox")];
    worker.runqueue.delete(&sandbox);
    worker
        .queuing_cost
        .decrement(sandbox.remaining_exec.load(Ordering::Acquire));
    // SAFETY: sandbox context is the owning thread.
    unsafe { sandbox.set_as_error() };
    rt.finalize(&sandbox);
    worker.cleanup.lock().push_back(sandbox.clone());
    let _ = worker.outbox.push(WorkerToListener::FinishedSandbox {
        sandbox: sandbox.clone(),
    });
    exit_to_base(worker, guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use sledge_rt_config::RuntimeConfig;
    use sledge_rt_telemetry::Metrics;

    fn runtime() -> Arc<Runtime> {
        let options = testing::stub_options();
        let metrics = Arc::new(Metrics::new().expect("fresh registry"));
        Runtime::build(&RuntimeConfig { tenants: vec![] }, options, metrics).expect("runtime")
    }

    #[test]
    fn expired_sandboxes_get_deadline_codes() {
        let rt = runtime();
        let worker = &rt.workers[0];

        let sandbox = testing::stub_sandbox();
        rt.assign_priority(&sandbox, sandbox.timestamps.allocation);
        let est = rt
            .admissions
            .decide(sandbox.admissions_estimate)
            .expect("fits");
        assert!(est > 0);
        scheduler::place_on_worker(&rt, worker, sandbox.clone());

        expire(&rt, worker, &sandbox, sandbox.absolute_deadline + 1);

        assert_eq!(sandbox.state(), SandboxState::Error);
        assert_eq!(
            sandbox.response_code().map(|c| c.as_u16()),
            Some(ResponseCode::DEADLINE_MISSED_UNSTARTED.as_u16()),
        );
        assert_eq!(rt.admissions.admitted(), 0);
        assert_eq!(worker.queuing_cost.get(), 0);
        assert!(worker.runqueue.is_empty());
        // On the cleanup list, ready for teardown.
        assert!(!worker.cleanup.lock().is_empty());
        drain_cleanup(worker);
        assert!(worker.cleanup.lock().is_empty());
    }

    #[test]
    fn started_then_expired_uses_the_other_code() {
        let rt = runtime();
        let worker = &rt.workers[0];
        let sandbox = testing::stub_sandbox();
        rt.assign_priority(&sandbox, sandbox.timestamps.allocation);
        scheduler::place_on_worker(&rt, worker, sandbox.clone());
        // Run for a moment so the running-state accumulators are non-zero.
        sandbox.set_as_running_sys();
        std::thread::sleep(std::time::Duration::from_millis(1));
        sandbox.set_as_running_user();
        expire(&rt, worker, &sandbox, sandbox.absolute_deadline + 1);
        assert_eq!(
            sandbox.response_code().map(|c| c.as_u16()),
            Some(ResponseCode::DEADLINE_MISSED_STARTED.as_u16()),
        );
    }
}
