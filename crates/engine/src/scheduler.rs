// SPDX-License-Identifier: Apache-2.0

//! Policy scheduling: what runs next on a worker, and the preemption half
//! that runs inside the timer signal handler.
//!
//! The local run queue is the source of truth; the global queue is consulted
//! only when its published head could displace the local one
//! (`remove_if_earlier`), or, under FIFO, when the worker has nothing local
//! and steals.

use crate::current::{self, current_ptr};
use crate::global_queue::StealOutcome;
use crate::response::ResponseCode;
use crate::rings::{ListenerToWorker, WorkerToListener};
use crate::runtime::{Runtime, WorkerHandle};
use crate::sandbox::Sandbox;
use crate::sandbox::state::SandboxState;
use crate::traffic_control::BudgetOutcome;
use crate::worker;
use sledge_rt_arch::cycles;
use sledge_rt_config::options::{DispatcherPolicy, SchedulerPolicy};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Priority penalty applied when a sandbox is demoted to best-effort.
const DEMOTION_OFFSET: u64 = 1 << 48;

/// Places an admitted sandbox on `worker`'s run queue, transitioning a fresh
/// one to Runnable and charging the worker's queueing cost. Used by workers
/// pulling from the global queue and by the dispatcher policies placing
/// directly.
pub fn place_on_worker(rt: &Runtime, worker: &WorkerHandle, sandbox: Arc<Sandbox>) {
    let now = cycles();
    sandbox.set_owner_worker(Some(worker.index));
    if sandbox.state() == SandboxState::Initialized {
        sandbox.set_as_runnable();
        sandbox.timestamps.dispatched.store(now, Ordering::Release);
    }
    let cost = sandbox.remaining_exec.load(Ordering::Acquire);
    match worker.runqueue.add(sandbox) {
        Ok(()) => worker.queuing_cost.increment(cost),
        Err(err) => {
            // A local queue at capacity is a drop, not a crash: the sandbox
            // errors out with backpressure.
            let sandbox = err.into_inner();
            sandbox.set_response_code(ResponseCode::TOO_MANY_REQUESTS);
            // SAFETY: the placing thread still owns the sandbox.
            unsafe { sandbox.set_as_error() };
            rt.finalize(&sandbox);
        }
    }
}

/// Picks the sandbox `worker` should run next, pulling from the global queue
/// when the policy says a global candidate wins. Returns the head without
/// removing it; the head leaves the queue only on completion or writeback.
pub fn get_next(rt: &Runtime, worker: &WorkerHandle) -> Option<Arc<Sandbox>> {
    match rt.options.scheduler {
        SchedulerPolicy::Fifo => {
            if let Some(head) = worker.runqueue.get_next() {
                // Round-robin: the current sandbox rotates to the back.
                if current_ptr() == Arc::as_ptr(&head) {
                    worker.runqueue.rotate();
                    return worker.runqueue.get_next();
                }
                return Some(head);
            }
            match rt.global_queue.remove() {
                StealOutcome::Taken(sandbox) => {
                    place_on_worker(rt, worker, sandbox.clone());
                    let _ = worker.outbox.push(WorkerToListener::PulledNewSandbox {
                        sandbox_id: sandbox.id,
                    });
                    worker.runqueue.get_next()
                }
                StealOutcome::Empty | StealOutcome::Retry => None,
            }
        }
        _ => {
            let local_head = worker.runqueue.head_priority();
            if rt.global_queue.peek() < local_head {
                if let Some(sandbox) = rt.global_queue.remove_if_earlier(local_head) {
                    debug_assert!(sandbox.priority() < local_head);
                    place_on_worker(rt, worker, sandbox.clone());
                    let _ = worker.outbox.push(WorkerToListener::PulledNewSandbox {
                        sandbox_id: sandbox.id,
                    });
                }
            }
            worker.runqueue.get_next()
        }
    }
}

/// The signal-handler half of preemption. Charges the interrupted sandbox's
/// budgets, honors shed requests, asks the policy for a challenger, and if
/// one wins performs the slow save and redirects the handler's `ucontext`
/// into the challenger.
///
/// # Safety
///
/// Must run inside the SIGALRM handler of a worker thread, with `uc` the
/// kernel-provided ucontext and the in-scheduler flag already held.
pub unsafe fn preempt(rt: &Runtime, worker: &WorkerHandle, uc: *mut libc::ucontext_t) {
    let cur = current_ptr();
    if cur.is_null() {
        return;
    }
    // SAFETY: the owning slot keeps the current sandbox alive while set.
    let current = unsafe { &*cur };

    while let Some(msg) = worker.inbox.pop() {
        match msg {
            ListenerToWorker::ShedCurrentJob => current.request_shed(),
        }
    }

    let now = cycles();
    let anchor = current.timestamps.last_charge.swap(now, Ordering::AcqRel);
    let delta = now.saturating_sub(anchor);
    let was_exceeded = current.exceeded_estimation.load(Ordering::Acquire);
    let remaining = current.consume_exec(delta);
    if remaining == 0 && !was_exceeded {
        let _ = worker.outbox.push(WorkerToListener::OvershotEstimate {
            sandbox_id: current.id,
            total_running: current.duration_in(SandboxState::RunningUser)
                + current.duration_in(SandboxState::RunningSys),
        });
    }

    // Only guest execution is preemptable (or killable in place): host-side
    // code may hold borrows a forced exit would tear.
    if current.state() != SandboxState::RunningUser {
        return;
    }

    let mut kill_code = None;
    if current.take_shed_request() {
        kill_code = Some(ResponseCode::SHED);
    } else if let Some(traffic) = &rt.traffic {
        match traffic.charge_execution(current, delta) {
            BudgetOutcome::Ok => {}
            BudgetOutcome::Demote => demote_current(rt, worker, current),
            BudgetOutcome::Kill => kill_code = Some(ResponseCode::BUDGET_EXHAUSTED),
        }
    }

    if let Some(code) = kill_code {
        // SAFETY: handler context on the owning worker, per our contract.
        unsafe { kill_current(rt, worker, code, uc) };
        return;
    }

    let Some(next) = get_next(rt, worker) else {
        return;
    };
    if Arc::as_ptr(&next) == cur {
        return;
    }
    let should_switch = match rt.options.scheduler {
        // Round-robin rotation switches regardless of arrival order.
        SchedulerPolicy::Fifo => true,
        // A challenger must be strictly earlier to displace the current
        // sandbox.
        _ => next.priority() < current.priority(),
    };
    if !should_switch {
        return;
    }

    rt.metrics.preemptions.inc();
    trace!(victim = current.id, challenger = next.id, "preempting");

    current.set_as_interrupted();
    {
        // SAFETY: the interrupted sandbox is owned by this worker; no other
        // reference to its body exists while its guest code is stopped.
        let body = unsafe { current.body_mut() };
        // SAFETY: uc is the live handler frame.
        body.ctx.mcontext_save(unsafe { &*uc });
    }
    current.set_as_preempted();

    if rt.options.dispatcher == DispatcherPolicy::Shinjuku {
        // Centralized mode: the preempted sandbox goes back to the
        // dispatcher's typed queue instead of staying resident.
        let current_arc = current::current().expect("current sandbox set");
        worker.runqueue.delete(&current_arc);
        worker
            .queuing_cost
            .decrement(current_arc.remaining_exec.load(Ordering::Acquire));
        current_arc.set_owner_worker(None);
        let _ = worker.outbox.push(WorkerToListener::WritebackPreemption {
            sandbox: current_arc,
            at: now,
        });
    }

    // SAFETY: handler context on the owning worker, per our contract.
    unsafe { dispatch_into_ucontext(worker, &next, uc) };
}

/// Redirects the handler's return straight into `next`, making it the
/// current sandbox.
///
/// # Safety
///
/// Handler context on the owning worker; `uc` is the live handler frame.
pub unsafe fn dispatch_into_ucontext(
    worker: &WorkerHandle,
    next: &Arc<Sandbox>,
    uc: *mut libc::ucontext_t,
) {
    let now = cycles();
    current::set_current(next);
    worker
        .current_deadline
        .store(next.absolute_deadline, Ordering::Release);
    worker
        .current_best_effort
        .store(!next.tenant.is_reserved(), Ordering::Release);
    worker.run_start.store(now, Ordering::Release);
    next.timestamps.last_run_start.store(now, Ordering::Release);
    next.timestamps.last_charge.store(now, Ordering::Release);

    // SAFETY: this worker owns `next`; its body is quiescent.
    let body = unsafe { next.body_mut() };
    match next.state() {
        SandboxState::Runnable => {
            next.set_as_running_sys();
            // SAFETY: uc is the live handler frame.
            body.ctx.fast_restore_into(unsafe { &mut *uc });
            body.ctx.set_variant(sledge_rt_arch::ContextVariant::Running);
        }
        SandboxState::Preempted => {
            next.set_as_running_user();
            // SAFETY: uc is the live handler frame.
            body.ctx.mcontext_restore(unsafe { &mut *uc });
            body.ctx.set_variant(sledge_rt_arch::ContextVariant::Running);
        }
        other => unreachable!("dispatching a sandbox in state {other}"),
    }
}

/// Kills the current sandbox from the handler (shed or budget exhaustion)
/// and lands the ucontext either in a replacement sandbox or back in the
/// worker's base loop.
///
/// # Safety
///
/// Handler context on the owning worker; `uc` is the live handler frame.
unsafe fn kill_current(
    rt: &Runtime,
    worker: &WorkerHandle,
    code: ResponseCode,
    uc: *mut libc::ucontext_t,
) {
    let Some(current) = current::current() else {
        return;
    };
    current.set_response_code(code);
    rt.metrics.sheds.inc();

    // SAFETY: this worker owns the sandbox; guest code is stopped.
    let body = unsafe { current.body_mut() };
    if let Some(session) = body.session.as_mut() {
        session.send_error_response(ResponseCode::INTERNAL_ERROR);
    }

    worker.runqueue.delete(&current);
    worker
        .queuing_cost
        .decrement(current.remaining_exec.load(Ordering::Acquire));
    // SAFETY: owning worker.
    unsafe { current.set_as_error() };
    rt.finalize(&current);
    worker.cleanup.lock().push_back(current.clone());
    let _ = worker
        .outbox
        .push(WorkerToListener::FinishedSandbox { sandbox: current });

    let _ = current::clear_current();
    worker.current_deadline.store(u64::MAX, Ordering::Release);
    worker.current_best_effort.store(false, Ordering::Release);

    if let Some(next) = get_next(rt, worker) {
        // SAFETY: propagating our own contract.
        unsafe { dispatch_into_ucontext(worker, &next, uc) };
    } else {
        // SAFETY: the worker's base context is suspended in its own switch;
        // its fast bank is valid until we land there.
        unsafe { worker::restore_base_into_ucontext(uc) };
    }
}

/// Demotes the current sandbox to best-effort: its queue key moves into the
/// demotion band and the outcome is visible as code 4091.
fn demote_current(rt: &Runtime, worker: &WorkerHandle, current: &Sandbox) {
    if current.priority() >= DEMOTION_OFFSET {
        return;
    }
    let Some(current_arc) = current::current() else {
        return;
    };
    rt.metrics.sheds.inc();
    current_arc.set_response_code(ResponseCode::SHED);
    worker.runqueue.delete(&current_arc);
    current_arc.set_priority(current.priority() + DEMOTION_OFFSET);
    match worker.runqueue.add(current_arc) {
        Ok(()) => {}
        Err(_) => unreachable!("delete immediately followed by add cannot fill the queue"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use sledge_rt_config::RuntimeConfig;
    use sledge_rt_telemetry::Metrics;

    fn runtime(scheduler: SchedulerPolicy) -> Arc<Runtime> {
        let mut options = testing::stub_options();
        options.scheduler = scheduler;
        let metrics = Arc::new(Metrics::new().expect("fresh registry"));
        Runtime::build(&RuntimeConfig { tenants: vec![] }, options, metrics).expect("runtime")
    }

    fn ready_sandbox() -> Arc<Sandbox> {
        testing::stub_sandbox()
    }

    #[test]
    fn get_next_prefers_the_earlier_global_candidate() {
        let rt = runtime(SchedulerPolicy::Edf);
        let worker = &rt.workers[0];

        let local = ready_sandbox();
        local.set_priority(1_000);
        place_on_worker(&rt, worker, local.clone());

        let global = ready_sandbox();
        global.set_priority(500);
        rt.global_queue.add(global.clone()).expect("capacity");

        let next = get_next(&rt, worker).expect("work available");
        assert_eq!(next.id, global.id);
        assert_eq!(next.state(), SandboxState::Runnable);
        // The pull was announced to the listener.
        let mut saw_pull = false;
        while let Some(msg) = worker.outbox.pop() {
            if matches!(msg, WorkerToListener::PulledNewSandbox { sandbox_id } if sandbox_id == global.id)
            {
                saw_pull = true;
            }
        }
        assert!(saw_pull);
        // Queueing cost covers both resident sandboxes.
        assert_eq!(
            worker.queuing_cost.get(),
            local.remaining_exec.load(Ordering::Acquire)
                + global.remaining_exec.load(Ordering::Acquire),
        );
    }

    #[test]
    fn get_next_leaves_a_later_global_candidate_alone() {
        let rt = runtime(SchedulerPolicy::Edf);
        let worker = &rt.workers[0];

        let local = ready_sandbox();
        local.set_priority(500);
        place_on_worker(&rt, worker, local.clone());

        let global = ready_sandbox();
        global.set_priority(1_000);
        rt.global_queue.add(global.clone()).expect("capacity");

        let next = get_next(&rt, worker).expect("work available");
        assert_eq!(next.id, local.id);
        assert_eq!(rt.global_queue.len(), 1);
    }

    #[test]
    fn fifo_steals_only_when_local_is_empty() {
        let rt = runtime(SchedulerPolicy::Fifo);
        let worker = &rt.workers[0];

        let queued = testing::stub_sandbox();
        rt.assign_priority(&queued, 0);
        rt.global_queue.add(queued.clone()).expect("capacity");

        let next = get_next(&rt, worker).expect("stolen");
        assert_eq!(next.id, queued.id);
        assert!(rt.global_queue.is_empty());

        // With a local head present, the global store is not touched.
        let second = testing::stub_sandbox();
        rt.assign_priority(&second, 0);
        rt.global_queue.add(second.clone()).expect("capacity");
        let again = get_next(&rt, worker).expect("local head");
        assert_eq!(again.id, queued.id);
        assert_eq!(rt.global_queue.len(), 1);
    }

    #[test]
    fn fifo_serves_arrival_order_across_two_workers() {
        let rt = runtime(SchedulerPolicy::Fifo);
        let arrivals: Vec<Arc<Sandbox>> = (0..4)
            .map(|_| {
                let s = testing::stub_sandbox();
                rt.assign_priority(&s, 0);
                rt.global_queue.add(s.clone()).expect("capacity");
                s
            })
            .collect();

        let w0 = &rt.workers[0];
        let w1 = &rt.workers[1];

        // Two workers draw concurrently; each completed sandbox leaves its
        // queue before the next pull.
        let mut served = Vec::new();
        for _ in 0..2 {
            for worker in [w0, w1] {
                let next = get_next(&rt, worker).expect("queued work");
                served.push(next.id);
                worker.runqueue.delete(&next);
            }
        }
        let expected: Vec<u64> = arrivals.iter().map(|s| s.id).collect();
        assert_eq!(served, expected);
        assert!(rt.global_queue.is_empty());
    }

    #[test]
    fn rotation_round_robins_past_the_current_sandbox() {
        let rt = runtime(SchedulerPolicy::Fifo);
        let worker = &rt.workers[0];
        let a = testing::stub_sandbox();
        let b = testing::stub_sandbox();
        rt.assign_priority(&a, 0);
        rt.assign_priority(&b, 0);
        place_on_worker(&rt, worker, a.clone());
        place_on_worker(&rt, worker, b.clone());

        // With `a` current, FIFO's next pick rotates to `b`.
        current::set_current(&a);
        let next = get_next(&rt, worker).expect("rotated head");
        assert_eq!(next.id, b.id);
        let _ = current::clear_current();
    }
}
