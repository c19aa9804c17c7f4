// SPDX-License-Identifier: Apache-2.0

//! The listener: accept, admit, place.
//!
//! One listener thread owns every tenant's accept socket, parses request
//! heads, runs admission (and, when enabled, traffic control), allocates the
//! sandbox, and places it according to the dispatch policy:
//!
//! - **Global**: push to the process-wide queue; workers pull.
//! - **EdfInterrupt**: probe the workers round-robin with
//!   [`crate::local_runqueue::LocalRunqueue::try_add`]; prefer an idle worker, then the
//!   cheapest-to-preempt one (and send the interrupt), then the cheapest
//!   wait.
//! - **Darc**: per-request-type FIFO rings drained onto statically reserved
//!   worker slices, with stealable slack and no preemption.
//! - **Shinjuku**: centralized per-type deques (preempted jobs re-queued at
//!   the front), swept every loop; busy workers past the interrupt interval
//!   are preempted.

use crate::error::Error;
use crate::local_runqueue::TryAdd;
use crate::preemption;
use crate::response::ResponseCode;
use crate::rings::{ListenerToWorker, WorkerToListener};
use crate::runtime::Runtime;
use crate::sandbox::Sandbox;
use crate::scheduler::place_on_worker;
use crate::session::{HttpSession, Progress};
use crate::tenant::{Route, Tenant};
use crate::traffic_control::TrafficDecision;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use sledge_rt_arch::cycles;
use sledge_rt_config::options::DispatcherPolicy;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Shinjuku's preemption interval, in microseconds.
const SHINJUKU_INTERRUPT_INTERVAL_US: u64 = 50;

struct Acceptor {
    listener: TcpListener,
    tenant: Arc<Tenant>,
}

struct Receiving {
    session: HttpSession,
    tenant: Arc<Tenant>,
}

/// One typed queue: route, its FIFO of waiting sandboxes, and its DARC
/// worker sets.
struct TypedQueue {
    route: Arc<Route>,
    fifo: VecDeque<(Arc<Sandbox>, u64)>,
    reserved_workers: Vec<usize>,
    stealable_workers: Vec<usize>,
}

/// The listener-side dispatcher.
pub struct Dispatcher {
    rt: Arc<Runtime>,
    epoll: Epoll,
    acceptors: HashMap<RawFd, Acceptor>,
    receiving: HashMap<RawFd, Receiving>,
    typed: Vec<TypedQueue>,
    next_loop_start: usize,
    free_workers: u32,
    shinjuku_interval_cycles: u64,
}

impl Dispatcher {
    /// Binds every tenant's listener socket and builds the policy state.
    pub fn new(rt: Arc<Runtime>) -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|source| Error::Setup {
            detail: "listener epoll",
            source,
        })?;

        let mut acceptors = HashMap::new();
        for tenant in &rt.tenants {
            let listener = bind_listener(tenant.port)?;
            let fd = listener.as_raw_fd();
            // SAFETY: the listener owns the fd for the acceptor's lifetime.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            epoll
                .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
                .map_err(|source| Error::Setup {
                    detail: "register tenant listener",
                    source,
                })?;
            info!(tenant = %tenant.name, port = tenant.port, "tenant listening");
            let _ = acceptors.insert(
                fd,
                Acceptor {
                    listener,
                    tenant: tenant.clone(),
                },
            );
        }

        let typed = build_typed_queues(&rt);
        let workers = rt.workers.len().min(32) as u32;
        let free_workers = if workers == 32 {
            u32::MAX
        } else {
            (1u32 << workers) - 1
        };
        let shinjuku_interval_cycles =
            rt.options.us_to_cycles(SHINJUKU_INTERRUPT_INTERVAL_US);

        Ok(Self {
            rt,
            epoll,
            acceptors,
            receiving: HashMap::new(),
            typed,
            next_loop_start: 0,
            free_workers,
            shinjuku_interval_cycles,
        })
    }

    /// The listener thread body: pin to the listener core and loop forever.
    pub fn run(&mut self) -> ! {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: 0 }) {
            warn!("failed to pin listener to core 0");
        }
        preemption::unblock_worker_signals();
        info!("listener online");
        loop {
            self.run_once();
        }
    }

    /// One listener iteration: drain worker messages, poll the sockets, and
    /// run the typed dispatch passes.
    pub fn run_once(&mut self) {
        self.drain_worker_messages();

        let mut events = [EpollEvent::empty(); 64];
        let timeout = if self.typed.iter().any(|t| !t.fifo.is_empty()) {
            EpollTimeout::ZERO
        } else {
            EpollTimeout::from(1u8)
        };
        let ready = self.epoll.wait(&mut events, timeout).unwrap_or(0);
        for event in &events[..ready] {
            let fd = event.data() as RawFd;
            if self.acceptors.contains_key(&fd) {
                self.accept_all(fd);
            } else {
                self.continue_receive(fd);
            }
        }

        match self.rt.options.dispatcher {
            DispatcherPolicy::Darc => self.darc_dispatch(),
            DispatcherPolicy::Shinjuku => self.shinjuku_dispatch(),
            DispatcherPolicy::Global | DispatcherPolicy::EdfInterrupt => {}
        }
    }

    fn drain_worker_messages(&mut self) {
        for worker in &self.rt.workers.clone() {
            while let Some(msg) = worker.outbox.pop() {
                match msg {
                    WorkerToListener::FinishedSandbox { sandbox } => {
                        if let Some(owner) = sandbox.owner_worker() {
                            self.mark_worker_free(owner);
                        }
                    }
                    WorkerToListener::WritebackPreemption { sandbox, at } => {
                        self.writeback(sandbox, at);
                    }
                    WorkerToListener::PulledNewSandbox { sandbox_id } => {
                        debug!(sandbox = sandbox_id, worker = worker.index, "pulled from global");
                    }
                    WorkerToListener::ReduceDemand { sandbox_id, cycles } => {
                        debug!(sandbox = sandbox_id, cycles, "demand reduced");
                    }
                    WorkerToListener::OvershotEstimate {
                        sandbox_id,
                        total_running,
                    } => {
                        debug!(sandbox = sandbox_id, total_running, "estimate overshot");
                    }
                }
            }
        }
    }

    fn mark_worker_free(&mut self, worker: usize) {
        if worker < 32 {
            self.free_workers |= 1 << worker;
        }
    }

    fn accept_all(&mut self, fd: RawFd) {
        loop {
            let (tenant, stream) = {
                let acceptor = self.acceptors.get(&fd).expect("registered acceptor");
                match acceptor.listener.accept() {
                    Ok((stream, _peer)) => (acceptor.tenant.clone(), stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return;
                    }
                }
            };
            self.rt.metrics.total_requests.inc();
            match HttpSession::new(stream, cycles()) {
                Ok(session) => self.advance_receive(session, tenant),
                Err(e) => debug!(error = %e, "session setup failed"),
            }
        }
    }

    fn continue_receive(&mut self, fd: RawFd) {
        let Some(entry) = self.receiving.remove(&fd) else {
            return;
        };
        // SAFETY: the session still owns this fd.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = self.epoll.delete(borrowed);
        self.advance_receive(entry.session, entry.tenant);
    }

    fn advance_receive(&mut self, mut session: HttpSession, tenant: Arc<Tenant>) {
        let max_request = tenant
            .routes
            .iter()
            .map(|r| r.config.max_request_size)
            .max()
            .unwrap_or(4096);
        match session.try_receive(max_request, cycles()) {
            Ok(Progress::Complete) => self.handle_request(session, &tenant),
            Ok(Progress::WouldBlock) => {
                let fd = session.raw_fd();
                // SAFETY: the session owns the fd while parked here.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
                if self.epoll.add(borrowed, event).is_ok() {
                    let _ = self.receiving.insert(fd, Receiving { session, tenant });
                }
            }
            Err(e) => {
                let code = e.response_code();
                debug!(error = %e, code = code.as_u16(), "request receive failed");
                self.rt.metrics.total_rejections.inc();
                self.rt.metrics.count_response(code.as_u16());
                session.send_error_response(code);
            }
        }
    }

    /// Routes, admits, allocates, and places one fully received request.
    fn handle_request(&mut self, mut session: HttpSession, tenant: &Arc<Tenant>) {
        let now = cycles();
        let path = session
            .request()
            .map(|r| r.path.clone())
            .unwrap_or_default();
        let Some(route) = tenant.match_route(&path).cloned() else {
            debug!(%path, "route miss");
            self.reject(&mut session, ResponseCode::NOT_FOUND);
            return;
        };

        let Some(work_admitted) = self.rt.admissions.decide(route.admissions_estimate) else {
            self.reject(&mut session, ResponseCode::SERVICE_UNAVAILABLE);
            return;
        };

        if let Some(traffic) = &self.rt.traffic {
            let abs_deadline = now + route.relative_deadline_cycles;
            match traffic.decide(
                tenant.reservation.as_ref(),
                now,
                abs_deadline,
                route.estimated_cost_cycles,
            ) {
                TrafficDecision::Admit => {}
                TrafficDecision::AdmitAfterShed { shed_cycles } => {
                    self.shed_best_effort(shed_cycles);
                }
                TrafficDecision::Reject => {
                    self.rt.admissions.subtract(work_admitted);
                    self.reject(&mut session, ResponseCode::TOO_MANY_REQUESTS);
                    return;
                }
            }
        }

        session.set_executing();
        let sandbox = match Sandbox::allocate(&route, tenant, session, work_admitted, now) {
            Ok(sandbox) => sandbox,
            Err((e, mut session)) => {
                warn!(error = %e, "sandbox allocation failed");
                self.rt.admissions.subtract(work_admitted);
                self.reject(&mut session, ResponseCode::INTERNAL_ERROR);
                return;
            }
        };
        self.rt.assign_priority(&sandbox, now);

        match self.rt.options.dispatcher {
            DispatcherPolicy::Global => self.dispatch_global(sandbox),
            DispatcherPolicy::EdfInterrupt => self.dispatch_edf_interrupt(sandbox),
            DispatcherPolicy::Darc | DispatcherPolicy::Shinjuku => {
                let type_idx = self.type_index(&sandbox.route);
                self.typed[type_idx].fifo.push_back((sandbox, now));
            }
        }
    }

    fn reject(&mut self, session: &mut HttpSession, code: ResponseCode) {
        self.rt.metrics.total_rejections.inc();
        self.rt.metrics.count_response(code.as_u16());
        session.send_error_response(code);
    }

    /// Global policy: the queue is the hand-off point; a full queue is a 429
    /// with the admission charge rolled back.
    fn dispatch_global(&mut self, sandbox: Arc<Sandbox>) {
        match self.rt.global_queue.add(sandbox) {
            Ok(()) => {}
            Err(err) => {
                let sandbox = err.into_inner();
                debug!(sandbox = sandbox.id, "global queue full");
                self.rt.admissions.subtract(sandbox.admissions_estimate);
                sandbox.set_response_code(ResponseCode::TOO_MANY_REQUESTS);
                // SAFETY: the listener still owns this sandbox.
                let body = unsafe { sandbox.body_mut() };
                if let Some(session) = body.session.as_mut() {
                    session.send_error_response(ResponseCode::TOO_MANY_REQUESTS);
                }
                unsafe { sandbox.set_as_error() };
                self.rt.metrics.total_rejections.inc();
                self.rt
                    .metrics
                    .count_response(ResponseCode::TOO_MANY_REQUESTS.as_u16());
            }
        }
    }

    /// EDF-Interrupt: probe every worker round-robin from the last start
    /// index; idle wins, then the cheapest preemptable worker (signaled),
    /// then the smallest projected wait.
    fn dispatch_edf_interrupt(&mut self, sandbox: Arc<Sandbox>) {
        let workers = &self.rt.workers;
        self.next_loop_start = (self.next_loop_start + 1) % workers.len();

        let mut preempt_candidate: Option<usize> = None;
        let mut min_wait = u64::MAX;
        let mut min_wait_worker = 0usize;

        for offset in 0..workers.len() {
            let idx = (self.next_loop_start + offset) % workers.len();
            let worker = &workers[idx];
            let probe = worker.runqueue.try_add(
                &sandbox,
                worker.current_deadline.load(Ordering::Acquire),
                worker.current_preemptable.load(Ordering::Acquire),
            );
            match probe {
                TryAdd::Idle => {
                    place_on_worker(&self.rt, worker, sandbox);
                    return;
                }
                TryAdd::Preempt => {
                    preempt_candidate = Some(match preempt_candidate {
                        Some(best)
                            if workers[best].queuing_cost.get() <= worker.queuing_cost.get() =>
                        {
                            best
                        }
                        _ => idx,
                    });
                }
                TryAdd::Wait(wait) => {
                    if wait < min_wait {
                        min_wait = wait;
                        min_wait_worker = idx;
                    }
                }
            }
        }

        if let Some(idx) = preempt_candidate {
            let worker = &workers[idx];
            place_on_worker(&self.rt, worker, sandbox);
            worker.interrupt();
        } else {
            place_on_worker(&self.rt, &workers[min_wait_worker], sandbox);
        }
    }

    fn type_index(&self, route: &Arc<Route>) -> usize {
        self.typed
            .iter()
            .position(|t| Arc::ptr_eq(&t.route, route))
            .expect("every route has a typed queue")
    }

    /// A preempted sandbox comes back to the front of its type's deque.
    fn writeback(&mut self, sandbox: Arc<Sandbox>, at: u64) {
        let type_idx = self.type_index(&sandbox.route);
        if sandbox.state() == crate::sandbox::state::SandboxState::Preempted {
            self.typed[type_idx].fifo.push_front((sandbox, at));
        }
    }

    /// DARC: drain each type's FIFO onto its reserved slice, stealing from
    /// foreign slices when a reserved worker is busy. No preemption.
    fn darc_dispatch(&mut self) {
        for type_idx in 0..self.typed.len() {
            while !self.typed[type_idx].fifo.is_empty() && self.free_workers != 0 {
                let candidate = self.pick_darc_worker(type_idx);
                let Some(worker_idx) = candidate else {
                    break;
                };
                let (sandbox, _ts) = self.typed[type_idx]
                    .fifo
                    .pop_front()
                    .expect("checked non-empty");
                self.free_workers &= !(1 << worker_idx);
                place_on_worker(&self.rt, &self.rt.workers[worker_idx], sandbox);
            }
        }
    }

    fn pick_darc_worker(&self, type_idx: usize) -> Option<usize> {
        let queue = &self.typed[type_idx];
        queue
            .reserved_workers
            .iter()
            .chain(queue.stealable_workers.iter())
            .copied()
            .find(|&w| w < 32 && self.free_workers & (1 << w) != 0)
    }

    /// Shinjuku: idle workers take the oldest-relative-to-deadline head;
    /// busy workers past the interrupt interval are preempted and handed a
    /// newly selected sandbox.
    fn shinjuku_dispatch(&mut self) {
        let now = cycles();
        let worker_count = self.rt.workers.len();
        self.next_loop_start = (self.next_loop_start + 1) % worker_count;

        for offset in 0..worker_count {
            let idx = (self.next_loop_start + offset) % worker_count;
            let worker = self.rt.workers[idx].clone();

            if worker.runqueue.is_empty() {
                let Some(sandbox) = self.shinjuku_select(now) else {
                    return;
                };
                sandbox.timestamps.last_run_start.store(now, Ordering::Release);
                place_on_worker(&self.rt, &worker, sandbox);
                self.free_workers &= !(1 << idx.min(31));
            } else {
                let running_for = now.saturating_sub(worker.run_start.load(Ordering::Acquire));
                let busy_current = worker.current_deadline.load(Ordering::Acquire) != u64::MAX;
                if busy_current && running_for >= self.shinjuku_interval_cycles {
                    let Some(sandbox) = self.shinjuku_select(now) else {
                        return;
                    };
                    place_on_worker(&self.rt, &worker, sandbox);
                    worker.interrupt();
                }
            }
        }
    }

    /// Picks the deque whose head has aged the most relative to its route's
    /// deadline.
    fn shinjuku_select(&mut self, now: u64) -> Option<Arc<Sandbox>> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, queue) in self.typed.iter().enumerate() {
            let Some((_, ts)) = queue.fifo.front() else {
                continue;
            };
            let age = now.saturating_sub(*ts) as f64;
            let ratio = age / queue.route.relative_deadline_cycles as f64;
            if best.map_or(true, |(_, r)| ratio > r) {
                best = Some((idx, ratio));
            }
        }
        best.and_then(|(idx, _)| self.typed[idx].fifo.pop_front().map(|(s, _)| s))
    }

    /// Sheds best-effort work on busy workers until roughly `shed_cycles`
    /// of committed demand is freed.
    fn shed_best_effort(&mut self, shed_cycles: u64) {
        let mut freed = 0u64;
        for worker in &self.rt.workers {
            if freed >= shed_cycles {
                break;
            }
            if worker.current_best_effort.load(Ordering::Acquire) {
                if worker.inbox.push(ListenerToWorker::ShedCurrentJob).is_ok() {
                    freed += worker.queuing_cost.get().max(1);
                    worker.interrupt();
                }
            }
        }
    }
}

fn build_typed_queues(rt: &Runtime) -> Vec<TypedQueue> {
    let routes: Vec<Arc<Route>> = rt
        .tenants
        .iter()
        .flat_map(|t| t.routes.iter().cloned())
        .collect();
    let nworkers = rt.workers.len();
    let nroutes = routes.len().max(1);
    routes
        .into_iter()
        .enumerate()
        .map(|(i, route)| {
            // Contiguous reserved slice; everything else is stealable.
            let start = i * nworkers / nroutes;
            let end = ((i + 1) * nworkers / nroutes).max(start + 1).min(nworkers);
            let reserved_workers: Vec<usize> = (start..end).collect();
            let stealable_workers: Vec<usize> =
                (0..nworkers).filter(|w| !reserved_workers.contains(w)).collect();
            TypedQueue {
                route,
                fifo: VecDeque::new(),
                reserved_workers,
                stealable_workers,
            }
        })
        .collect()
}

fn bind_listener(port: u16) -> Result<TcpListener, Error> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|source| {
        Error::ClientSocket { source }
    })?;
    socket
        .set_reuse_address(true)
        .and_then(|()| socket.set_nonblocking(true))
        .and_then(|()| socket.bind(&std::net::SocketAddr::from(([0, 0, 0, 0], port)).into()))
        .and_then(|()| socket.listen(1024))
        .map_err(|source| Error::ClientSocket { source })?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use sledge_rt_config::RuntimeConfig;
    use sledge_rt_config::options::SchedulerPolicy;
    use sledge_rt_telemetry::Metrics;

    fn runtime(dispatcher: DispatcherPolicy) -> Arc<Runtime> {
        let mut options = testing::stub_options();
        options.dispatcher = dispatcher;
        options.scheduler = SchedulerPolicy::Edf;
        options.nworkers = 2;
        let metrics = Arc::new(Metrics::new().expect("fresh registry"));
        Runtime::build(&RuntimeConfig { tenants: vec![] }, options, metrics).expect("runtime")
    }

    fn dispatcher_for(rt: &Arc<Runtime>) -> Dispatcher {
        Dispatcher {
            rt: rt.clone(),
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).expect("epoll"),
            acceptors: HashMap::new(),
            receiving: HashMap::new(),
            typed: build_typed_queues(rt),
            next_loop_start: 0,
            free_workers: (1 << rt.workers.len()) - 1,
            shinjuku_interval_cycles: rt.options.us_to_cycles(SHINJUKU_INTERRUPT_INTERVAL_US),
        }
    }

    #[test]
    fn edf_interrupt_prefers_an_idle_worker() {
        let rt = runtime(DispatcherPolicy::EdfInterrupt);
        let mut dispatcher = dispatcher_for(&rt);
        let sandbox = testing::stub_sandbox();
        rt.assign_priority(&sandbox, cycles());
        dispatcher.dispatch_edf_interrupt(sandbox.clone());
        let placed = sandbox.owner_worker().expect("placed somewhere");
        assert!(!rt.workers[placed].runqueue.is_empty());
        assert_eq!(
            sandbox.state(),
            crate::sandbox::state::SandboxState::Runnable
        );
    }

    #[test]
    fn edf_interrupt_picks_the_preemptable_worker_over_waiting() {
        let rt = runtime(DispatcherPolicy::EdfInterrupt);
        let mut dispatcher = dispatcher_for(&rt);

        // Worker 0 busy with an early, non-preemptable deadline; worker 1
        // busy with a late, preemptable one.
        let w0_resident = testing::stub_sandbox();
        w0_resident.set_priority(100);
        place_on_worker(&rt, &rt.workers[0], w0_resident);
        rt.workers[0].current_deadline.store(100, Ordering::Release);
        rt.workers[0].current_preemptable.store(false, Ordering::Release);

        let w1_resident = testing::stub_sandbox();
        w1_resident.set_priority(u64::MAX - 1);
        place_on_worker(&rt, &rt.workers[1], w1_resident);
        rt.workers[1]
            .current_deadline
            .store(u64::MAX - 1, Ordering::Release);
        rt.workers[1].current_preemptable.store(true, Ordering::Release);

        let challenger = testing::stub_sandbox();
        challenger.set_priority(50_000);
        dispatcher.dispatch_edf_interrupt(challenger.clone());
        assert_eq!(challenger.owner_worker(), Some(1));
    }

    #[test]
    fn darc_respects_reservations_then_steals() {
        let rt = runtime(DispatcherPolicy::Darc);
        let mut dispatcher = dispatcher_for(&rt);
        // Hand-build a typed queue reserved on worker 1 with worker 0
        // stealable.
        let tenant = testing::stub_tenant();
        let route = tenant.routes[0].clone();
        dispatcher.typed = vec![TypedQueue {
            route: route.clone(),
            fifo: VecDeque::new(),
            reserved_workers: vec![1],
            stealable_workers: vec![0],
        }];

        let first = testing::stub_sandbox_with(tenant.clone(), cycles());
        rt.assign_priority(&first, cycles());
        let second = testing::stub_sandbox_with(tenant.clone(), cycles());
        rt.assign_priority(&second, cycles());
        dispatcher.typed[0].fifo.push_back((first.clone(), 1));
        dispatcher.typed[0].fifo.push_back((second.clone(), 2));

        dispatcher.darc_dispatch();
        // The reserved worker takes the first, the stealable one the second.
        assert_eq!(first.owner_worker(), Some(1));
        assert_eq!(second.owner_worker(), Some(0));
        assert_eq!(dispatcher.free_workers, 0);

        // With no free workers, nothing more is drained.
        let third = testing::stub_sandbox_with(tenant, cycles());
        dispatcher.typed[0].fifo.push_back((third.clone(), 3));
        dispatcher.darc_dispatch();
        assert_eq!(third.owner_worker(), None);
    }

    #[test]
    fn shinjuku_selects_the_most_aged_head() {
        let rt = runtime(DispatcherPolicy::Shinjuku);
        let mut dispatcher = dispatcher_for(&rt);
        let tenant_a = testing::stub_tenant_named("a", 11_000);
        let tenant_b = testing::stub_tenant_named("b", 11_001);
        let route_a = tenant_a.routes[0].clone();
        let route_b = tenant_b.routes[0].clone();
        dispatcher.typed = vec![
            TypedQueue {
                route: route_a,
                fifo: VecDeque::new(),
                reserved_workers: vec![],
                stealable_workers: vec![],
            },
            TypedQueue {
                route: route_b,
                fifo: VecDeque::new(),
                reserved_workers: vec![],
                stealable_workers: vec![],
            },
        ];

        let now = cycles();
        let young = testing::stub_sandbox_with(tenant_a, now);
        let old = testing::stub_sandbox_with(tenant_b, now);
        dispatcher.typed[0].fifo.push_back((young.clone(), now));
        dispatcher.typed[1]
            .fifo
            .push_back((old.clone(), now.saturating_sub(1_000_000)));

        let selected = dispatcher.shinjuku_select(now).expect("non-empty");
        assert_eq!(selected.id, old.id);
    }

    #[test]
    fn writeback_goes_to_the_front() {
        let rt = runtime(DispatcherPolicy::Shinjuku);
        let mut dispatcher = dispatcher_for(&rt);
        let tenant = testing::stub_tenant();
        let route = tenant.routes[0].clone();
        dispatcher.typed = vec![TypedQueue {
            route,
            fifo: VecDeque::new(),
            reserved_workers: vec![],
            stealable_workers: vec![],
        }];

        let waiting = testing::stub_sandbox_with(tenant.clone(), cycles());
        dispatcher.typed[0].fifo.push_back((waiting, 10));

        let preempted = testing::stub_sandbox_with(tenant, cycles());
        preempted.set_as_runnable();
        preempted.set_as_running_sys();
        preempted.set_as_running_user();
        preempted.set_as_interrupted();
        preempted.set_as_preempted();
        dispatcher.writeback(preempted.clone(), 5);
        assert_eq!(
            dispatcher.typed[0].fifo.front().map(|(s, _)| s.id),
            Some(preempted.id)
        );
    }
}
