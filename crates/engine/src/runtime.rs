// SPDX-License-Identifier: Apache-2.0

//! Process-wide runtime state.
//!
//! One [`Runtime`] ties together the tenants, the admission ledger, the
//! global request queue, and one [`WorkerHandle`] per worker thread. The
//! preemption signal handler reaches it through the installed global, the
//! same way every other thread does.

use crate::admission::AdmissionsControl;
use crate::global_queue::GlobalQueue;
use crate::local_runqueue::{LocalRunqueue, QueuingCost};
use crate::rings::{ListenerToWorker, SpscRing, WorkerToListener};
use crate::sandbox::state::SandboxState;
use crate::sandbox::{ListAdapter, Sandbox, transition};
use crate::scratch::ScratchStorage;
use crate::tenant::Tenant;
use crate::traffic_control::TrafficControl;
use intrusive_collections::LinkedList;
use nix::sys::epoll::{Epoll, EpollCreateFlags};
use parking_lot::Mutex;
use sledge_rt_config::RuntimeConfig;
use sledge_rt_config::options::{RuntimeOptions, SchedulerPolicy};
use sledge_rt_telemetry::Metrics;
use sledge_rt_telemetry::perf_log::PerfLog;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Capacity of each direction of a listener↔worker ring.
pub const RING_CAPACITY: usize = 256;

/// Shared per-worker state: the run queue, the signaling fabric, and the
/// snapshots the dispatcher probes.
pub struct WorkerHandle {
    /// Worker index, which is also its core offset.
    pub index: usize,
    /// The worker's local run queue.
    pub runqueue: LocalRunqueue,
    /// Summed remaining cost of everything resident on this worker.
    pub queuing_cost: QueuingCost,
    /// Deadline of the sandbox currently running; `u64::MAX` when idle.
    pub current_deadline: AtomicU64,
    /// Whether the current sandbox is in its preemptable state.
    pub current_preemptable: AtomicBool,
    /// Whether the current sandbox belongs to a best-effort tenant.
    pub current_best_effort: AtomicBool,
    /// When the current dispatch started running (Shinjuku's aging clock).
    pub run_start: AtomicU64,
    /// Listener → worker messages.
    pub inbox: SpscRing<ListenerToWorker>,
    /// Worker → listener messages.
    pub outbox: SpscRing<WorkerToListener>,
    /// Terminal sandboxes awaiting teardown by the owning worker.
    pub cleanup: Mutex<LinkedList<ListAdapter>>,
    /// Sandboxes parked on a blocking host call, keyed by sandbox id.
    pub sleeping: Mutex<HashMap<u64, Arc<Sandbox>>>,
    /// The worker's epoll instance for sleeping sandboxes' sockets.
    pub epoll: Epoll,
    /// OS thread handle for targeted signals, set when the worker starts.
    pub pthread: Mutex<Option<nix::sys::pthread::Pthread>>,
}

impl WorkerHandle {
    fn new(index: usize, runqueue: LocalRunqueue) -> Result<Self, crate::error::Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|source| {
            crate::error::Error::Setup {
                detail: "worker epoll",
                source,
            }
        })?;
        Ok(Self {
            index,
            runqueue,
            queuing_cost: QueuingCost::default(),
            current_deadline: AtomicU64::new(u64::MAX),
            current_preemptable: AtomicBool::new(false),
            current_best_effort: AtomicBool::new(false),
            run_start: AtomicU64::new(0),
            inbox: SpscRing::new(RING_CAPACITY),
            outbox: SpscRing::new(RING_CAPACITY),
            cleanup: Mutex::new(LinkedList::new(ListAdapter::new())),
            sleeping: Mutex::new(HashMap::new()),
            epoll,
            pthread: Mutex::new(None),
        })
    }

    /// True when no sandbox is resident or running here.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.runqueue.is_empty() && self.current_deadline.load(Ordering::Acquire) == u64::MAX
    }

    /// Sends the preemption signal to this worker's thread, if it started.
    pub fn interrupt(&self) {
        if let Some(pthread) = *self.pthread.lock() {
            let _ = nix::sys::pthread::pthread_kill(pthread, nix::sys::signal::Signal::SIGALRM);
        }
    }
}

/// The process-wide runtime.
pub struct Runtime {
    /// Environment-derived knobs.
    pub options: RuntimeOptions,
    /// Every tenant this process serves.
    pub tenants: Vec<Arc<Tenant>>,
    /// One handle per worker thread.
    pub workers: Vec<Arc<WorkerHandle>>,
    /// The global request queue.
    pub global_queue: GlobalQueue,
    /// The admission ledger.
    pub admissions: AdmissionsControl,
    /// Traffic control; present only under MTDS/MTDBF.
    pub traffic: Option<TrafficControl>,
    /// The shared counter registry.
    pub metrics: Arc<Metrics>,
    /// Scratch storage shared by all guests.
    pub scratch: ScratchStorage,
    /// Per-sandbox perf log, when enabled.
    pub sandbox_perf_log: Option<PerfLog>,
    /// Per-session perf log, when enabled.
    pub http_perf_log: Option<PerfLog>,
    fifo_seq: AtomicU64,
}

static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Installs the runtime global for signal handlers and ABI shims.
pub fn install(runtime: Arc<Runtime>) {
    transition::register_to_hook(SandboxState::RunningUser, on_enter_running_user);
    transition::register_from_hook(SandboxState::RunningUser, on_leave_running_user);
    RUNTIME.set(runtime).map_err(|_| ()).expect("runtime installed twice");
}

/// The installed runtime; panics before [`install`].
#[must_use]
pub fn get() -> &'static Arc<Runtime> {
    RUNTIME.get().expect("runtime not installed")
}

/// The installed runtime, if any. Signal handlers use this form.
#[must_use]
pub fn try_get() -> Option<&'static Arc<Runtime>> {
    RUNTIME.get()
}

fn on_enter_running_user(sandbox: &Sandbox, _from: SandboxState) {
    if let (Some(rt), Some(worker)) = (try_get(), sandbox.owner_worker()) {
        if let Some(handle) = rt.workers.get(worker) {
            handle.current_preemptable.store(true, Ordering::Release);
        }
    }
}

fn on_leave_running_user(sandbox: &Sandbox, _to: SandboxState) {
    if let (Some(rt), Some(worker)) = (try_get(), sandbox.owner_worker()) {
        if let Some(handle) = rt.workers.get(worker) {
            handle.current_preemptable.store(false, Ordering::Release);
        }
    }
}

impl Runtime {
    /// Builds the runtime from a validated configuration: loads every
    /// tenant's modules, sizes the admission ledger, and shapes the queues
    /// for the selected policies.
    pub fn build(
        config: &RuntimeConfig,
        options: RuntimeOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, crate::error::Error> {
        let mut tenants = Vec::with_capacity(config.tenants.len());
        let mut reserved_fraction = 0;
        for tenant_config in &config.tenants {
            tenants.push(Tenant::build(tenant_config, &options)?);
            reserved_fraction += TrafficControl::reserved_fraction_x1024(tenant_config);
        }

        let mut workers = Vec::with_capacity(options.nworkers);
        for index in 0..options.nworkers {
            let runqueue = match (options.scheduler, options.dispatcher) {
                (SchedulerPolicy::Fifo, _) => LocalRunqueue::new_list(),
                (_, sledge_rt_config::options::DispatcherPolicy::EdfInterrupt) => {
                    LocalRunqueue::new_tree()
                }
                _ => LocalRunqueue::new_heap(),
            };
            workers.push(Arc::new(WorkerHandle::new(index, runqueue)?));
        }

        let global_queue = match options.scheduler {
            SchedulerPolicy::Fifo => GlobalQueue::new_fifo(),
            _ => GlobalQueue::new_deadline(),
        };

        let traffic = options.scheduler.uses_traffic_control().then(|| {
            TrafficControl::new(options.scheduler, options.nworkers, reserved_fraction)
        });

        let sandbox_perf_log = match &options.sandbox_perf_log {
            Some(path) => Some(
                PerfLog::create(path, "id,route,code,runnable,running_user,running_sys,total")
                    .map_err(|e| crate::error::Error::Thread {
                        detail: e.to_string(),
                    })?,
            ),
            None => None,
        };
        let http_perf_log = match &options.http_session_perf_log {
            Some(path) => Some(
                PerfLog::create(path, "route,code,arrival,downloaded,sent").map_err(|e| {
                    crate::error::Error::Thread {
                        detail: e.to_string(),
                    }
                })?,
            ),
            None => None,
        };

        Ok(Arc::new(Self {
            admissions: AdmissionsControl::new(options.nworkers),
            options,
            tenants,
            workers,
            global_queue,
            traffic,
            metrics,
            scratch: ScratchStorage::new(),
            sandbox_perf_log,
            http_perf_log,
            fifo_seq: AtomicU64::new(0),
        }))
    }

    /// Assigns the sandbox's queue key per the scheduling policy: the
    /// absolute deadline (EDF family), the sampled remaining slack (SRSF), or
    /// the arrival ordinal (FIFO).
    pub fn assign_priority(&self, sandbox: &Sandbox, now: u64) {
        let priority = match self.options.scheduler {
            SchedulerPolicy::Fifo => self.fifo_seq.fetch_add(1, Ordering::Relaxed),
            SchedulerPolicy::Srsf => sandbox
                .absolute_deadline
                .saturating_sub(now)
                .saturating_sub(sandbox.remaining_exec.load(Ordering::Acquire)),
            SchedulerPolicy::Edf | SchedulerPolicy::Mtds | SchedulerPolicy::Mtdbf => {
                sandbox.absolute_deadline
            }
        };
        sandbox.set_priority(priority);
    }

    /// Terminal bookkeeping shared by the Complete and Error paths: refund
    /// admission, retire traffic-control demand, count the response, and
    /// write the perf record. Runs exactly once per sandbox.
    pub fn finalize(&self, sandbox: &Arc<Sandbox>) {
        self.admissions.subtract(sandbox.admissions_estimate);
        if let Some(traffic) = &self.traffic {
            match &sandbox.tenant.reservation {
                Some(server) => {
                    server.reduce_demand(sandbox.absolute_deadline, sandbox.estimated_cost);
                }
                None => {
                    traffic.reduce_best_effort(sandbox.absolute_deadline, sandbox.estimated_cost);
                }
            }
        }
        let code = sandbox
            .response_code()
            .unwrap_or(crate::response::ResponseCode::INTERNAL_ERROR);
        self.metrics.count_response(code.as_u16());
        if !code.is_success() {
            self.metrics.total_rejections.inc();
        }
        if let Some(log) = &self.sandbox_perf_log {
            log.append(&format!(
                "{},{},{},{},{},{},{}",
                sandbox.id,
                sandbox.route.config.route,
                code.as_u16(),
                sandbox.duration_in(SandboxState::Runnable),
                sandbox.duration_in(SandboxState::RunningUser),
                sandbox.duration_in(SandboxState::RunningSys),
                sandbox.total_accounted(),
            ));
        }
    }

    /// The tenant listening on `port`.
    #[must_use]
    pub fn tenant_by_port(&self, port: u16) -> Option<&Arc<Tenant>> {
        self.tenants.iter().find(|t| t.port == port)
    }
}

/// Brings the whole runtime up: builds the shared state, installs the
/// signal fabric, spawns the metrics endpoint and one pinned worker per
/// core, arms the quantum timer, and finally becomes the listener. Returns
/// only on a setup error.
pub fn boot(
    config: &RuntimeConfig,
    options: RuntimeOptions,
) -> Result<std::convert::Infallible, crate::error::Error> {
    let metrics = Arc::new(Metrics::new().map_err(|e| crate::error::Error::Thread {
        detail: e.to_string(),
    })?);
    let rt = Runtime::build(config, options, metrics.clone())?;
    install(rt.clone());

    crate::preemption::install_handlers()?;
    // Threads spawned from here inherit a blocked preemption mask; workers
    // and the listener unblock it themselves.
    crate::preemption::block_worker_signals();

    sledge_rt_telemetry::metrics_server::spawn(
        metrics,
        sledge_rt_telemetry::metrics_server::DEFAULT_METRICS_PORT,
    )
    .map_err(|e| crate::error::Error::Thread {
        detail: e.to_string(),
    })?;

    for index in 0..rt.workers.len() {
        let rt_for_worker = rt.clone();
        std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || crate::worker::worker_main(rt_for_worker, index))
            .map_err(|e| crate::error::Error::Thread {
                detail: format!("spawn worker {index}: {e}"),
            })?;
    }

    crate::preemption::arm_timer(rt.options.quantum_us)?;

    let mut dispatcher = crate::dispatcher::Dispatcher::new(rt)?;
    dispatcher.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use sledge_rt_config::options::DispatcherPolicy;

    fn runtime_with(scheduler: SchedulerPolicy, dispatcher: DispatcherPolicy) -> Arc<Runtime> {
        let mut options = testing::stub_options();
        options.scheduler = scheduler;
        options.dispatcher = dispatcher;
        let config = RuntimeConfig { tenants: vec![] };
        let metrics = Arc::new(Metrics::new().expect("fresh registry"));
        Runtime::build(&config, options, metrics).expect("runtime")
    }

    #[test]
    fn queue_shapes_follow_the_policies() {
        let fifo = runtime_with(SchedulerPolicy::Fifo, DispatcherPolicy::Global);
        assert!(matches!(fifo.global_queue, GlobalQueue::Fifo(_)));
        assert!(matches!(fifo.workers[0].runqueue, LocalRunqueue::List(_)));

        let edf = runtime_with(SchedulerPolicy::Edf, DispatcherPolicy::Global);
        assert!(matches!(edf.global_queue, GlobalQueue::Deadline(_)));
        assert!(matches!(edf.workers[0].runqueue, LocalRunqueue::Heap(_)));

        let probe = runtime_with(SchedulerPolicy::Edf, DispatcherPolicy::EdfInterrupt);
        assert!(matches!(probe.workers[0].runqueue, LocalRunqueue::Tree(_)));

        let mtds = runtime_with(SchedulerPolicy::Mtds, DispatcherPolicy::Global);
        assert!(mtds.traffic.is_some());
        assert!(edf.traffic.is_none());
    }

    #[test]
    fn priorities_follow_the_policy() {
        let edf = runtime_with(SchedulerPolicy::Edf, DispatcherPolicy::Global);
        let sandbox = testing::stub_sandbox();
        edf.assign_priority(&sandbox, 0);
        assert_eq!(sandbox.priority(), sandbox.absolute_deadline);

        let srsf = runtime_with(SchedulerPolicy::Srsf, DispatcherPolicy::Global);
        let now = sandbox.timestamps.allocation;
        srsf.assign_priority(&sandbox, now);
        let expected = sandbox.absolute_deadline
            - now
            - sandbox.remaining_exec.load(Ordering::Acquire);
        assert_eq!(sandbox.priority(), expected);

        let fifo = runtime_with(SchedulerPolicy::Fifo, DispatcherPolicy::Global);
        let a = testing::stub_sandbox();
        let b = testing::stub_sandbox();
        fifo.assign_priority(&a, 0);
        fifo.assign_priority(&b, 0);
        assert!(a.priority() < b.priority());
    }

    #[test]
    fn finalize_refunds_admission_and_counts() {
        let rt = runtime_with(SchedulerPolicy::Edf, DispatcherPolicy::Global);
        let sandbox = testing::stub_sandbox();
        let est = rt
            .admissions
            .decide(sandbox.admissions_estimate)
            .expect("fits");
        assert_eq!(est, sandbox.admissions_estimate);
        sandbox.set_response_code(crate::response::ResponseCode::OK);
        rt.finalize(&sandbox);
        assert_eq!(rt.admissions.admitted(), 0);
        assert!(rt.metrics.render().contains("code=\"200\""));
    }
}
