// SPDX-License-Identifier: Apache-2.0

//! In-crate test fixtures: stub modules, tenants, loopback sessions, and
//! fully allocated sandboxes that never touch a real module image.

use crate::module::Module;
use crate::sandbox::Sandbox;
use crate::session::{HttpSession, Progress};
use crate::tenant::{Route, Tenant};
use sledge_rt_config::options::{
    DispatcherPolicy, RuntimeOptions, SchedulerPolicy, detect_processor_speed_mhz,
};
use sledge_rt_config::tenant::{RouteConfig, TenantConfig};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// Options with defaults suitable for unit tests.
pub(crate) fn stub_options() -> RuntimeOptions {
    RuntimeOptions {
        scheduler: SchedulerPolicy::Edf,
        dispatcher: DispatcherPolicy::Global,
        nworkers: 2,
        quantum_us: 5_000,
        sandbox_perf_log: None,
        http_session_perf_log: None,
        processor_speed_mhz: detect_processor_speed_mhz(),
    }
}

pub(crate) fn stub_route_config(path: &str, request_type: u8) -> RouteConfig {
    RouteConfig {
        route: path.to_owned(),
        request_type,
        module_path: "unused.so".to_owned(),
        estimated_execution_us: 1_000,
        relative_deadline_us: 10_000,
        max_request_size: 4096,
        max_response_size: 4096,
        expected_content_type: "text/plain".to_owned(),
    }
}

/// A tenant with one `/fib` route bound to a stub module.
pub(crate) fn stub_tenant() -> Arc<Tenant> {
    stub_tenant_named("test-tenant", 10_000)
}

pub(crate) fn stub_tenant_named(name: &str, port: u16) -> Arc<Tenant> {
    let options = stub_options();
    let module = Module::stub("fib", 1, 16);
    let route = Route::with_module(stub_route_config("/fib", 1), module, &options);
    Arc::new(Tenant {
        name: name.to_owned(),
        port,
        routes: vec![route],
        reservation: None,
    })
}

pub(crate) fn stub_reserved_tenant(name: &str, port: u16) -> Arc<Tenant> {
    let options = stub_options();
    let module = Module::stub("fib", 1, 16);
    let route = Route::with_module(stub_route_config("/fib", 1), module, &options);
    let config = TenantConfig {
        name: name.to_owned(),
        port,
        routes: vec![stub_route_config("/fib", 1)],
        replenishment_period_us: Some(10_000),
        guaranteed_budget_us: Some(2_000),
        max_relative_deadline_us: None,
    };
    Arc::new(Tenant {
        name: name.to_owned(),
        port,
        routes: vec![route],
        reservation: crate::traffic_control::ReservationServer::from_config(&config, &options),
    })
}

/// A connected session with its request already buffered; the returned client
/// stream keeps the connection alive.
pub(crate) fn loopback_session() -> (HttpSession, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral port");
    let addr = listener.local_addr().expect("bound");
    let mut client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    client
        .write_all(b"GET /fib HTTP/1.1\r\n\r\n")
        .expect("request bytes");
    let mut session = HttpSession::new(server, 1).expect("session");
    loop {
        match session.try_receive(4096, 2).expect("receive") {
            Progress::Complete => break,
            Progress::WouldBlock => std::thread::yield_now(),
        }
    }
    (session, client)
}

/// A fully allocated sandbox in `Initialized`, backed by a stub module and a
/// loopback session. The client half of the connection is leaked so the
/// socket stays open for the test's duration.
pub(crate) fn stub_sandbox() -> Arc<Sandbox> {
    stub_sandbox_with(stub_tenant(), sledge_rt_arch::cycles())
}

pub(crate) fn stub_sandbox_with(tenant: Arc<Tenant>, now: u64) -> Arc<Sandbox> {
    let (session, client) = loopback_session();
    std::mem::forget(client);
    let route = tenant.routes[0].clone();
    match Sandbox::allocate(&route, &tenant, session, route.admissions_estimate, now) {
        Ok(sandbox) => sandbox,
        Err((e, _session)) => panic!("stub sandbox allocation: {e}"),
    }
}
