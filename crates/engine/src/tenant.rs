// SPDX-License-Identifier: Apache-2.0

//! Runtime tenants and routes.
//!
//! A tenant owns a listen port, a route table, and (for reserved tenants) a
//! reservation server consulted by traffic control. A route binds a path and
//! request-type id to a module plus its cost and deadline estimates, with the
//! admission estimate pre-computed so the listener's hot path is a lookup and
//! a fetch-add.

use crate::admission;
use crate::error::Error;
use crate::module::Module;
use crate::traffic_control::ReservationServer;
use sledge_rt_config::options::RuntimeOptions;
use sledge_rt_config::tenant::{RouteConfig, TenantConfig};
use std::sync::Arc;

/// A tenant's named handler, bound to its module.
pub struct Route {
    /// The validated configuration this route was built from.
    pub config: RouteConfig,
    /// The loaded module, shared across the route's sandboxes.
    pub module: Arc<Module>,
    /// Unitless admission estimate: `estimated_execution × G ÷ deadline`.
    pub admissions_estimate: u64,
    /// The route's relative deadline, in cycles.
    pub relative_deadline_cycles: u64,
    /// The route's estimated execution cost, in cycles.
    pub estimated_cost_cycles: u64,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("route", &self.config.route)
            .field("request_type", &self.config.request_type)
            .finish_non_exhaustive()
    }
}

/// A configuration group owning modules, routes, and a TCP listen port.
pub struct Tenant {
    /// Tenant name, used in logs and traffic-control decisions.
    pub name: String,
    /// The tenant's listen port.
    pub port: u16,
    /// Routes, in configuration order.
    pub routes: Vec<Arc<Route>>,
    /// Reservation server; `None` for best-effort tenants.
    pub reservation: Option<ReservationServer>,
}

impl Tenant {
    /// Builds the runtime tenant from its validated config, loading every
    /// route's module.
    pub fn build(config: &TenantConfig, options: &RuntimeOptions) -> Result<Arc<Self>, Error> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            let module = Module::load(&route_config.route, &route_config.module_path)?;
            routes.push(Arc::new(Route::build(route_config.clone(), module, options)));
        }
        Ok(Arc::new(Self {
            name: config.name.clone(),
            port: config.port,
            routes,
            reservation: ReservationServer::from_config(config, options),
        }))
    }

    /// Finds the route matching a request path.
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.config.route == path)
    }

    /// Finds the route matching a request-type id (typed dispatch policies).
    #[must_use]
    pub fn match_request_type(&self, request_type: u8) -> Option<&Arc<Route>> {
        self.routes
            .iter()
            .find(|r| r.config.request_type == request_type)
    }

    /// True when the tenant holds a guaranteed reservation.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }
}

impl Route {
    fn build(config: RouteConfig, module: Arc<Module>, options: &RuntimeOptions) -> Self {
        let admissions_estimate = admission::calculate_estimate_us(
            config.estimated_execution_us,
            config.relative_deadline_us,
        );
        let relative_deadline_cycles = options.us_to_cycles(config.relative_deadline_us);
        let estimated_cost_cycles = options.us_to_cycles(config.estimated_execution_us);
        Self {
            config,
            module,
            admissions_estimate,
            relative_deadline_cycles,
            estimated_cost_cycles,
        }
    }

    /// Builds a route around an already-loaded (or stub) module.
    #[cfg(test)]
    pub(crate) fn with_module(
        config: RouteConfig,
        module: Arc<Module>,
        options: &RuntimeOptions,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, module, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn routes_match_by_path_and_type() {
        let tenant = testing::stub_tenant();
        assert!(tenant.match_route("/fib").is_some());
        assert!(tenant.match_route("/missing").is_none());
        assert!(tenant.match_request_type(1).is_some());
        assert!(tenant.match_request_type(9).is_none());
    }

    #[test]
    fn route_precomputes_cycle_quantities() {
        let tenant = testing::stub_tenant();
        let route = tenant.match_route("/fib").expect("configured");
        assert!(route.relative_deadline_cycles > route.estimated_cost_cycles);
        assert!(route.admissions_estimate > 0);
    }
}
