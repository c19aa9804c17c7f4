// SPDX-License-Identifier: Apache-2.0

//! Tenant and route configuration.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Configuration for a single tenant: one TCP listen port and the routes it
/// serves, plus optional reservation parameters for traffic control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Human-readable tenant name, used in logs and metrics labels.
    pub name: String,

    /// TCP port this tenant's requests arrive on.
    pub port: u16,

    /// The tenant's route table.
    pub routes: Vec<RouteConfig>,

    /// Reservation replenishment period in microseconds. Present together
    /// with `guaranteed_budget_us` for reserved tenants; absent for
    /// best-effort tenants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replenishment_period_us: Option<u64>,

    /// Guaranteed execution budget granted each replenishment period, in
    /// microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guaranteed_budget_us: Option<u64>,

    /// Upper bound accepted for any route's relative deadline, in
    /// microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_relative_deadline_us: Option<u64>,
}

impl TenantConfig {
    /// True when the tenant holds a guaranteed reservation.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.replenishment_period_us.is_some() && self.guaranteed_budget_us.is_some()
    }

    /// Validates the tenant and each of its routes.
    pub fn validate(&self) -> Result<(), Error> {
        if self.routes.is_empty() {
            return Err(Error::NoRoutes {
                tenant: self.name.clone(),
            });
        }
        if self.replenishment_period_us.is_some() != self.guaranteed_budget_us.is_some() {
            return Err(Error::InvalidReservation {
                tenant: self.name.clone(),
                detail: "replenishment_period_us and guaranteed_budget_us must be set together"
                    .to_owned(),
            });
        }
        if let (Some(period), Some(budget)) =
            (self.replenishment_period_us, self.guaranteed_budget_us)
        {
            if budget == 0 || period == 0 || budget > period {
                return Err(Error::InvalidReservation {
                    tenant: self.name.clone(),
                    detail: format!(
                        "guaranteed budget {budget}us must be positive and within the {period}us period"
                    ),
                });
            }
        }
        let mut seen_paths = std::collections::HashSet::new();
        let mut seen_types = std::collections::HashSet::new();
        for route in &self.routes {
            route.validate(&self.name)?;
            if let Some(cap) = self.max_relative_deadline_us {
                if route.relative_deadline_us > cap {
                    return Err(Error::InvalidRoute {
                        tenant: self.name.clone(),
                        route: route.route.clone(),
                        detail: format!(
                            "relative deadline {}us exceeds tenant cap {cap}us",
                            route.relative_deadline_us
                        ),
                    });
                }
            }
            if !seen_paths.insert(route.route.as_str()) {
                return Err(Error::InvalidRoute {
                    tenant: self.name.clone(),
                    route: route.route.clone(),
                    detail: "duplicate route path".to_owned(),
                });
            }
            if !seen_types.insert(route.request_type) {
                return Err(Error::InvalidRoute {
                    tenant: self.name.clone(),
                    route: route.route.clone(),
                    detail: "duplicate request type id".to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration for one route: a path mapped to a module with its cost and
/// deadline estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Request path this route matches.
    pub route: String,

    /// Request-type identifier used by the typed dispatch policies. Must be
    /// unique within the tenant and non-zero.
    pub request_type: u8,

    /// Filesystem path of the module shared object.
    pub module_path: String,

    /// Expected execution time of one request, in microseconds.
    pub estimated_execution_us: u64,

    /// Relative deadline granted to each request, in microseconds.
    pub relative_deadline_us: u64,

    /// Largest request body accepted, in bytes.
    pub max_request_size: usize,

    /// Largest response body produced, in bytes.
    pub max_response_size: usize,

    /// Content type the route expects and responds with.
    pub expected_content_type: String,
}

impl RouteConfig {
    fn validate(&self, tenant: &str) -> Result<(), Error> {
        let invalid = |detail: String| Error::InvalidRoute {
            tenant: tenant.to_owned(),
            route: self.route.clone(),
            detail,
        };
        if self.route.is_empty() || !self.route.starts_with('/') {
            return Err(invalid("route path must start with '/'".to_owned()));
        }
        if self.request_type == 0 {
            return Err(invalid("request type id 0 is reserved".to_owned()));
        }
        if self.estimated_execution_us == 0 {
            return Err(invalid("estimated execution must be positive".to_owned()));
        }
        if self.relative_deadline_us == 0 {
            return Err(invalid("relative deadline must be positive".to_owned()));
        }
        if self.module_path.is_empty() {
            return Err(invalid("module path is empty".to_owned()));
        }
        if self.max_request_size == 0 || self.max_response_size == 0 {
            return Err(invalid("request/response size caps must be positive".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, request_type: u8) -> RouteConfig {
        RouteConfig {
            route: path.to_owned(),
            request_type,
            module_path: "mod.so".to_owned(),
            estimated_execution_us: 500,
            relative_deadline_us: 5_000,
            max_request_size: 1024,
            max_response_size: 1024,
            expected_content_type: "text/plain".to_owned(),
        }
    }

    fn tenant(routes: Vec<RouteConfig>) -> TenantConfig {
        TenantConfig {
            name: "t".to_owned(),
            port: 10000,
            routes,
            replenishment_period_us: None,
            guaranteed_budget_us: None,
            max_relative_deadline_us: None,
        }
    }

    #[test]
    fn valid_tenant_passes() {
        tenant(vec![route("/a", 1), route("/b", 2)])
            .validate()
            .expect("valid");
    }

    #[test]
    fn duplicate_request_types_fail() {
        let err = tenant(vec![route("/a", 1), route("/b", 1)])
            .validate()
            .expect_err("duplicate type");
        assert!(matches!(err, Error::InvalidRoute { .. }));
    }

    #[test]
    fn half_a_reservation_fails() {
        let mut t = tenant(vec![route("/a", 1)]);
        t.guaranteed_budget_us = Some(1000);
        assert!(matches!(t.validate(), Err(Error::InvalidReservation { .. })));
        t.replenishment_period_us = Some(10_000);
        t.validate().expect("complete reservation");
        assert!(t.is_reserved());
    }

    #[test]
    fn deadline_cap_is_enforced() {
        let mut t = tenant(vec![route("/a", 1)]);
        t.max_relative_deadline_us = Some(1_000);
        assert!(matches!(t.validate(), Err(Error::InvalidRoute { .. })));
    }

    #[test]
    fn zero_cost_routes_fail() {
        let mut r = route("/a", 1);
        r.estimated_execution_us = 0;
        assert!(tenant(vec![r]).validate().is_err());
    }
}
