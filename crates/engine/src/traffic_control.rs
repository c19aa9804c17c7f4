// SPDX-License-Identifier: Apache-2.0

//! Per-tenant traffic control.
//!
//! Under the MTDS/MTDBF policies every reserved tenant runs a reservation
//! server: a guaranteed execution budget replenished each period, plus a
//! demand list keyed by absolute deadline that implements the tenant's
//! demand-bound function. An arrival is admitted when the aggregated demand
//! due by its deadline still fits the tenant's supply in that window; a
//! reserved tenant that does not fit may shed best-effort work elsewhere,
//! while a best-effort tenant is simply rejected.

use crate::sandbox::Sandbox;
use parking_lot::Mutex;
use sledge_rt_config::options::{RuntimeOptions, SchedulerPolicy};
use sledge_rt_config::tenant::TenantConfig;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// One unit of committed future work.
#[derive(Debug, Clone, Copy)]
struct DemandNode {
    abs_deadline: u64,
    demand: u64,
}

/// Verdict on one arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDecision {
    /// The demand fits; run it.
    Admit,
    /// A reserved tenant's demand does not fit its own supply; admit it after
    /// shedding this many cycles of best-effort work elsewhere.
    AdmitAfterShed {
        /// Best-effort cycles that must be shed to make room.
        shed_cycles: u64,
    },
    /// A best-effort arrival that does not fit anywhere.
    Reject,
}

/// What to do with a sandbox whose guaranteed budget ran out mid-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetOutcome {
    /// Budget intact; keep running.
    Ok,
    /// Demote to best-effort (code 4091).
    Demote,
    /// Kill outright (code 4093).
    Kill,
}

/// A reserved tenant's guaranteed-budget server and demand ledger.
pub struct ReservationServer {
    period_cycles: u64,
    budget_per_period: u64,
    guaranteed_remaining: AtomicI64,
    last_replenish: AtomicU64,
    demand: Mutex<Vec<DemandNode>>,
}

impl ReservationServer {
    /// Builds the server for a reserved tenant config; `None` for
    /// best-effort tenants.
    #[must_use]
    pub fn from_config(config: &TenantConfig, options: &RuntimeOptions) -> Option<Self> {
        let period = config.replenishment_period_us?;
        let budget = config.guaranteed_budget_us?;
        Some(Self {
            period_cycles: options.us_to_cycles(period),
            budget_per_period: options.us_to_cycles(budget),
            guaranteed_remaining: AtomicI64::new(options.us_to_cycles(budget) as i64),
            last_replenish: AtomicU64::new(0),
            demand: Mutex::new(Vec::new()),
        })
    }

    /// The tenant's supply fraction as budget cycles per period cycle, scaled
    /// into a window of `window` cycles.
    fn supply_in(&self, window: u64) -> u64 {
        (u128::from(window) * u128::from(self.budget_per_period) / u128::from(self.period_cycles))
            as u64
    }

    /// Refills the guaranteed budget once per elapsed period. The budget does
    /// not accumulate across idle periods.
    pub fn replenish(&self, now: u64) {
        let last = self.last_replenish.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.period_cycles {
            return;
        }
        if self
            .last_replenish
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.guaranteed_remaining
                .store(self.budget_per_period as i64, Ordering::Release);
        }
    }

    /// Charges execution time against the guaranteed budget; returns the
    /// remainder, which goes negative on overrun.
    pub fn consume(&self, cycles: u64) -> i64 {
        self.guaranteed_remaining
            .fetch_sub(cycles as i64, Ordering::AcqRel)
            - cycles as i64
    }

    /// Remaining guaranteed budget in cycles (possibly negative).
    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.guaranteed_remaining.load(Ordering::Acquire)
    }

    /// Checks the demand-bound function for an arrival of `cost` cycles due
    /// at `abs_deadline`, and records the demand when it fits. On a miss,
    /// returns the overflow in cycles.
    pub fn try_add_demand(&self, now: u64, abs_deadline: u64, cost: u64) -> Result<(), u64> {
        let mut demand = self.demand.lock();
        demand.retain(|node| node.abs_deadline > now);

        let due_by_deadline: u64 = demand
            .iter()
            .filter(|node| node.abs_deadline <= abs_deadline)
            .map(|node| node.demand)
            .sum();
        let supply = self.supply_in(abs_deadline.saturating_sub(now));
        let total = due_by_deadline + cost;
        if total > supply {
            return Err(total - supply);
        }
        let insert_at = demand.partition_point(|node| node.abs_deadline <= abs_deadline);
        demand.insert(
            insert_at,
            DemandNode {
                abs_deadline,
                demand: cost,
            },
        );
        Ok(())
    }

    /// Retires up to `cycles` of demand recorded at `abs_deadline`, on
    /// completion or when actual execution undershoots the estimate.
    pub fn reduce_demand(&self, abs_deadline: u64, cycles: u64) {
        let mut demand = self.demand.lock();
        if let Some(node) = demand
            .iter_mut()
            .find(|node| node.abs_deadline == abs_deadline)
        {
            node.demand = node.demand.saturating_sub(cycles);
        }
        demand.retain(|node| node.demand > 0);
    }

    /// Total outstanding demand, for tests and diagnostics.
    #[must_use]
    pub fn outstanding_demand(&self) -> u64 {
        self.demand.lock().iter().map(|node| node.demand).sum()
    }
}

/// Process-wide traffic control, consulted only under MTDS/MTDBF.
pub struct TrafficControl {
    policy: SchedulerPolicy,
    best_effort_demand: Mutex<Vec<DemandNode>>,
    /// Cycles of supply available to best-effort work per cycle of wall
    /// clock, scaled by 2^10 to keep the arithmetic integral.
    best_effort_supply_x1024: u64,
}

/// Scale factor for the best-effort supply fraction.
const SUPPLY_SCALE: u64 = 1024;

impl TrafficControl {
    /// Builds traffic control over `workers` cores, with every reserved
    /// tenant's fraction carved out of the best-effort supply.
    #[must_use]
    pub fn new(policy: SchedulerPolicy, workers: usize, reserved_fractions_x1024: u64) -> Self {
        let raw = workers as u64 * SUPPLY_SCALE;
        Self {
            policy,
            best_effort_demand: Mutex::new(Vec::new()),
            best_effort_supply_x1024: raw.saturating_sub(reserved_fractions_x1024).max(1),
        }
    }

    /// The scaled supply fraction a tenant config reserves.
    #[must_use]
    pub fn reserved_fraction_x1024(config: &TenantConfig) -> u64 {
        match (config.guaranteed_budget_us, config.replenishment_period_us) {
            (Some(budget), Some(period)) if period > 0 => budget * SUPPLY_SCALE / period,
            _ => 0,
        }
    }

    /// Decides one arrival for `tenant`.
    pub fn decide(
        &self,
        reservation: Option<&ReservationServer>,
        now: u64,
        abs_deadline: u64,
        cost: u64,
    ) -> TrafficDecision {
        match reservation {
            Some(server) => {
                server.replenish(now);
                match server.try_add_demand(now, abs_deadline, cost) {
                    Ok(()) => TrafficDecision::Admit,
                    Err(overflow) => TrafficDecision::AdmitAfterShed {
                        shed_cycles: overflow,
                    },
                }
            }
            None => {
                let mut demand = self.best_effort_demand.lock();
                demand.retain(|node| node.abs_deadline > now);
                let due: u64 = demand
                    .iter()
                    .filter(|node| node.abs_deadline <= abs_deadline)
                    .map(|node| node.demand)
                    .sum();
                let window = abs_deadline.saturating_sub(now);
                let supply = (u128::from(window) * u128::from(self.best_effort_supply_x1024)
                    / u128::from(SUPPLY_SCALE)) as u64;
                if due + cost > supply {
                    return TrafficDecision::Reject;
                }
                let insert_at = demand.partition_point(|node| node.abs_deadline <= abs_deadline);
                demand.insert(
                    insert_at,
                    DemandNode {
                        abs_deadline,
                        demand: cost,
                    },
                );
                TrafficDecision::Admit
            }
        }
    }

    /// Retires best-effort demand on completion.
    pub fn reduce_best_effort(&self, abs_deadline: u64, cycles: u64) {
        let mut demand = self.best_effort_demand.lock();
        if let Some(node) = demand
            .iter_mut()
            .find(|node| node.abs_deadline == abs_deadline)
        {
            node.demand = node.demand.saturating_sub(cycles);
        }
        demand.retain(|node| node.demand > 0);
    }

    /// Charges `cycles` of execution by `sandbox` against its tenant's
    /// guaranteed budget and classifies the outcome.
    pub fn charge_execution(&self, sandbox: &Sandbox, cycles: u64) -> BudgetOutcome {
        let Some(server) = &sandbox.tenant.reservation else {
            return BudgetOutcome::Ok;
        };
        if server.consume(cycles) > 0 {
            return BudgetOutcome::Ok;
        }
        match self.policy {
            SchedulerPolicy::Mtds => BudgetOutcome::Demote,
            _ => BudgetOutcome::Kill,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn server() -> ReservationServer {
        let options = testing::stub_options();
        let config = TenantConfig {
            name: "r".to_owned(),
            port: 1,
            routes: vec![testing::stub_route_config("/fib", 1)],
            // 20% reservation: 2ms guaranteed every 10ms.
            replenishment_period_us: Some(10_000),
            guaranteed_budget_us: Some(2_000),
            max_relative_deadline_us: None,
        };
        ReservationServer::from_config(&config, &options).expect("reserved config")
    }

    #[test]
    fn demand_fits_the_reserved_fraction_only() {
        let rs = server();
        let period = rs.period_cycles;
        let budget = rs.budget_per_period;
        // A job using the whole window's guaranteed share fits exactly...
        rs.try_add_demand(0, period, budget).expect("fits");
        // ...and one more cycle does not.
        let overflow = rs.try_add_demand(0, period, 1).expect_err("over supply");
        assert_eq!(overflow, 1);
        // Work due later has its own supply window.
        rs.try_add_demand(0, 2 * period, budget).expect("next window");
    }

    #[test]
    fn expired_and_retired_demand_frees_the_window() {
        let rs = server();
        let period = rs.period_cycles;
        let budget = rs.budget_per_period;
        rs.try_add_demand(0, period, budget).expect("fits");
        assert_eq!(rs.outstanding_demand(), budget);
        rs.reduce_demand(period, budget);
        assert_eq!(rs.outstanding_demand(), 0);
        rs.try_add_demand(0, period, budget).expect("fits again");
        // Once the deadline passes, stale nodes are pruned on the next probe.
        rs.try_add_demand(period + 1, 3 * period, budget)
            .expect("fresh window");
    }

    #[test]
    fn budget_replenishes_per_period_without_accumulating() {
        let rs = server();
        let budget = rs.budget_per_period;
        let period = rs.period_cycles;
        assert!(rs.consume(budget / 2) > 0);
        assert!(rs.consume(budget) < 0);
        // Many idle periods later, exactly one budget is available.
        rs.replenish(10 * period);
        assert_eq!(rs.remaining(), budget as i64);
        // Within the same period, replenish is a no-op.
        let _ = rs.consume(budget / 4);
        rs.replenish(10 * period + 1);
        assert_eq!(rs.remaining(), (budget - budget / 4) as i64);
    }

    #[test]
    fn best_effort_rejected_when_demand_exceeds_free_supply() {
        let tc = TrafficControl::new(SchedulerPolicy::Mtdbf, 1, 512);
        // Half the single worker remains for best effort: a window of 1000
        // cycles supplies 500.
        assert_eq!(tc.decide(None, 0, 1000, 400), TrafficDecision::Admit);
        assert_eq!(tc.decide(None, 0, 1000, 200), TrafficDecision::Reject);
        tc.reduce_best_effort(1000, 400);
        assert_eq!(tc.decide(None, 0, 1000, 200), TrafficDecision::Admit);
    }

    #[test]
    fn reserved_tenants_shed_instead_of_rejecting() {
        let tc = TrafficControl::new(SchedulerPolicy::Mtds, 1, 512);
        let rs = server();
        let period = rs.period_cycles;
        let budget = rs.budget_per_period;
        assert_eq!(
            tc.decide(Some(&rs), 0, period, budget),
            TrafficDecision::Admit
        );
        match tc.decide(Some(&rs), 0, period, budget) {
            TrafficDecision::AdmitAfterShed { shed_cycles } => assert_eq!(shed_cycles, budget),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exhausted_budget_demotes_under_mtds_and_kills_under_mtdbf() {
        let demote = TrafficControl::new(SchedulerPolicy::Mtds, 1, 0);
        let kill = TrafficControl::new(SchedulerPolicy::Mtdbf, 1, 0);
        let tenant = testing::stub_reserved_tenant("r", 1);
        let sandbox = testing::stub_sandbox_with(tenant.clone(), 1000);
        let budget = tenant
            .reservation
            .as_ref()
            .expect("reserved")
            .remaining() as u64;
        assert_eq!(demote.charge_execution(&sandbox, 1), BudgetOutcome::Ok);
        assert_eq!(
            demote.charge_execution(&sandbox, budget),
            BudgetOutcome::Demote
        );
        assert_eq!(kill.charge_execution(&sandbox, 1), BudgetOutcome::Kill);
    }
}
