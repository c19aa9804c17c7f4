// SPDX-License-Identifier: Apache-2.0

//! Admission control.
//!
//! One process-wide atomic tracks the unitless cost of all admitted,
//! not-yet-completed work. A request's estimate is its expected execution
//! scaled by the granularity and divided by its relative deadline, so a tight
//! deadline charges more capacity than a loose one for the same work.
//! Estimates are charged on acceptance and refunded on completion, success or
//! failure alike.

use crate::{ADMISSIONS_GRANULARITY, ADMISSIONS_OVERHEAD};
use std::sync::atomic::{AtomicU64, Ordering};

/// The process-wide admissions ledger.
#[derive(Debug)]
pub struct AdmissionsControl {
    admitted: AtomicU64,
    capacity: u64,
}

/// Computes a route's unitless admission estimate from microsecond
/// quantities. Panics when the deadline out-scales the granularity, which a
/// validated config cannot produce.
#[must_use]
pub fn calculate_estimate_us(estimated_execution_us: u64, relative_deadline_us: u64) -> u64 {
    assert!(relative_deadline_us != 0);
    let estimate = estimated_execution_us * ADMISSIONS_GRANULARITY / relative_deadline_us;
    assert!(
        estimate != 0,
        "deadline-to-execution ratio exceeds the admissions granularity",
    );
    estimate
}

impl AdmissionsControl {
    /// Builds the ledger for `workers` cores, holding back the configured
    /// overhead fraction.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let raw = workers as u64 * ADMISSIONS_GRANULARITY;
        let capacity = (raw as f64 * (1.0 - ADMISSIONS_OVERHEAD)) as u64;
        Self {
            admitted: AtomicU64::new(0),
            capacity,
        }
    }

    /// Total capacity in estimate units.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Currently admitted work in estimate units.
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Acquire)
    }

    /// Accepts or rejects `estimate` units. On acceptance the ledger is
    /// charged and the estimate is returned; the caller must eventually
    /// [`Self::subtract`] the same amount.
    pub fn decide(&self, estimate: u64) -> Option<u64> {
        assert!(estimate > 0, "admission estimates are never zero");
        let mut current = self.admitted.load(Ordering::Acquire);
        loop {
            if current + estimate >= self.capacity {
                return None;
            }
            match self.admitted.compare_exchange_weak(
                current,
                current + estimate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(estimate),
                Err(observed) => current = observed,
            }
        }
    }

    /// Refunds `estimate` units on sandbox completion or on a rollback when a
    /// later step of the admission path fails.
    pub fn subtract(&self, estimate: u64) {
        let prior = self.admitted.fetch_sub(estimate, Ordering::AcqRel);
        assert!(prior >= estimate, "admissions ledger underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_deadline_tightness() {
        let tight = calculate_estimate_us(1_000, 2_000);
        let loose = calculate_estimate_us(1_000, 20_000);
        assert_eq!(tight, ADMISSIONS_GRANULARITY / 2);
        assert_eq!(loose, ADMISSIONS_GRANULARITY / 20);
        assert!(tight > loose);
    }

    #[test]
    fn ledger_never_exceeds_capacity() {
        let ac = AdmissionsControl::new(1);
        let estimate = ac.capacity() / 2 + 1;
        let first = ac.decide(estimate).expect("fits");
        assert_eq!(first, estimate);
        // A second identical request would cross capacity.
        assert!(ac.decide(estimate).is_none());
        ac.subtract(first);
        assert_eq!(ac.admitted(), 0);
        assert!(ac.decide(estimate).is_some());
    }

    #[test]
    fn accepted_minus_completed_stays_bounded() {
        let ac = AdmissionsControl::new(2);
        let unit = ac.capacity() / 10;
        let mut outstanding = Vec::new();
        let mut rejected = 0;
        for _ in 0..50 {
            match ac.decide(unit) {
                Some(est) => outstanding.push(est),
                None => rejected += 1,
            }
            assert!(ac.admitted() < ac.capacity());
            if outstanding.len() > 5 {
                ac.subtract(outstanding.pop().expect("non-empty"));
            }
        }
        assert!(rejected > 0);
        for est in outstanding {
            ac.subtract(est);
        }
        assert_eq!(ac.admitted(), 0);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn refunding_unadmitted_work_panics() {
        let ac = AdmissionsControl::new(1);
        ac.subtract(1);
    }
}
