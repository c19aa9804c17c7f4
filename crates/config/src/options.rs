// SPDX-License-Identifier: Apache-2.0

//! Runtime options derived from `SLEDGE_*` environment variables.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default scheduling quantum when `SLEDGE_QUANTUM_US` is unset.
pub const DEFAULT_QUANTUM_US: u64 = 5_000;

/// Fallback processor speed when `/proc/cpuinfo` is unreadable.
pub const DEFAULT_PROCESSOR_SPEED_MHZ: u32 = 2_400;

/// How the workers order runnable sandboxes and the global store is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPolicy {
    /// Arrival order; the global store becomes a work-stealing deque.
    Fifo,
    /// Earliest absolute deadline first.
    Edf,
    /// Smallest remaining slack first.
    Srsf,
    /// EDF with per-tenant reservation servers (traffic control on).
    Mtds,
    /// EDF with per-tenant demand-bound admission (traffic control on).
    Mtdbf,
}

impl SchedulerPolicy {
    /// True for the policies that consult per-tenant traffic control.
    #[must_use]
    pub fn uses_traffic_control(self) -> bool {
        matches!(self, Self::Mtds | Self::Mtdbf)
    }

    /// True when priorities are deadline-derived (everything but FIFO).
    #[must_use]
    pub fn is_deadline_based(self) -> bool {
        !matches!(self, Self::Fifo)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "FIFO" => Some(Self::Fifo),
            "EDF" => Some(Self::Edf),
            "SRSF" => Some(Self::Srsf),
            "MTDS" => Some(Self::Mtds),
            "MTDBF" => Some(Self::Mtdbf),
            _ => None,
        }
    }
}

/// How the listener assigns admitted sandboxes to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatcherPolicy {
    /// Push to the process-wide request queue; workers pull when their local
    /// head is later.
    Global,
    /// Deadline-ordered placement with targeted preemption interrupts.
    EdfInterrupt,
    /// Static per-type worker reservations with stealable slack, no
    /// preemption.
    Darc,
    /// Centralized per-type queues with periodic preemption sweeps.
    Shinjuku,
}

impl DispatcherPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "GLOBAL" => Some(Self::Global),
            "EDF_INTERRUPT" => Some(Self::EdfInterrupt),
            "DARC" => Some(Self::Darc),
            "SHINJUKU" => Some(Self::Shinjuku),
            _ => None,
        }
    }
}

/// The environment-derived knobs of one runtime process.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Worker/global queue ordering policy (`SLEDGE_SCHEDULER`).
    pub scheduler: SchedulerPolicy,
    /// Listener placement policy (`SLEDGE_DISPATCHER`).
    pub dispatcher: DispatcherPolicy,
    /// Number of worker threads (`SLEDGE_NWORKERS`, default: online cores
    /// minus the listener core).
    pub nworkers: usize,
    /// Preemption quantum in microseconds (`SLEDGE_QUANTUM_US`).
    pub quantum_us: u64,
    /// Sandbox perf-log path (`SLEDGE_SANDBOX_PERF_LOG`), if enabled.
    pub sandbox_perf_log: Option<PathBuf>,
    /// HTTP session perf-log path (`SLEDGE_HTTP_SESSION_PERF_LOG`), if
    /// enabled.
    pub http_session_perf_log: Option<PathBuf>,
    /// Measured processor speed, for µs → cycle conversions.
    pub processor_speed_mhz: u32,
}

impl RuntimeOptions {
    /// Reads every `SLEDGE_*` variable, falling back to defaults.
    pub fn from_env() -> Result<Self, Error> {
        let scheduler = match std::env::var("SLEDGE_SCHEDULER") {
            Ok(v) => SchedulerPolicy::parse(&v).ok_or(Error::InvalidEnv {
                name: "SLEDGE_SCHEDULER",
                value: v,
                detail: "expected FIFO, EDF, SRSF, MTDS or MTDBF".to_owned(),
            })?,
            Err(_) => SchedulerPolicy::Edf,
        };
        let dispatcher = match std::env::var("SLEDGE_DISPATCHER") {
            Ok(v) => DispatcherPolicy::parse(&v).ok_or(Error::InvalidEnv {
                name: "SLEDGE_DISPATCHER",
                value: v,
                detail: "expected GLOBAL, EDF_INTERRUPT, DARC or SHINJUKU".to_owned(),
            })?,
            Err(_) => DispatcherPolicy::Global,
        };
        let nworkers = match std::env::var("SLEDGE_NWORKERS") {
            Ok(v) => v
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(Error::InvalidEnv {
                    name: "SLEDGE_NWORKERS",
                    value: v,
                    detail: "expected a positive integer".to_owned(),
                })?,
            Err(_) => default_worker_count(),
        };
        let quantum_us = match std::env::var("SLEDGE_QUANTUM_US") {
            Ok(v) => v
                .parse::<u64>()
                .ok()
                .filter(|&q| q > 0)
                .ok_or(Error::InvalidEnv {
                    name: "SLEDGE_QUANTUM_US",
                    value: v,
                    detail: "expected a positive integer".to_owned(),
                })?,
            Err(_) => DEFAULT_QUANTUM_US,
        };

        Ok(Self {
            scheduler,
            dispatcher,
            nworkers,
            quantum_us,
            sandbox_perf_log: std::env::var_os("SLEDGE_SANDBOX_PERF_LOG").map(PathBuf::from),
            http_session_perf_log: std::env::var_os("SLEDGE_HTTP_SESSION_PERF_LOG")
                .map(PathBuf::from),
            processor_speed_mhz: detect_processor_speed_mhz(),
        })
    }

    /// Cycles in one microsecond on this machine.
    #[must_use]
    pub fn cycles_per_us(&self) -> u64 {
        u64::from(self.processor_speed_mhz)
    }

    /// Converts a microsecond quantity to cycles.
    #[must_use]
    pub fn us_to_cycles(&self, us: u64) -> u64 {
        us * self.cycles_per_us()
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// Samples the processor speed from `/proc/cpuinfo`, falling back to a
/// conservative constant. Deadlines only need this to be consistent within
/// the process, not exact.
#[must_use]
pub fn detect_processor_speed_mhz() -> u32 {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return DEFAULT_PROCESSOR_SPEED_MHZ;
    };
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("cpu MHz") {
            if let Some(value) = rest.split(':').nth(1) {
                if let Ok(mhz) = value.trim().parse::<f64>() {
                    if mhz >= 1.0 {
                        return mhz as u32;
                    }
                }
            }
        }
    }
    DEFAULT_PROCESSOR_SPEED_MHZ
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_their_env_spellings() {
        assert_eq!(SchedulerPolicy::parse("EDF"), Some(SchedulerPolicy::Edf));
        assert_eq!(SchedulerPolicy::parse("SRSF"), Some(SchedulerPolicy::Srsf));
        assert_eq!(SchedulerPolicy::parse("MTDBF"), Some(SchedulerPolicy::Mtdbf));
        assert_eq!(SchedulerPolicy::parse("edf"), None);
        assert_eq!(
            DispatcherPolicy::parse("SHINJUKU"),
            Some(DispatcherPolicy::Shinjuku)
        );
        assert_eq!(DispatcherPolicy::parse("shinjuku"), None);
    }

    #[test]
    fn traffic_control_policies_are_flagged() {
        assert!(SchedulerPolicy::Mtds.uses_traffic_control());
        assert!(SchedulerPolicy::Mtdbf.uses_traffic_control());
        assert!(!SchedulerPolicy::Edf.uses_traffic_control());
        assert!(SchedulerPolicy::Edf.is_deadline_based());
        assert!(!SchedulerPolicy::Fifo.is_deadline_based());
    }

    #[test]
    fn speed_detection_never_returns_zero() {
        assert!(detect_processor_speed_mhz() > 0);
    }
}
