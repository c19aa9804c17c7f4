// SPDX-License-Identifier: Apache-2.0

//! Observability: the metrics registry, the plain-TCP metrics endpoint, and
//! the optional cycle-stamped perf logs.

pub mod error;
pub mod metrics_server;
pub mod perf_log;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Initializes the global `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info`. Safe to call once at startup.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// The runtime's counters, shared by the listener, workers, and the metrics
/// endpoint.
pub struct Metrics {
    registry: Registry,
    /// Requests that reached routing, admitted or not.
    pub total_requests: IntCounter,
    /// Requests refused by admission control or a full queue.
    pub total_rejections: IntCounter,
    /// Responses by wire code.
    pub responses: IntCounterVec,
    /// Timer-driven preemption switches performed by workers.
    pub preemptions: IntCounter,
    /// Sandboxes shed or demoted by traffic control.
    pub sheds: IntCounter,
}

impl Metrics {
    /// Creates and registers the counter set.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let total_requests =
            IntCounter::with_opts(Opts::new("total_requests", "Requests received"))?;
        let total_rejections = IntCounter::with_opts(Opts::new(
            "total_rejections",
            "Requests rejected by admission control or full queues",
        ))?;
        let responses = IntCounterVec::new(
            Opts::new("responses", "Responses sent, labeled by wire code"),
            &["code"],
        )?;
        let preemptions =
            IntCounter::with_opts(Opts::new("preemptions", "Preemptive context switches"))?;
        let sheds = IntCounter::with_opts(Opts::new(
            "sheds",
            "Sandboxes shed or demoted by traffic control",
        ))?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(total_rejections.clone()))?;
        registry.register(Box::new(responses.clone()))?;
        registry.register(Box::new(preemptions.clone()))?;
        registry.register(Box::new(sheds.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            total_rejections,
            responses,
            preemptions,
            sheds,
        })
    }

    /// Bumps the per-code response counter.
    pub fn count_response(&self, code: u16) {
        self.responses.with_label_values(&[&code.to_string()]).inc();
    }

    /// Renders the registry in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_the_contract_counters() {
        let metrics = Metrics::new().expect("fresh registry");
        metrics.total_requests.inc();
        metrics.total_requests.inc();
        metrics.total_rejections.inc();
        metrics.count_response(200);
        metrics.count_response(503);
        let text = metrics.render();
        assert!(text.contains("total_requests 2"));
        assert!(text.contains("total_rejections 1"));
        assert!(text.contains("code=\"503\""));
    }
}
