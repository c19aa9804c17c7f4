// SPDX-License-Identifier: Apache-2.0

//! Telemetry errors.

/// Errors raised by the metrics endpoint and perf logs.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The metrics listener socket could not be set up.
    #[error("failed to bind metrics endpoint on port {port}: {source}")]
    Bind {
        /// The configured metrics port.
        port: u16,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A perf log file could not be opened.
    #[error("failed to open perf log `{path}`: {source}")]
    PerfLogOpen {
        /// Path of the log file.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The counter registry rejected a registration.
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),
}
