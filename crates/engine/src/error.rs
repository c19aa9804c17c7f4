// SPDX-License-Identifier: Apache-2.0

//! Errors for the engine.

use crate::response::ResponseCode;

/// Everything that can fail between accepting a connection and completing (or
/// killing) its sandbox.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Admission control found no spare capacity.
    #[error("admission rejected: estimate {estimate} does not fit")]
    AdmissionRejected {
        /// The admission estimate that did not fit.
        estimate: u64,
    },

    /// The global request queue is at capacity.
    #[error("global request queue is full")]
    GlobalQueueFull,

    /// No route matched the request path.
    #[error("no route matches `{path}`")]
    RouteMiss {
        /// The unmatched path.
        path: String,
    },

    /// The tenant's traffic control refused the request.
    #[error("traffic control rejected tenant `{tenant}`")]
    TrafficControlRejected {
        /// The tenant whose demand did not fit.
        tenant: String,
    },

    /// Guest resource allocation failed.
    #[error("sandbox allocation failed: {0}")]
    Allocation(#[from] sledge_rt_wasm::error::Error),

    /// A worker or listener OS facility could not be set up.
    #[error("runtime setup failed: {detail}: {source}")]
    Setup {
        /// What was being set up.
        detail: &'static str,
        /// The underlying errno.
        source: nix::Error,
    },

    /// A client socket operation failed terminally.
    #[error("client socket error: {source}")]
    ClientSocket {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The request head could not be parsed.
    #[error("malformed request: {detail}")]
    BadRequest {
        /// Parser detail.
        detail: String,
    },

    /// The request exceeded the route's size cap.
    #[error("request body of {got} bytes exceeds the route cap of {cap}")]
    RequestTooLarge {
        /// Bytes received.
        got: usize,
        /// The route's cap.
        cap: usize,
    },

    /// A thread could not be spawned or pinned.
    #[error("thread bring-up failed: {detail}")]
    Thread {
        /// What went wrong.
        detail: String,
    },
}

impl Error {
    /// The wire code this error maps to, per the runtime's error table.
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Error::AdmissionRejected { .. } => ResponseCode::SERVICE_UNAVAILABLE,
            Error::GlobalQueueFull => ResponseCode::TOO_MANY_REQUESTS,
            Error::RouteMiss { .. } => ResponseCode::NOT_FOUND,
            Error::TrafficControlRejected { .. } => ResponseCode::TOO_MANY_REQUESTS,
            Error::BadRequest { .. } => ResponseCode::BAD_REQUEST,
            Error::RequestTooLarge { .. } => ResponseCode::PAYLOAD_TOO_LARGE,
            Error::Allocation(_)
            | Error::Setup { .. }
            | Error::ClientSocket { .. }
            | Error::Thread { .. } => ResponseCode::INTERNAL_ERROR,
        }
    }
}
