// SPDX-License-Identifier: Apache-2.0

//! Configuration errors.

/// Everything that can go wrong between startup and a validated config.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read configuration `{path}`: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected model.
    #[error("failed to parse configuration `{path}`: {source}")]
    Parse {
        /// Path of the file.
        path: String,
        /// The underlying serde error.
        source: serde_json::Error,
    },

    /// The configuration declares no tenants.
    #[error("configuration declares no tenants")]
    NoTenants,

    /// Two tenants claim the same listen port.
    #[error("tenant listen port {port} is used more than once")]
    DuplicatePort {
        /// The contested port.
        port: u16,
    },

    /// A tenant declares no routes.
    #[error("tenant `{tenant}` declares no routes")]
    NoRoutes {
        /// The offending tenant.
        tenant: String,
    },

    /// A route field is invalid.
    #[error("tenant `{tenant}` route `{route}`: {detail}")]
    InvalidRoute {
        /// The owning tenant.
        tenant: String,
        /// The offending route path.
        route: String,
        /// What is wrong with it.
        detail: String,
    },

    /// A reservation field set is incomplete.
    #[error("tenant `{tenant}`: {detail}")]
    InvalidReservation {
        /// The offending tenant.
        tenant: String,
        /// What is wrong with it.
        detail: String,
    },

    /// An environment variable holds an unusable value.
    #[error("environment variable {name} has invalid value `{value}`: {detail}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
        /// What is wrong with it.
        detail: String,
    },
}
