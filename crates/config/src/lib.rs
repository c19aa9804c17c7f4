// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the runtime.
//!
//! Two sources feed the runtime at startup: a JSON file describing tenants
//! and their routes ([`tenant`]), and `SLEDGE_*` environment variables
//! selecting scheduler policy, worker count, and quantum ([`options`]).
//! Everything is validated up front; a misconfigured runtime refuses to boot
//! rather than misbehave under load.

pub mod error;
pub mod options;
pub mod tenant;

use crate::error::Error;
use crate::tenant::TenantConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The full startup configuration: every tenant this process serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tenants, each with its own listen port and route table.
    pub tenants: Vec<TenantConfig>,
}

impl RuntimeConfig {
    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| Error::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates tenant uniqueness and every tenant in turn.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tenants.is_empty() {
            return Err(Error::NoTenants);
        }
        let mut ports = std::collections::HashSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !ports.insert(tenant.port) {
                return Err(Error::DuplicatePort { port: tenant.port });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::RouteConfig;
    use std::io::Write;

    fn tenant(name: &str, port: u16) -> TenantConfig {
        TenantConfig {
            name: name.to_owned(),
            port,
            routes: vec![RouteConfig {
                route: "/fib".to_owned(),
                request_type: 1,
                module_path: "fib.so".to_owned(),
                estimated_execution_us: 1000,
                relative_deadline_us: 10_000,
                max_request_size: 4096,
                max_response_size: 4096,
                expected_content_type: "text/plain".to_owned(),
            }],
            replenishment_period_us: None,
            guaranteed_budget_us: None,
            max_relative_deadline_us: None,
        }
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let config = RuntimeConfig {
            tenants: vec![tenant("a", 10000), tenant("b", 10000)],
        };
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicatePort { port: 10000 })
        ));
    }

    #[test]
    fn file_round_trip() {
        let config = RuntimeConfig {
            tenants: vec![tenant("a", 10000)],
        };
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        let json = serde_json::to_string_pretty(&config).expect("serialize");
        file.write_all(json.as_bytes()).expect("write");
        let loaded = RuntimeConfig::from_file(file.path()).expect("load");
        assert_eq!(loaded.tenants.len(), 1);
        assert_eq!(loaded.tenants[0].routes[0].relative_deadline_us, 10_000);
    }

    #[test]
    fn empty_config_refuses_to_boot() {
        let config = RuntimeConfig { tenants: vec![] };
        assert!(matches!(config.validate(), Err(Error::NoTenants)));
    }
}
