// SPDX-License-Identifier: Apache-2.0

//! The `sledge-rt` binary: load configuration, boot the runtime, serve.

use clap::Parser;
use sledge_rt_config::RuntimeConfig;
use sledge_rt_config::options::RuntimeOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Preemptive serverless WebAssembly runtime with deadline-driven dispatch.
#[derive(Debug, Parser)]
#[command(name = "sledge-rt", version, about)]
struct Cli {
    /// Path to the tenant/route configuration (JSON).
    config: PathBuf,
}

fn main() -> ExitCode {
    sledge_rt_telemetry::init_tracing();
    let cli = Cli::parse();

    let options = match RuntimeOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!(error = %e, "invalid environment");
            return ExitCode::FAILURE;
        }
    };
    let config = match RuntimeConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, config = %cli.config.display(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        scheduler = ?options.scheduler,
        dispatcher = ?options.dispatcher,
        workers = options.nworkers,
        quantum_us = options.quantum_us,
        tenants = config.tenants.len(),
        "starting runtime"
    );

    match sledge_rt_engine::runtime::boot(&config, options) {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "runtime failed to start");
            ExitCode::FAILURE
        }
    }
}
