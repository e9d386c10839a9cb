// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: dlcserviced entrypoint wiring config and logging to the daemon loop
//!
//! Usage: `dlcserviced [CONFIG]`, defaulting to
//! `/etc/dlcservice/dlcserviced.toml`. Log level follows `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;

use dlcserviced::{Config, ReadyNotifier, DEFAULT_CONFIG_PATH};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args_os().nth(1).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("dlcserviced: {err}");
            return ExitCode::FAILURE;
        }
    };
    match dlcserviced::service_main_loop(&config, ReadyNotifier::new(|| ())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dlcserviced: {err}");
            ExitCode::FAILURE
        }
    }
}
