// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: DLC service daemon library
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, tests/server.rs, tests/dlc_host
//!
//! PUBLIC API:
//!   - DlcService: RPC handlers, update-engine handshake, watchdog and cleanup timers
//!   - protocol: Byte-frame request/response/signal codec
//!   - Config: TOML daemon configuration
//!   - service_main_loop(): Host daemon entry
//!
//! DEPENDENCIES:
//!   - dlc: DLC engine
//!   - serde + toml: configuration
//!   - log: diagnostics

#![forbid(unsafe_code)]

pub mod config;
pub mod event_loop;
pub mod protocol;
pub mod server;
pub mod service;

pub use config::{Config, ConfigError, DEFAULT_CONFIG_PATH};
pub use event_loop::{MessageLoop, TaskId};
pub use protocol::{ExistingDlc, ProtocolError, Request, Response};
pub use server::{
    run_loop, service_main_loop, ReadyNotifier, ServerError, SignalQueue, Transport,
    TransportError, UnixTransport,
};
pub use service::{DlcService, Timers, CLEANUP_DEBOUNCE, WATCHDOG_PERIOD};
