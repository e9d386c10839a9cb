// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: DLC domain library (manifest parsing, A/B prefs, ref-counts, lifecycle engine)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + scenario suite (via tests/dlc_host)
//!   - manifest validation (sizes, digest, fs type)
//!   - ref_count.bin framing and expiry policy
//!   - Dlc state machine: install/finish/cancel/uninstall/purge
//!   - DlcManager fan-out, dangling cleanup, unsupported content removal
//!
//! PUBLIC API:
//!   - Dlc: per-DLC state machine and on-disk image ownership
//!   - DlcManager: set of supported DLCs
//!   - SystemState: process-wide context (collaborators, slots, paths, clock)
//!   - Prefs / RefCount: per-DLC persistence
//!
//! DEPENDENCIES:
//!   - serde_json + hex: imageloader.json manifests
//!   - sha2: image verification
//!   - crc32fast: ref_count.bin integrity
//!   - parking_lot: interior mutability inside SystemState

#![forbid(unsafe_code)]

pub mod clock;
pub mod dlc;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod prefs;
pub mod proxies;
pub mod ref_count;
pub mod slot;
pub mod state;
pub mod system_state;
pub mod utils;

pub use clock::{Clock, FakeClock, SystemClock};
pub use dlc::{Dlc, InstallOutcome};
pub use error::{DlcError, ErrorCode, Result};
pub use manager::DlcManager;
pub use manifest::{FsType, Manifest, ManifestError, UsedBy};
pub use prefs::Prefs;
pub use proxies::{
    ImageLoader, Operation, PrimarySession, ProxyError, SessionManager, StateChangeReporter,
    StatusResult, UpdateEngine,
};
pub use ref_count::{RefCount, RefCountInfo};
pub use slot::{BootDevice, BootSlot, Slot, SysfsBootDevice};
pub use state::{DlcId, DlcState, DlcStateKind};
pub use system_state::{Collaborators, ExpiryPolicy, Paths, SystemState};
