// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Process-wide context for the DLC engine
//! OWNERS: @runtime
//!
//! `SystemState` is threaded explicitly into every `Dlc` and the manager as an
//! `Arc`. The daemon additionally installs it into a process-wide slot once at
//! startup; tests re-initialise the slot with `for_test = true`.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{DlcError, Result};
use crate::manifest::UsedBy;
use crate::proxies::{ImageLoader, SessionManager, StateChangeReporter, StatusResult, UpdateEngine};
use crate::ref_count::DEFAULT_EXPIRY;
use crate::slot::BootSlot;

/// Directory roots used by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub manifest_dir: PathBuf,
    pub preloaded_content_dir: PathBuf,
    pub factory_install_dir: PathBuf,
    pub content_dir: PathBuf,
    pub prefs_dir: PathBuf,
    pub users_dir: PathBuf,
}

impl Paths {
    /// Standard layout below a single root, used by tests and host runs.
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            manifest_dir: root.join("rootfs/dlc"),
            preloaded_content_dir: root.join("preloaded"),
            factory_install_dir: root.join("factory"),
            content_dir: root.join("content"),
            prefs_dir: root.join("prefs"),
            users_dir: root.join("users"),
        }
    }
}

/// How long an unreferenced DLC is kept, per `used_by` class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub user: Duration,
    pub system: Duration,
}

impl ExpiryPolicy {
    pub fn for_class(&self, used_by: UsedBy) -> Duration {
        match used_by {
            UsedBy::User => self.user,
            UsedBy::System => self.system,
        }
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self { user: DEFAULT_EXPIRY, system: DEFAULT_EXPIRY }
    }
}

/// The external daemons plus the state-change sink.
#[derive(Clone)]
pub struct Collaborators {
    pub image_loader: Arc<dyn ImageLoader>,
    pub update_engine: Arc<dyn UpdateEngine>,
    pub session_manager: Arc<dyn SessionManager>,
    pub reporter: Arc<dyn StateChangeReporter>,
}

pub struct SystemState {
    collaborators: Collaborators,
    boot_slot: BootSlot,
    paths: Paths,
    clock: Arc<dyn Clock>,
    expiry: ExpiryPolicy,
    update_engine_status: Mutex<Option<(StatusResult, Duration)>>,
    primary_user: Mutex<Option<String>>,
}

static GLOBAL: OnceLock<Mutex<Option<Arc<SystemState>>>> = OnceLock::new();

impl SystemState {
    pub fn new(
        collaborators: Collaborators,
        boot_slot: BootSlot,
        paths: Paths,
        clock: Arc<dyn Clock>,
        expiry: ExpiryPolicy,
    ) -> Self {
        Self {
            collaborators,
            boot_slot,
            paths,
            clock,
            expiry,
            update_engine_status: Mutex::new(None),
            primary_user: Mutex::new(None),
        }
    }

    /// Installs `state` as the process-wide instance. A second call fails
    /// unless `for_test` is set.
    pub fn initialize(state: Arc<SystemState>, for_test: bool) -> Result<()> {
        let mut slot = GLOBAL.get_or_init(|| Mutex::new(None)).lock();
        if slot.is_some() && !for_test {
            return Err(DlcError::internal("system state is already initialised"));
        }
        *slot = Some(state);
        Ok(())
    }

    /// Returns the process-wide instance, if initialised.
    pub fn get() -> Option<Arc<SystemState>> {
        GLOBAL.get().and_then(|slot| slot.lock().clone())
    }

    pub fn image_loader(&self) -> &dyn ImageLoader {
        self.collaborators.image_loader.as_ref()
    }

    pub fn update_engine(&self) -> &dyn UpdateEngine {
        self.collaborators.update_engine.as_ref()
    }

    pub fn session_manager(&self) -> &dyn SessionManager {
        self.collaborators.session_manager.as_ref()
    }

    pub fn reporter(&self) -> &dyn StateChangeReporter {
        self.collaborators.reporter.as_ref()
    }

    pub fn boot_slot(&self) -> BootSlot {
        self.boot_slot
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn expiry(&self) -> ExpiryPolicy {
        self.expiry
    }

    /// Records the latest update-engine status with the time it was seen.
    pub fn set_update_engine_status(&self, status: StatusResult) {
        *self.update_engine_status.lock() = Some((status, self.clock.now()));
    }

    pub fn update_engine_status(&self) -> Option<(StatusResult, Duration)> {
        *self.update_engine_status.lock()
    }

    /// Sanitized name of the primary session user, if someone is logged in.
    pub fn primary_user(&self) -> Option<String> {
        self.primary_user.lock().clone()
    }

    /// Handles a `SessionStateChanged` signal.
    pub fn on_session_changed(&self, state: &str) {
        match state {
            "started" => match self.session_manager().retrieve_primary_session() {
                Ok(session) => {
                    let user = session.map(|session| session.sanitized_username);
                    info!("dlc: primary session user is {}", user.as_deref().unwrap_or("<none>"));
                    *self.primary_user.lock() = user;
                }
                Err(err) => warn!("dlc: failed to retrieve primary session: {err}"),
            },
            "stopped" => *self.primary_user.lock() = None,
            _ => {}
        }
    }
}
