// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Contracts for the external daemons the engine depends on.
//!
//! Calls are synchronous from the engine's point of view; a transport
//! failure (daemon down, deadline exceeded) is a [`ProxyError`].

use std::time::Duration;

use thiserror::Error;

use crate::state::DlcState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
    #[error("{0} call timed out")]
    Timeout(&'static str),
    #[error("call failed: {0}")]
    Failed(String),
}

/// update-engine's current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    Disabled,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckingForUpdate => "CHECKING_FOR_UPDATE",
            Self::UpdateAvailable => "UPDATE_AVAILABLE",
            Self::Downloading => "DOWNLOADING",
            Self::Verifying => "VERIFYING",
            Self::Finalizing => "FINALIZING",
            Self::UpdatedNeedReboot => "UPDATED_NEED_REBOOT",
            Self::ReportingErrorEvent => "REPORTING_ERROR_EVENT",
            Self::AttemptingRollback => "ATTEMPTING_ROLLBACK",
            Self::Disabled => "DISABLED",
        }
    }
}

/// One `StatusUpdateAdvanced` / `GetStatusAdvanced` payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusResult {
    pub current_operation: Operation,
    pub progress: f64,
    pub is_install: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySession {
    pub username: String,
    pub sanitized_username: String,
}

/// Mounts and unmounts verified DLC images.
pub trait ImageLoader: Send + Sync {
    /// Mounts the image of `slot_name` and returns the mount point. An empty
    /// string means the mount was refused.
    fn load_dlc_image(
        &self,
        id: &str,
        package: &str,
        slot_name: &str,
        timeout: Duration,
    ) -> Result<String, ProxyError>;

    fn unload_dlc_image(&self, id: &str, package: &str, timeout: Duration)
        -> Result<bool, ProxyError>;
}

pub trait UpdateEngine: Send + Sync {
    fn attempt_install(&self, omaha_url: &str, ids: &[String]) -> Result<(), ProxyError>;

    fn get_status_advanced(&self) -> Result<StatusResult, ProxyError>;

    fn set_dlc_active_value(&self, active: bool, id: &str) -> Result<(), ProxyError>;
}

pub trait SessionManager: Send + Sync {
    /// Returns the primary session, or `None` when nobody is logged in.
    fn retrieve_primary_session(&self) -> Result<Option<PrimarySession>, ProxyError>;
}

/// Receives every state and progress transition (the `DlcStateChanged`
/// signal).
pub trait StateChangeReporter: Send + Sync {
    fn dlc_state_changed(&self, state: &DlcState);
}

/// Collaborator that is never reachable; used when the daemon runs without
/// a peer for one of the contracts.
#[derive(Debug, Clone, Copy)]
pub struct Unavailable(pub &'static str);

impl ImageLoader for Unavailable {
    fn load_dlc_image(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<String, ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }

    fn unload_dlc_image(&self, _: &str, _: &str, _: Duration) -> Result<bool, ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }
}

impl UpdateEngine for Unavailable {
    fn attempt_install(&self, _: &str, _: &[String]) -> Result<(), ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }

    fn get_status_advanced(&self) -> Result<StatusResult, ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }

    fn set_dlc_active_value(&self, _: bool, _: &str) -> Result<(), ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }
}

impl SessionManager for Unavailable {
    fn retrieve_primary_session(&self) -> Result<Option<PrimarySession>, ProxyError> {
        Err(ProxyError::Unavailable(self.0))
    }
}

/// Reporter that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl StateChangeReporter for NullReporter {
    fn dlc_state_changed(&self, _state: &DlcState) {}
}
