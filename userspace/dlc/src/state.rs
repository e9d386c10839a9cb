// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime DLC state mirrored into RPC replies.

use crate::error::ErrorCode;

/// Identifier of a DLC; one directory name on disk.
pub type DlcId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlcStateKind {
    NotInstalled,
    Installing,
    Installed,
}

impl DlcStateKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "NOT_INSTALLED",
            Self::Installing => "INSTALLING",
            Self::Installed => "INSTALLED",
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::NotInstalled => 0,
            Self::Installing => 1,
            Self::Installed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotInstalled),
            1 => Some(Self::Installing),
            2 => Some(Self::Installed),
            _ => None,
        }
    }
}

/// Snapshot of a DLC's runtime state.
///
/// `root_path` is empty unless `state` is [`DlcStateKind::Installed`].
#[derive(Debug, Clone, PartialEq)]
pub struct DlcState {
    pub id: DlcId,
    pub state: DlcStateKind,
    pub progress: f64,
    pub last_error_code: ErrorCode,
    pub root_path: String,
}

impl DlcState {
    /// Initial state of a freshly initialised DLC.
    pub fn not_installed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: DlcStateKind::NotInstalled,
            progress: 0.0,
            last_error_code: ErrorCode::None,
            root_path: String::new(),
        }
    }
}
