// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error codes surfaced across the RPC boundary.

use core::fmt;

use thiserror::Error;

/// Result alias used throughout the DLC engine.
pub type Result<T> = core::result::Result<T, DlcError>;

/// Stable error codes. The string forms are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    None,
    /// Manifest, file I/O, hash mismatch, mount or image-loader failures.
    Internal,
    /// A conflicting operation is in flight.
    Busy,
    /// update-engine applied an update and the device must reboot.
    NeedReboot,
    /// Unknown DLC id.
    InvalidDlc,
    /// Image file could not be sized.
    Allocation,
    /// image-loader is not reachable.
    NoImageLoader,
}

impl ErrorCode {
    /// Returns the stable wire string for this code.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Internal => "internal",
            Self::Busy => "busy",
            Self::NeedReboot => "need-reboot",
            Self::InvalidDlc => "invalid-dlc",
            Self::Allocation => "allocation",
            Self::NoImageLoader => "no-imageloader",
        }
    }

    /// Parses a wire string back into a code.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "internal" => Some(Self::Internal),
            "busy" => Some(Self::Busy),
            "need-reboot" => Some(Self::NeedReboot),
            "invalid-dlc" => Some(Self::InvalidDlc),
            "allocation" => Some(Self::Allocation),
            "no-imageloader" => Some(Self::NoImageLoader),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried by every fallible DLC operation: a stable code plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct DlcError {
    code: ErrorCode,
    message: String,
}

impl DlcError {
    /// Creates an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Busy, message)
    }

    pub fn need_reboot(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NeedReboot, message)
    }

    pub fn invalid_dlc(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidDlc, message)
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Allocation, message)
    }

    /// Returns the stable code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
