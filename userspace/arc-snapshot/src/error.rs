// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;

use crate::lockbox::LockboxError;

pub type Result<T> = core::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no key pair; generate_key_pair must run first")]
    NoKeyPair,
    #[error("refusing to snapshot symbolic link {0}")]
    Symlink(PathBuf),
    #[error("{0} does not exist or is not a directory")]
    MissingDirectory(PathBuf),
    #[error("boot lockbox: {0}")]
    Lockbox(#[from] LockboxError),
    #[error("lockbox has no value for {0}")]
    MissingDigest(&'static str),
    #[error("snapshot belongs to a different user")]
    UserMismatch,
    #[error("public key digest does not match the lockbox")]
    DigestMismatch,
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("no valid snapshot found")]
    NoSnapshot,
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
