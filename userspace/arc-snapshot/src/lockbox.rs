// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-lockbox contract: a key/value store that becomes read-only for the
//! rest of the boot once finalized.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockboxError {
    #[error("lockbox is finalized for this boot")]
    Finalized,
    #[error("lockbox unavailable: {0}")]
    Unavailable(String),
}

pub trait BootLockbox {
    fn read(&self, key: &str) -> Result<Option<String>, LockboxError>;
    fn store(&self, key: &str, value: &str) -> Result<(), LockboxError>;
    /// Seals the lockbox. Must not be retried within a boot after failure.
    fn finalize(&self) -> Result<(), LockboxError>;
}

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, String>,
    finalized: bool,
}

/// Process-local lockbox. Clones share state; [`InMemoryBootLockbox::reboot`]
/// lifts the seal as a new boot would.
#[derive(Clone, Default)]
pub struct InMemoryBootLockbox {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBootLockbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboot(&self) {
        self.inner.lock().finalized = false;
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }
}

impl BootLockbox for InMemoryBootLockbox {
    fn read(&self, key: &str) -> Result<Option<String>, LockboxError> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), LockboxError> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Err(LockboxError::Finalized);
        }
        inner.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn finalize(&self) -> Result<(), LockboxError> {
        self.inner.lock().finalized = true;
        Ok(())
    }
}
