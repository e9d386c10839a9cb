// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scoped rollback: runs a cleanup action on drop unless committed.

pub struct ScopedRollback<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ScopedRollback<F> {
    pub fn new(action: F) -> Self {
        Self { action: Some(action) }
    }

    /// Disarms the rollback; call on the success path only.
    pub fn commit(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for ScopedRollback<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
