// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File-backed key/value prefs.
//!
//! Keys are file basenames and values are file contents. For the `verified`
//! marker only presence matters: it is created empty and deleted, never read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::slot::Slot;
use crate::utils;

/// Marker asserting the slot image matches the manifest digest.
pub const VERIFIED: &str = "verified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefs {
    root: PathBuf,
}

impl Prefs {
    /// Prefs rooted at an arbitrary directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Prefs for one DLC slot: `<prefs_dir>/<id>/<slot>/`.
    pub fn for_slot(prefs_dir: &Path, id: &str, slot: Slot) -> Self {
        Self::new(prefs_dir.join(id).join(slot.name()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates `key` as an empty file.
    pub fn create(&self, key: &str) -> io::Result<()> {
        self.set_key(key, b"")
    }

    pub fn delete(&self, key: &str) -> io::Result<()> {
        utils::delete_path(&self.path(key)?)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path(key).map(|path| path.is_file()).unwrap_or(false)
    }

    pub fn set_key(&self, key: &str, value: &[u8]) -> io::Result<()> {
        utils::write_atomic(&self.path(key)?, value)
    }

    pub fn get_key(&self, key: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(key)?)
    }

    fn path(&self, key: &str) -> io::Result<PathBuf> {
        if key.is_empty() || key == "." || key == ".." || key.contains('/') {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid key `{key}`")));
        }
        Ok(self.root.join(key))
    }
}
