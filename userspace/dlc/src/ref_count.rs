// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-DLC reference counting and expiry.
//!
//! `ref_count.bin` layout (little-endian, one record):
//!
//! ```text
//! magic "DLRC" u32 | version u8 | last_access_time_us i64 |
//! user_count u16 | (len u16, bytes)* | crc32 u32
//! ```
//!
//! The CRC covers every preceding byte. A truncated or corrupt file reads as
//! empty info.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::clock::Clock;
use crate::manifest::UsedBy;
use crate::utils;

pub const REF_COUNT_FILE_NAME: &str = "ref_count.bin";
/// User recorded by system-based ref-counts.
pub const SYSTEM_USER: &str = "system";
/// Default time an unreferenced DLC is kept before cleanup purges it.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 24 * 60 * 60);

const MAGIC: u32 = u32::from_le_bytes(*b"DLRC");
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 8 + 2;

/// Persisted ref-count state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefCountInfo {
    /// Users in first-install order, without duplicates.
    pub users: Vec<String>,
    /// Last install/uninstall, microseconds since the epoch. Zero when the
    /// DLC was never touched.
    pub last_access_time_us: i64,
}

impl RefCountInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 4 + self.users.len() * 66);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.push(VERSION);
        out.extend_from_slice(&self.last_access_time_us.to_le_bytes());
        let count = self.users.len().min(u16::MAX as usize);
        out.extend_from_slice(&(count as u16).to_le_bytes());
        for user in self.users.iter().take(count) {
            let bytes = &user.as_bytes()[..user.len().min(u16::MAX as usize)];
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes a record; `None` on any framing or checksum error.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE + 4 {
            return None;
        }
        let (body, crc) = data.split_at(data.len() - 4);
        if crc32fast::hash(body) != u32::from_le_bytes(crc.try_into().ok()?) {
            return None;
        }
        if u32::from_le_bytes(body[0..4].try_into().ok()?) != MAGIC || body[4] != VERSION {
            return None;
        }
        let last_access_time_us = i64::from_le_bytes(body[5..13].try_into().ok()?);
        let count = u16::from_le_bytes(body[13..15].try_into().ok()?) as usize;
        let mut users = Vec::with_capacity(count);
        let mut at = HEADER_SIZE;
        for _ in 0..count {
            let len = u16::from_le_bytes(body.get(at..at + 2)?.try_into().ok()?) as usize;
            at += 2;
            let user = std::str::from_utf8(body.get(at..at + len)?).ok()?;
            at += len;
            users.push(user.to_string());
        }
        if at != body.len() {
            return None;
        }
        Some(Self { users, last_access_time_us })
    }

    /// Reads `path`; missing or corrupt files yield empty info.
    pub fn read(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => Self::decode(&data).unwrap_or_else(|| {
                warn!("dlc: discarding corrupt ref-count file {}", path.display());
                Self::default()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("dlc: failed to read {}: {err}", path.display());
                }
                Self::default()
            }
        }
    }
}

/// Which users keep a DLC alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefCountKind {
    /// The primary-session user at install time; users whose home directory
    /// disappeared from `users_dir` are dropped.
    User { users_dir: PathBuf },
    /// The fixed [`SYSTEM_USER`].
    System,
}

pub struct RefCount {
    kind: RefCountKind,
    path: PathBuf,
    info: RefCountInfo,
    expiry: Duration,
    clock: Arc<dyn Clock>,
}

impl RefCount {
    /// Loads the ref-count stored under `<prefs_dir>/<id>/`.
    pub fn new(
        used_by: UsedBy,
        users_dir: &Path,
        dlc_prefs_dir: &Path,
        expiry: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let kind = match used_by {
            UsedBy::User => RefCountKind::User { users_dir: users_dir.to_path_buf() },
            UsedBy::System => RefCountKind::System,
        };
        let path = dlc_prefs_dir.join(REF_COUNT_FILE_NAME);
        let info = RefCountInfo::read(&path);
        Self { kind, path, info, expiry, clock }
    }

    pub fn kind(&self) -> &RefCountKind {
        &self.kind
    }

    pub fn info(&self) -> &RefCountInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that `session_user` (or the system) now holds the DLC.
    /// A user-based count with no active session only refreshes the access
    /// time.
    pub fn installed_dlc(&mut self, session_user: Option<&str>) -> io::Result<()> {
        if let Some(user) = self.user_for(session_user) {
            if !self.info.users.iter().any(|existing| *existing == user) {
                self.info.users.push(user);
            }
        }
        self.persist()
    }

    /// Records that `session_user` (or the system) released the DLC.
    pub fn uninstalled_dlc(&mut self, session_user: Option<&str>) -> io::Result<()> {
        if let Some(user) = self.user_for(session_user) {
            self.info.users.retain(|existing| *existing != user);
        }
        self.persist()
    }

    /// True when nobody holds the DLC and it was last touched more than the
    /// expiry delay ago. Untouched DLCs never expire.
    pub fn should_purge_dlc(&self) -> bool {
        if !self.info.users.is_empty() || self.info.last_access_time_us == 0 {
            return false;
        }
        let elapsed_us = self.clock.now_us().saturating_sub(self.info.last_access_time_us);
        elapsed_us > i64::try_from(self.expiry.as_micros()).unwrap_or(i64::MAX)
    }

    /// Forgets all state, including the persisted file.
    pub fn reset(&mut self) -> io::Result<()> {
        self.info = RefCountInfo::default();
        utils::delete_path(&self.path)
    }

    fn user_for(&self, session_user: Option<&str>) -> Option<String> {
        match &self.kind {
            RefCountKind::System => Some(SYSTEM_USER.to_string()),
            RefCountKind::User { .. } => session_user.map(str::to_string),
        }
    }

    fn persist(&mut self) -> io::Result<()> {
        if let RefCountKind::User { users_dir } = &self.kind {
            self.info.users.retain(|user| users_dir.join(user).is_dir());
        }
        self.info.last_access_time_us = self.clock.now_us();
        utils::write_atomic(&self.path, &self.info.encode())
    }
}
