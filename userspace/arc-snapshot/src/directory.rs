// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical description of a snapshot tree.
//!
//! The serialised form is what gets signed, so it must be deterministic:
//! entries sorted by relative path, integers little-endian.
//!
//! ```text
//! magic "ASNP" | version u8 | entry_count u32 |
//! per entry: path (u16 len + bytes) | sha256 (u8 len + bytes, 0 for dirs) |
//!            has_context u8 [u16 len + bytes] | has_inode u8 [u64] |
//!            mode u32 | uid u32 | gid u32 | size u64 | mtime_sec i64 | mtime_nsec u32
//! ```

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Result, SnapshotError};

const MAGIC: &[u8; 4] = b"ASNP";
const VERSION: u8 = 1;

/// Root-level files that carry the signature and signer material and are
/// therefore not covered by it.
pub const HASH_FILE: &str = "hash";
pub const PUBLIC_KEY_INFO_FILE: &str = "public_key_info";

/// Source of SELinux labels.
pub trait ContextReader {
    fn selinux_context(&self, path: &Path) -> Option<String>;
}

/// Reader for hosts without SELinux.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSelinuxContext;

impl ContextReader for NoSelinuxContext {
    fn selinux_context(&self, _path: &Path) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Path relative to the snapshot root, `/`-separated.
    pub path: String,
    /// Content digest; empty for directories.
    pub sha256: Vec<u8>,
    pub selinux_context: Option<String>,
    pub inode: Option<u64>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDirectory {
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotDirectory {
    /// Walks `root` and describes every file and directory below it.
    /// Symbolic links are rejected.
    pub fn read(root: &Path, with_inode: bool, contexts: &dyn ContextReader) -> Result<Self> {
        let mut entries = Vec::new();
        walk(root, root, with_inode, contexts, &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            put_str16(&mut out, &entry.path);
            out.push(entry.sha256.len() as u8);
            out.extend_from_slice(&entry.sha256);
            match &entry.selinux_context {
                Some(context) => {
                    out.push(1);
                    put_str16(&mut out, context);
                }
                None => out.push(0),
            }
            match entry.inode {
                Some(inode) => {
                    out.push(1);
                    out.extend_from_slice(&inode.to_le_bytes());
                }
                None => out.push(0),
            }
            out.extend_from_slice(&entry.mode.to_le_bytes());
            out.extend_from_slice(&entry.uid.to_le_bytes());
            out.extend_from_slice(&entry.gid.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
            out.extend_from_slice(&entry.mtime_sec.to_le_bytes());
            out.extend_from_slice(&entry.mtime_nsec.to_le_bytes());
        }
        out
    }
}

fn put_str16(out: &mut Vec<u8>, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(u16::MAX as usize)];
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn walk(
    root: &Path,
    dir: &Path,
    with_inode: bool,
    contexts: &dyn ContextReader,
    entries: &mut Vec<SnapshotEntry>,
) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(SnapshotError::io(dir))? {
        let entry = entry.map_err(SnapshotError::io(dir))?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path).map_err(SnapshotError::io(&path))?;
        if meta.file_type().is_symlink() {
            return Err(SnapshotError::Symlink(path));
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|err| SnapshotError::Malformed { what: "path", reason: err.to_string() })?
            .to_string_lossy()
            .into_owned();
        if dir == root && (relative == HASH_FILE || relative == PUBLIC_KEY_INFO_FILE) {
            continue;
        }

        let sha256 = if meta.is_file() {
            hash_file(&path).map_err(SnapshotError::io(&path))?.to_vec()
        } else {
            Vec::new()
        };
        entries.push(SnapshotEntry {
            path: relative,
            sha256,
            selinux_context: contexts.selinux_context(&path),
            inode: with_inode.then(|| meta.ino()),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec().clamp(0, i64::from(u32::MAX)) as u32,
        });
        if meta.is_dir() {
            walk(root, &path, with_inode, contexts, entries)?;
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().into())
}
