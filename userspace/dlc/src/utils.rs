// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File helpers shared by the engine: image sizing, hashing, atomic writes
//! and directory scans.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

pub const IMAGE_FILE_NAME: &str = "dlc.img";
pub const MANIFEST_FILE_NAME: &str = "imageloader.json";
/// Directory inside a mounted image that holds the DLC's files.
pub const ROOT_DIR_INSIDE_DLC: &str = "root";

pub const FILE_PERMS: u32 = 0o644;
pub const DIR_PERMS: u32 = 0o755;

/// Deadline applied to every image-loader call.
pub const IMAGE_LOADER_TIMEOUT: Duration = Duration::from_secs(5);

const CHUNK_SIZE: usize = 4096;

/// Creates `path` and any missing parents with mode 0755.
pub fn create_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_PERMS))
}

/// Creates (or resizes) the file at `path` to exactly `size` bytes with mode
/// 0644. Parents are created as needed.
pub fn create_file(path: &Path, size: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .mode(FILE_PERMS)
        .open(path)?;
    resize_file(&file, size)?;
    file.sync_all()
}

/// Sets the length of `file` to `size`. Growth is written out as zeros so the
/// new region is never a sparse hole; shrinking truncates.
pub fn resize_file(file: &File, size: u64) -> io::Result<()> {
    let current = file.metadata()?.len();
    if size <= current {
        return file.set_len(size);
    }
    let mut writer = file;
    writer.seek(SeekFrom::Start(current))?;
    let zeros = [0u8; CHUNK_SIZE];
    let mut remaining = size - current;
    while remaining > 0 {
        let step = remaining.min(CHUNK_SIZE as u64) as usize;
        writer.write_all(&zeros[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}

/// Writes `contents` so that readers observe either the previous file or
/// the new one: write to a sibling temp file, fsync, rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    create_dir(parent)?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = parent.join(format!(".{}.tmp", name.to_string_lossy()));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(FILE_PERMS)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// SHA-256 over the first `size` bytes of `path`. Fails if the file is
/// shorter than `size`.
pub fn hash_file(path: &Path, size: u64) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE * 16];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} is shorter than {size} bytes", path.display()),
            ));
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(hasher.finalize().into())
}

/// Copies `size` bytes from `from` over the start of `to` (which keeps its
/// allocated length) and returns the SHA-256 of the copied bytes.
pub fn copy_and_hash_file(from: &Path, to: &Path, size: u64) -> io::Result<[u8; 32]> {
    let mut src = File::open(from)?;
    let mut dst = OpenOptions::new().create(true).truncate(false).write(true).mode(FILE_PERMS).open(to)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE * 16];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = src.read(&mut buf[..want])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended before {size} bytes", from.display()),
            ));
        }
        hasher.update(&buf[..read]);
        dst.write_all(&buf[..read])?;
        remaining -= read as u64;
    }
    dst.sync_all()?;
    Ok(hasher.finalize().into())
}

/// Names of the immediate subdirectories of `dir`. A missing directory is
/// empty.
pub fn scan_directory(dir: &Path) -> io::Result<BTreeSet<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err),
    };
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Removes a file or directory tree. Missing paths are not an error.
pub fn delete_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Length of `path`, or `None` if it does not exist.
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|meta| meta.is_file()).map(|meta| meta.len())
}
