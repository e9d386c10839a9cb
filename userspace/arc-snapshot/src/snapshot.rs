// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Snapshot generations, signing and verified restore
//! OWNERS: @runtime
//!
//! Two generations live under the snapshot root: `last` and `previous`.
//! Each carries `public_key_info` (base64 SPKI DER), `userhash` and `hash`
//! (base64 RSA-PKCS1-SHA256 signature over the canonical directory). The
//! base64 SHA-256 of the SPKI DER is sealed in the boot lockbox, which is
//! what anchors a generation to the boot that produced it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{error, info, warn};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::signature::{RandomizedSigner as _, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::directory::{
    ContextReader, NoSelinuxContext, SnapshotDirectory, HASH_FILE, PUBLIC_KEY_INFO_FILE,
};
use crate::error::{Result, SnapshotError};
use crate::guard::ScopedRollback;
use crate::lockbox::BootLockbox;

pub const LAST_PUBLIC_KEY: &str = "snapshot_public_key_last";
pub const PREVIOUS_PUBLIC_KEY: &str = "snapshot_public_key_previous";

const USERHASH_FILE: &str = "userhash";
const ANDROID_DATA_DIR: &str = "android-data";
const KEY_BITS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Last,
    Previous,
}

impl Generation {
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Previous => "previous",
        }
    }

    pub const fn lockbox_key(self) -> &'static str {
        match self {
            Self::Last => LAST_PUBLIC_KEY,
            Self::Previous => PREVIOUS_PUBLIC_KEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    pub snapshot_root: PathBuf,
    /// Holds one `<userhash>/android-data` directory per user.
    pub home_root: PathBuf,
    pub salt: Vec<u8>,
    /// Include inode numbers in the signed description. A restored copy
    /// only verifies against the same inodes when this is off.
    pub inode_verification: bool,
}

/// Lowercase hex SHA-256 of `salt || lowercase(account_id)`.
pub fn sanitize_username(salt: &[u8], account_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(account_id.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Snapshot<L: BootLockbox> {
    config: SnapshotConfig,
    lockbox: L,
    contexts: Box<dyn ContextReader>,
    key_pair: Option<RsaPrivateKey>,
}

impl<L: BootLockbox> Snapshot<L> {
    pub fn new(config: SnapshotConfig, lockbox: L) -> Self {
        Self { config, lockbox, contexts: Box::new(NoSelinuxContext), key_pair: None }
    }

    pub fn with_context_reader(mut self, contexts: Box<dyn ContextReader>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn generation_dir(&self, generation: Generation) -> PathBuf {
        self.config.snapshot_root.join(generation.dir_name())
    }

    pub fn android_data_dir(&self, userhash: &str) -> PathBuf {
        self.config.home_root.join(userhash).join(ANDROID_DATA_DIR)
    }

    /// Rotates `last` into `previous`, generates a fresh key pair, seals its
    /// digest under the last key and finalizes the lockbox. Both lockbox
    /// values are stored before any generation on disk is touched, so a
    /// sealed lockbox leaves `last` and `previous` intact.
    pub fn generate_key_pair(&mut self) -> Result<()> {
        let last = self.generation_dir(Generation::Last);
        let rotated_digest = if last.exists() {
            let digest = self.lockbox.read(LAST_PUBLIC_KEY)?;
            if digest.is_none() {
                warn!("arc-snapshot: last snapshot has no lockbox digest, dropping it");
            }
            digest
        } else {
            None
        };

        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|err| SnapshotError::Crypto(err.to_string()))?;
        let spki = public_key_der(&private_key.to_public_key())?;
        if let Some(digest) = &rotated_digest {
            self.lockbox.store(PREVIOUS_PUBLIC_KEY, digest)?;
        }
        self.lockbox.store(LAST_PUBLIC_KEY, &digest_of(&spki))?;

        if rotated_digest.is_some() {
            self.rotate_generations()?;
        }
        remove_path(&last)?;
        self.lockbox.finalize()?;
        self.key_pair = Some(private_key);
        info!("arc-snapshot: generated a new key pair");
        Ok(())
    }

    fn rotate_generations(&self) -> Result<()> {
        let last = self.generation_dir(Generation::Last);
        let previous = self.generation_dir(Generation::Previous);
        remove_path(&previous)?;
        if let Err(err) = fs::rename(&last, &previous) {
            // Roll forward: a half-moved generation is dropped; the next
            // take_snapshot writes a fresh one.
            error!("arc-snapshot: failed to move last snapshot to previous: {err}");
            remove_path(&previous)?;
        }
        Ok(())
    }

    /// Copies the user's android-data into `last` and signs it. The key pair
    /// is consumed; a second snapshot needs a new key pair.
    pub fn take_snapshot(&mut self, account_id: &str) -> Result<()> {
        let private_key = self.key_pair.take().ok_or(SnapshotError::NoKeyPair)?;
        let userhash = sanitize_username(&self.config.salt, account_id);
        let source = self.android_data_dir(&userhash);
        let meta = fs::symlink_metadata(&source)
            .map_err(|_| SnapshotError::MissingDirectory(source.clone()))?;
        if meta.file_type().is_symlink() {
            return Err(SnapshotError::Symlink(source));
        }
        if !meta.is_dir() {
            return Err(SnapshotError::MissingDirectory(source));
        }

        let last = self.generation_dir(Generation::Last);
        remove_path(&last)?;
        let rollback_dir = last.clone();
        let rollback = ScopedRollback::new(move || {
            clear_partial(&rollback_dir);
        });

        copy_tree(&source, &last, &[])?;
        let spki = public_key_der(&private_key.to_public_key())?;
        write_file(&last.join(PUBLIC_KEY_INFO_FILE), STANDARD.encode(&spki).as_bytes())?;
        write_file(&last.join(USERHASH_FILE), userhash.as_bytes())?;

        let canonical =
            SnapshotDirectory::read(&last, self.config.inode_verification, self.contexts.as_ref())?
                .serialize();
        let signature = SigningKey::<Sha256>::new(private_key)
            .try_sign_with_rng(&mut rand::thread_rng(), &canonical)
            .map_err(|err| SnapshotError::Crypto(err.to_string()))?;
        write_file(&last.join(HASH_FILE), STANDARD.encode(signature.to_bytes()).as_bytes())?;

        rollback.commit();
        info!("arc-snapshot: snapshot taken");
        Ok(())
    }

    /// Verifies `last`, then `previous`, and restores the first one that
    /// checks out into the user's android-data directory.
    pub fn load_snapshot(&self, account_id: &str) -> Result<Generation> {
        let userhash = sanitize_username(&self.config.salt, account_id);
        let mut last_err = SnapshotError::NoSnapshot;
        for generation in [Generation::Last, Generation::Previous] {
            let dir = self.generation_dir(generation);
            if !dir.is_dir() {
                continue;
            }
            match self.verify_generation(&dir, generation, &userhash) {
                Ok(()) => {
                    self.restore(&dir, &self.android_data_dir(&userhash))?;
                    info!("arc-snapshot: restored {} snapshot", generation.dir_name());
                    return Ok(generation);
                }
                Err(err) => {
                    warn!("arc-snapshot: {} snapshot rejected: {err}", generation.dir_name());
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Checks one generation without restoring it.
    pub fn verify_generation(&self, dir: &Path, generation: Generation, userhash: &str) -> Result<()> {
        let sealed = self
            .lockbox
            .read(generation.lockbox_key())?
            .ok_or(SnapshotError::MissingDigest(generation.lockbox_key()))?;

        let stored_user = fs::read_to_string(dir.join(USERHASH_FILE))
            .map_err(SnapshotError::io(dir.join(USERHASH_FILE)))?;
        if stored_user.trim() != userhash {
            return Err(SnapshotError::UserMismatch);
        }

        let canonical =
            SnapshotDirectory::read(dir, self.config.inode_verification, self.contexts.as_ref())?
                .serialize();

        let spki = decode_file(&dir.join(PUBLIC_KEY_INFO_FILE), "public key info")?;
        if digest_of(&spki) != sealed {
            return Err(SnapshotError::DigestMismatch);
        }
        let public_key = RsaPublicKey::from_public_key_der(&spki).map_err(|err| {
            SnapshotError::Malformed { what: "public key info", reason: err.to_string() }
        })?;

        let raw_signature = decode_file(&dir.join(HASH_FILE), "signature")?;
        let signature = Signature::try_from(raw_signature.as_slice())
            .map_err(|err| SnapshotError::BadSignature(err.to_string()))?;
        VerifyingKey::<Sha256>::new(public_key)
            .verify(&canonical, &signature)
            .map_err(|err| SnapshotError::BadSignature(err.to_string()))
    }

    /// Replaces `dest` with the snapshot contents via a sibling temp dir.
    fn restore(&self, snapshot: &Path, dest: &Path) -> Result<()> {
        let parent = dest.parent().ok_or_else(|| SnapshotError::MissingDirectory(dest.to_path_buf()))?;
        fs::create_dir_all(parent).map_err(SnapshotError::io(parent))?;
        let staging = parent.join(format!(".{ANDROID_DATA_DIR}.restore"));
        remove_path(&staging)?;
        let rollback_dir = staging.clone();
        let rollback = ScopedRollback::new(move || {
            clear_partial(&rollback_dir);
        });
        copy_tree(snapshot, &staging, &[HASH_FILE, PUBLIC_KEY_INFO_FILE, USERHASH_FILE])?;
        remove_path(dest)?;
        fs::rename(&staging, dest).map_err(SnapshotError::io(dest))?;
        rollback.commit();
        Ok(())
    }
}

/// Drops a half-written directory; returns whether it is gone.
fn clear_partial(dir: &Path) -> bool {
    match fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            error!("arc-snapshot: failed to clear partial directory {}: {err}", dir.display());
            false
        }
    }
}

fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|err| SnapshotError::Crypto(err.to_string()))
}

fn digest_of(spki: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(spki))
}

fn decode_file(path: &Path, what: &'static str) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path).map_err(SnapshotError::io(path))?;
    STANDARD
        .decode(text.trim())
        .map_err(|err| SnapshotError::Malformed { what, reason: err.to_string() })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(SnapshotError::io(path))
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(SnapshotError::Io { path: path.to_path_buf(), source: err }),
        _ => Ok(()),
    }
}

/// Recursively copies `from` into a new directory `to`, skipping root-level
/// names in `skip_at_root`. Symbolic links abort the copy.
fn copy_tree(from: &Path, to: &Path, skip_at_root: &[&str]) -> Result<()> {
    fs::create_dir_all(to).map_err(SnapshotError::io(to))?;
    let perms = fs::metadata(from).map_err(SnapshotError::io(from))?.permissions();
    fs::set_permissions(to, perms).map_err(SnapshotError::io(to))?;
    for entry in fs::read_dir(from).map_err(SnapshotError::io(from))? {
        let entry = entry.map_err(SnapshotError::io(from))?;
        let name = entry.file_name();
        if skip_at_root.iter().any(|skip| name == *skip) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        let file_type = entry.file_type().map_err(SnapshotError::io(&src))?;
        if file_type.is_symlink() {
            return Err(SnapshotError::Symlink(src));
        } else if file_type.is_dir() {
            copy_tree(&src, &dst, &[])?;
        } else {
            fs::copy(&src, &dst).map_err(SnapshotError::io(&src))?;
        }
    }
    Ok(())
}
