// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Snapshot take/load round trips, rotation and tamper detection.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use arc_snapshot::{
    sanitize_username, BootLockbox, Generation, InMemoryBootLockbox, Snapshot, SnapshotConfig,
    SnapshotError, LAST_PUBLIC_KEY, PREVIOUS_PUBLIC_KEY,
};
use tempfile::TempDir;

const SALT: &[u8] = b"system-salt";
const ACCOUNT: &str = "user@example.com";

struct Fixture {
    _dir: TempDir,
    config: SnapshotConfig,
    lockbox: InMemoryBootLockbox,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SnapshotConfig {
            snapshot_root: dir.path().join("snapshot"),
            home_root: dir.path().join("home"),
            salt: SALT.to_vec(),
            inode_verification: false,
        };
        Self { _dir: dir, config, lockbox: InMemoryBootLockbox::new() }
    }

    fn snapshot(&self) -> Snapshot<InMemoryBootLockbox> {
        Snapshot::new(self.config.clone(), self.lockbox.clone())
    }

    fn android_data(&self, account: &str) -> PathBuf {
        self.config.home_root.join(sanitize_username(SALT, account)).join("android-data")
    }

    fn populate(&self, account: &str) -> PathBuf {
        let data = self.android_data(account);
        fs::create_dir_all(data.join("data/com.example/files")).expect("mkdir");
        fs::write(data.join("data/com.example/files/state.db"), b"sqlite bytes").expect("db");
        fs::write(data.join("packages.xml"), b"<packages/>").expect("xml");
        data
    }

    fn reboot(&self) {
        self.lockbox.reboot();
    }

    fn take(&self, account: &str) {
        let mut snapshot = self.snapshot();
        snapshot.generate_key_pair().expect("generate");
        snapshot.take_snapshot(account).expect("take");
    }
}

fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).expect("read_dir") {
            let path = entry.expect("entry").path();
            let rel = path.strip_prefix(root).expect("prefix").to_string_lossy().into_owned();
            if path.is_dir() {
                out.insert(format!("{rel}/"), Vec::new());
                walk(root, &path, out);
            } else {
                out.insert(rel, fs::read(&path).expect("read"));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[test]
fn take_then_load_restores_identical_tree() {
    let fx = Fixture::new();
    let data = fx.populate(ACCOUNT);
    let before = read_tree(&data);
    fx.take(ACCOUNT);
    assert!(fx.lockbox.is_finalized());

    fs::remove_dir_all(&data).expect("wipe");
    fx.reboot();
    let generation = fx.snapshot().load_snapshot(ACCOUNT).expect("load");
    assert_eq!(generation, Generation::Last);
    assert_eq!(read_tree(&data), before);
}

#[test]
fn take_without_key_pair_fails() {
    let fx = Fixture::new();
    fx.populate(ACCOUNT);
    let mut snapshot = fx.snapshot();
    assert!(matches!(snapshot.take_snapshot(ACCOUNT), Err(SnapshotError::NoKeyPair)));

    snapshot.generate_key_pair().expect("generate");
    snapshot.take_snapshot(ACCOUNT).expect("take");
    assert!(matches!(snapshot.take_snapshot(ACCOUNT), Err(SnapshotError::NoKeyPair)));
}

#[test]
fn symlinked_android_data_is_rejected_and_leaves_nothing() {
    let fx = Fixture::new();
    let real = fx.populate("other@example.com");
    let link = fx.android_data(ACCOUNT);
    fs::create_dir_all(link.parent().expect("parent")).expect("mkdir");
    std::os::unix::fs::symlink(&real, &link).expect("symlink");

    let mut snapshot = fx.snapshot();
    snapshot.generate_key_pair().expect("generate");
    assert!(matches!(snapshot.take_snapshot(ACCOUNT), Err(SnapshotError::Symlink(_))));
    assert!(!snapshot.generation_dir(Generation::Last).exists());
}

#[test]
fn nested_symlink_rolls_back_partial_snapshot() {
    let fx = Fixture::new();
    let data = fx.populate(ACCOUNT);
    std::os::unix::fs::symlink("/etc/hostname", data.join("data/escape")).expect("symlink");

    let mut snapshot = fx.snapshot();
    snapshot.generate_key_pair().expect("generate");
    assert!(matches!(snapshot.take_snapshot(ACCOUNT), Err(SnapshotError::Symlink(_))));
    assert!(!snapshot.generation_dir(Generation::Last).exists());
}

#[test]
fn mutating_any_snapshot_file_is_detected() {
    for name in ["data/com.example/files/state.db", "packages.xml", "userhash", "public_key_info", "hash"] {
        let fx = Fixture::new();
        fx.populate(ACCOUNT);
        fx.take(ACCOUNT);
        let path = fx.snapshot().generation_dir(Generation::Last).join(name);
        let mut bytes = fs::read(&path).expect("read");
        bytes[0] ^= 0x01;
        fs::write(&path, &bytes).expect("mutate");
        assert!(fx.snapshot().load_snapshot(ACCOUNT).is_err(), "{name} tamper not detected");
    }
}

#[test]
fn lockbox_digest_mismatch_is_rejected() {
    let fx = Fixture::new();
    fx.populate(ACCOUNT);
    fx.take(ACCOUNT);

    fx.reboot();
    fx.lockbox.store(LAST_PUBLIC_KEY, "AAAA").expect("store");
    assert!(matches!(fx.snapshot().load_snapshot(ACCOUNT), Err(SnapshotError::DigestMismatch)));
}

#[test]
fn other_user_cannot_load_snapshot() {
    let fx = Fixture::new();
    fx.populate(ACCOUNT);
    fx.take(ACCOUNT);
    assert!(matches!(
        fx.snapshot().load_snapshot("someone@example.com"),
        Err(SnapshotError::UserMismatch)
    ));
}

#[test]
fn second_generation_rotates_last_into_previous() {
    let fx = Fixture::new();
    let data = fx.populate(ACCOUNT);
    let before = read_tree(&data);
    fx.take(ACCOUNT);
    let first_digest = fx.lockbox.read(LAST_PUBLIC_KEY).expect("read").expect("digest");

    fx.reboot();
    let mut snapshot = fx.snapshot();
    snapshot.generate_key_pair().expect("rotate");
    assert!(!snapshot.generation_dir(Generation::Last).exists());
    assert!(snapshot.generation_dir(Generation::Previous).is_dir());
    assert_eq!(
        fx.lockbox.read(PREVIOUS_PUBLIC_KEY).expect("read").as_deref(),
        Some(first_digest.as_str())
    );
    assert_ne!(fx.lockbox.read(LAST_PUBLIC_KEY).expect("read"), Some(first_digest));

    fs::remove_dir_all(&data).expect("wipe");
    assert_eq!(fx.snapshot().load_snapshot(ACCOUNT).expect("load"), Generation::Previous);
    assert_eq!(read_tree(&data), before);
}

#[test]
fn generate_twice_in_one_boot_fails() {
    let fx = Fixture::new();
    let mut snapshot = fx.snapshot();
    snapshot.generate_key_pair().expect("generate");
    assert!(matches!(snapshot.generate_key_pair(), Err(SnapshotError::Lockbox(_))));
}

#[test]
fn sealed_lockbox_keeps_both_generations() {
    let fx = Fixture::new();
    let data = fx.populate(ACCOUNT);
    let before = read_tree(&data);
    fx.take(ACCOUNT);
    fx.reboot();
    fx.take(ACCOUNT);
    let snapshot = fx.snapshot();
    let last = read_tree(&snapshot.generation_dir(Generation::Last));
    let previous = read_tree(&snapshot.generation_dir(Generation::Previous));
    let digests = (
        fx.lockbox.read(LAST_PUBLIC_KEY).expect("read"),
        fx.lockbox.read(PREVIOUS_PUBLIC_KEY).expect("read"),
    );

    // Same boot: the lockbox is sealed, nothing on disk may change.
    let mut again = fx.snapshot();
    assert!(matches!(again.generate_key_pair(), Err(SnapshotError::Lockbox(_))));
    assert_eq!(read_tree(&snapshot.generation_dir(Generation::Last)), last);
    assert_eq!(read_tree(&snapshot.generation_dir(Generation::Previous)), previous);
    assert_eq!(
        (
            fx.lockbox.read(LAST_PUBLIC_KEY).expect("read"),
            fx.lockbox.read(PREVIOUS_PUBLIC_KEY).expect("read"),
        ),
        digests
    );

    fs::remove_dir_all(&data).expect("wipe");
    assert_eq!(fx.snapshot().load_snapshot(ACCOUNT).expect("load"), Generation::Last);
    assert_eq!(read_tree(&data), before);
}
