// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Signed snapshots of per-user Android data
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (directory serialisation, lockbox) + tests/snapshot.rs
//!   - take/load round trip, generation rotation
//!   - tamper detection on files, public key info and lockbox digest
//!
//! PUBLIC API:
//!   - Snapshot: generate_key_pair / take_snapshot / load_snapshot
//!   - SnapshotDirectory: canonical, signable description of a snapshot tree
//!   - BootLockbox: write-once-per-boot key/value contract
//!
//! DEPENDENCIES:
//!   - rsa + rand: RSA-1024 key generation and PKCS#1 v1.5 / SHA-256 signatures
//!   - sha2: file digests and the public key digest
//!   - base64: text encoding of digests and signatures

#![forbid(unsafe_code)]

pub mod directory;
pub mod error;
pub mod guard;
pub mod lockbox;
pub mod snapshot;

pub use directory::{ContextReader, NoSelinuxContext, SnapshotDirectory, SnapshotEntry};
pub use error::{Result, SnapshotError};
pub use guard::ScopedRollback;
pub use lockbox::{BootLockbox, InMemoryBootLockbox, LockboxError};
pub use snapshot::{
    sanitize_username, Generation, Snapshot, SnapshotConfig, LAST_PUBLIC_KEY, PREVIOUS_PUBLIC_KEY,
};
