// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Host harness for DLC service integration tests
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Used by tests/scenarios.rs, tests/invariants.rs
//!
//! Collaborator fakes record every call behind a mutex so tests can assert
//! on what the service asked of image-loader and update-engine. Time is a
//! [`FakeClock`]; timers fire only when a test calls `run_pending`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dlc::{
    BootSlot, Collaborators, DlcManager, DlcState, DlcStateKind, ExpiryPolicy, FakeClock,
    ImageLoader, Operation, Paths, PrimarySession, ProxyError, SessionManager, Slot,
    StateChangeReporter, StatusResult, SystemState, UpdateEngine,
};
use dlcserviced::{DlcService, Timers};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub const PREALLOCATED_SIZE: u64 = 4096;
pub const START: Duration = Duration::from_secs(1_700_000_000);

/// Image bytes shipped for `id`; the manifest hash is taken over these.
pub fn image_for(id: &str) -> Vec<u8> {
    format!("{id}-squashfs-image-bytes").into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    Load { id: String, slot: String },
    Unload { id: String },
}

/// Image-loader fake. Mounts at `/run/imageloader/<id>/<package>` unless
/// told to refuse.
#[derive(Default)]
pub struct FakeImageLoader {
    calls: Mutex<Vec<LoaderCall>>,
    refuse: Mutex<bool>,
    refuse_unmount: Mutex<bool>,
}

impl FakeImageLoader {
    pub fn refuse_mounts(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    pub fn refuse_unmounts(&self, refuse: bool) {
        *self.refuse_unmount.lock() = refuse;
    }

    pub fn calls(&self) -> Vec<LoaderCall> {
        self.calls.lock().clone()
    }

    pub fn loads(&self) -> usize {
        self.calls.lock().iter().filter(|call| matches!(call, LoaderCall::Load { .. })).count()
    }
}

impl ImageLoader for FakeImageLoader {
    fn load_dlc_image(
        &self,
        id: &str,
        package: &str,
        slot_name: &str,
        _timeout: Duration,
    ) -> Result<String, ProxyError> {
        self.calls.lock().push(LoaderCall::Load { id: id.into(), slot: slot_name.into() });
        if *self.refuse.lock() {
            return Ok(String::new());
        }
        Ok(format!("/run/imageloader/{id}/{package}"))
    }

    fn unload_dlc_image(&self, id: &str, _: &str, _: Duration) -> Result<bool, ProxyError> {
        self.calls.lock().push(LoaderCall::Unload { id: id.into() });
        Ok(!*self.refuse_unmount.lock())
    }
}

/// Update-engine fake with a settable status.
pub struct FakeUpdateEngine {
    status: Mutex<Result<StatusResult, ProxyError>>,
    attempts: Mutex<Vec<Vec<String>>>,
    status_queries: Mutex<usize>,
    active_values: Mutex<Vec<(bool, String)>>,
    reject_attempts: Mutex<bool>,
}

impl Default for FakeUpdateEngine {
    fn default() -> Self {
        Self {
            status: Mutex::new(Ok(status(Operation::Idle, 0.0, false))),
            attempts: Mutex::new(Vec::new()),
            status_queries: Mutex::new(0),
            active_values: Mutex::new(Vec::new()),
            reject_attempts: Mutex::new(false),
        }
    }
}

impl FakeUpdateEngine {
    pub fn set_status(&self, value: StatusResult) {
        *self.status.lock() = Ok(value);
    }

    pub fn set_unreachable(&self) {
        *self.status.lock() = Err(ProxyError::Unavailable("update_engine"));
    }

    pub fn reject_attempts(&self, reject: bool) {
        *self.reject_attempts.lock() = reject;
    }

    pub fn attempts(&self) -> Vec<Vec<String>> {
        self.attempts.lock().clone()
    }

    pub fn status_queries(&self) -> usize {
        *self.status_queries.lock()
    }

    pub fn active_values(&self) -> Vec<(bool, String)> {
        self.active_values.lock().clone()
    }
}

impl UpdateEngine for FakeUpdateEngine {
    fn attempt_install(&self, _omaha_url: &str, ids: &[String]) -> Result<(), ProxyError> {
        if *self.reject_attempts.lock() {
            return Err(ProxyError::Failed("install rejected".into()));
        }
        self.attempts.lock().push(ids.to_vec());
        Ok(())
    }

    fn get_status_advanced(&self) -> Result<StatusResult, ProxyError> {
        *self.status_queries.lock() += 1;
        self.status.lock().clone()
    }

    fn set_dlc_active_value(&self, active: bool, id: &str) -> Result<(), ProxyError> {
        self.active_values.lock().push((active, id.into()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSessionManager {
    session: Mutex<Option<PrimarySession>>,
}

impl FakeSessionManager {
    pub fn set_primary(&self, sanitized: Option<&str>) {
        *self.session.lock() = sanitized.map(|user| PrimarySession {
            username: format!("{user}@example.com"),
            sanitized_username: user.to_string(),
        });
    }
}

impl SessionManager for FakeSessionManager {
    fn retrieve_primary_session(&self) -> Result<Option<PrimarySession>, ProxyError> {
        Ok(self.session.lock().clone())
    }
}

/// Keeps every `DlcStateChanged` in emission order.
#[derive(Default)]
pub struct RecordingReporter {
    states: Mutex<Vec<DlcState>>,
}

impl RecordingReporter {
    pub fn states(&self) -> Vec<DlcState> {
        self.states.lock().clone()
    }

    pub fn kinds(&self) -> Vec<DlcStateKind> {
        self.states.lock().iter().map(|state| state.state).collect()
    }

    pub fn clear(&self) {
        self.states.lock().clear();
    }
}

impl StateChangeReporter for RecordingReporter {
    fn dlc_state_changed(&self, state: &DlcState) {
        self.states.lock().push(state.clone());
    }
}

pub fn status(current_operation: Operation, progress: f64, is_install: bool) -> StatusResult {
    StatusResult { current_operation, progress, is_install }
}

/// One device: a scratch root with manifests, fakes and a fake clock.
pub struct Host {
    _dir: TempDir,
    pub paths: Paths,
    pub clock: Arc<FakeClock>,
    pub loader: Arc<FakeImageLoader>,
    pub engine: Arc<FakeUpdateEngine>,
    pub sessions: Arc<FakeSessionManager>,
    pub reporter: Arc<RecordingReporter>,
    pub system: Arc<SystemState>,
}

impl Host {
    /// Device booted from slot A with a manifest for each id.
    pub fn new(ids: &[&str]) -> Self {
        Self::with_manifests(ids.iter().map(|id| (*id, "")).collect::<Vec<_>>().as_slice())
    }

    /// Like [`Host::new`], with extra JSON members appended to each manifest
    /// (e.g. `,"preload-allowed":true`).
    pub fn with_manifests(manifests: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = Paths::under(dir.path());
        for (id, extra) in manifests {
            write_manifest(&paths, id, extra);
        }
        fs::create_dir_all(&paths.users_dir).expect("users dir");

        let clock = Arc::new(FakeClock::new(START));
        let loader = Arc::new(FakeImageLoader::default());
        let engine = Arc::new(FakeUpdateEngine::default());
        let sessions = Arc::new(FakeSessionManager::default());
        let reporter = Arc::new(RecordingReporter::default());
        let system = Arc::new(SystemState::new(
            Collaborators {
                image_loader: loader.clone(),
                update_engine: engine.clone(),
                session_manager: sessions.clone(),
                reporter: reporter.clone(),
            },
            BootSlot::new(Slot::A, false),
            paths.clone(),
            clock.clone(),
            ExpiryPolicy::default(),
        ));
        Self { _dir: dir, paths, clock, loader, engine, sessions, reporter, system }
    }

    pub fn manager(&self) -> DlcManager {
        DlcManager::new(self.system.clone()).expect("manager")
    }

    pub fn service(&self) -> DlcService {
        DlcService::new(self.manager(), Timers::default())
    }

    pub fn image_path(&self, id: &str, slot: Slot) -> PathBuf {
        self.paths.content_dir.join(id).join("package").join(slot.name()).join("dlc.img")
    }

    pub fn verified_path(&self, id: &str, slot: Slot) -> PathBuf {
        self.paths.prefs_dir.join(id).join(slot.name()).join("verified")
    }

    pub fn ref_count_path(&self, id: &str) -> PathBuf {
        self.paths.prefs_dir.join(id).join("ref_count.bin")
    }

    pub fn preload_path(&self, id: &str) -> PathBuf {
        self.paths.preloaded_content_dir.join(id).join("package").join("dlc.img")
    }

    /// Writes the shipped image into a slot the way update-engine does:
    /// over the preallocated file, without truncating it.
    pub fn deliver_image(&self, id: &str, slot: Slot) {
        let path = self.image_path(id, slot);
        fs::create_dir_all(path.parent().expect("slot dir")).expect("slot dir");
        let mut file = OpenOptions::new().write(true).create(true).open(&path).expect("open image");
        file.write_all(&image_for(id)).expect("write image");
    }

    /// Pre-places a verified active image, as left by an earlier boot.
    pub fn seed_verified_image(&self, id: &str) {
        self.deliver_image(id, Slot::A);
        let verified = self.verified_path(id, Slot::A);
        fs::create_dir_all(verified.parent().expect("prefs dir")).expect("prefs dir");
        fs::write(verified, b"").expect("verified");
    }

    pub fn write_preload(&self, id: &str, bytes: &[u8]) {
        let path = self.preload_path(id);
        fs::create_dir_all(path.parent().expect("preload dir")).expect("preload dir");
        fs::write(path, bytes).expect("preload");
    }

    /// Logs `user` in: creates its home under the users dir and reports it
    /// as the primary session.
    pub fn login(&self, service: &mut DlcService, user: &str) {
        fs::create_dir_all(self.paths.users_dir.join(user)).expect("user home");
        self.sessions.set_primary(Some(user));
        service.on_session_changed("started");
    }

    /// Every file below the content and prefs dirs for `id`.
    pub fn files_of(&self, id: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for root in [self.paths.content_dir.join(id), self.paths.prefs_dir.join(id)] {
            collect_files(&root, &mut out);
        }
        out
    }
}

fn collect_files(dir: &std::path::Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

pub fn write_manifest(paths: &Paths, id: &str, extra: &str) {
    let pkg = paths.manifest_dir.join(id).join("package");
    fs::create_dir_all(&pkg).expect("manifest dir");
    let image = image_for(id);
    let doc = format!(
        r#"{{"id":"{id}","package":"package","name":"{id} name","description":"{id} description",
            "image-sha256-hash":"{}","size":"{}","preallocated-size":"{PREALLOCATED_SIZE}"{extra}}}"#,
        hex::encode(Sha256::digest(&image)),
        image.len()
    );
    fs::write(pkg.join("imageloader.json"), doc).expect("manifest");
}
