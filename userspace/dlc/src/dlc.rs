// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Per-DLC lifecycle state machine
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: Unit tests below + tests/dlc_host scenarios
//!
//! ```text
//! NOT_INSTALLED --install--> INSTALLING --finish_install--> INSTALLED
//!       ^                        |                              |
//!       +---- cancel / purge ----+------- uninstall / purge ----+
//! ```
//!
//! A verified active-slot image short-circuits NOT_INSTALLED straight to
//! INSTALLED. INSTALLED never moves back to INSTALLING.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};

use crate::error::{DlcError, ErrorCode, Result};
use crate::manifest::Manifest;
use crate::prefs::{Prefs, VERIFIED};
use crate::ref_count::{RefCount, REF_COUNT_FILE_NAME};
use crate::slot::Slot;
use crate::state::{DlcId, DlcState, DlcStateKind};
use crate::system_state::SystemState;
use crate::utils::{self, IMAGE_FILE_NAME, IMAGE_LOADER_TIMEOUT, ROOT_DIR_INSIDE_DLC};

/// Minimum progress delta that produces a new notification.
const PROGRESS_NOTIFY_DELTA: f64 = 0.01;

/// What [`Dlc::install`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The DLC is INSTALLED (either now or already before the call).
    Completed,
    /// The DLC entered INSTALLING; update-engine must deliver the image.
    External,
    /// An install was already in flight; nothing changed.
    AlreadyInstalling,
}

pub struct Dlc {
    id: DlcId,
    package: String,
    manifest: Manifest,
    system: Arc<SystemState>,
    state: DlcState,
    is_verified: bool,
    mount_point: Option<PathBuf>,
    last_reported_progress: f64,
    content_id_path: PathBuf,
    content_package_path: PathBuf,
    prefs_path: PathBuf,
    preloaded_image_path: PathBuf,
    factory_install_path: PathBuf,
    ref_count: RefCount,
}

impl Dlc {
    /// Loads the manifest of `id` and the persisted verified/ref-count state.
    /// Only a missing or invalid manifest is an error.
    pub fn initialize(id: &str, system: Arc<SystemState>) -> Result<Self> {
        let paths = system.paths().clone();
        let package = utils::scan_directory(&paths.manifest_dir.join(id))
            .map_err(|err| DlcError::internal(format!("failed to scan manifests of {id}: {err}")))?
            .into_iter()
            .next()
            .ok_or_else(|| DlcError::internal(format!("no package found for DLC {id}")))?;
        let manifest = Manifest::load(&paths.manifest_dir, id, &package)
            .map_err(|err| DlcError::internal(format!("failed to read the manifest of {id}: {err}")))?;

        let content_id_path = paths.content_dir.join(id);
        let content_package_path = content_id_path.join(&package);
        let prefs_path = paths.prefs_dir.join(id);
        let ref_count = RefCount::new(
            manifest.used_by,
            &paths.users_dir,
            &prefs_path,
            system.expiry().for_class(manifest.used_by),
            system.clock(),
        );
        let is_verified =
            Prefs::for_slot(&paths.prefs_dir, id, system.boot_slot().active()).exists(VERIFIED);

        Ok(Self {
            id: id.to_string(),
            preloaded_image_path: paths.preloaded_content_dir.join(id).join(&package).join(IMAGE_FILE_NAME),
            factory_install_path: paths.factory_install_dir.join(id).join(&package).join(IMAGE_FILE_NAME),
            package,
            manifest,
            system,
            state: DlcState::not_installed(id),
            is_verified,
            mount_point: None,
            last_reported_progress: 0.0,
            content_id_path,
            content_package_path,
            prefs_path,
            ref_count,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn description(&self) -> &str {
        &self.manifest.description
    }

    pub fn state(&self) -> &DlcState {
        &self.state
    }

    pub fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }

    pub fn is_installing(&self) -> bool {
        self.state.state == DlcStateKind::Installing
    }

    pub fn is_installed(&self) -> bool {
        self.state.state == DlcStateKind::Installed
    }

    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    pub fn image_path(&self, slot: Slot) -> PathBuf {
        self.content_package_path.join(slot.name()).join(IMAGE_FILE_NAME)
    }

    /// True if either slot image exists.
    pub fn has_content(&self) -> bool {
        Slot::ALL.iter().any(|slot| self.image_path(*slot).exists())
    }

    pub fn used_bytes_on_disk(&self) -> u64 {
        Slot::ALL.iter().filter_map(|slot| utils::file_size(&self.image_path(*slot))).sum()
    }

    /// Directory inside the mounted image, when mounted.
    pub fn root(&self) -> Option<PathBuf> {
        self.mount_point.as_ref().map(|mount| mount.join(ROOT_DIR_INSIDE_DLC))
    }

    /// NOT_INSTALLED, unreferenced and past its expiry delay.
    pub fn should_purge(&self) -> bool {
        self.state.state == DlcStateKind::NotInstalled && self.ref_count.should_purge_dlc()
    }

    /// NOT_INSTALLED and unreferenced with something left on disk; may
    /// become purgeable once its expiry delay passes.
    pub fn is_cleanup_candidate(&self) -> bool {
        self.state.state == DlcStateKind::NotInstalled
            && self.ref_count.info().users.is_empty()
            && self.ref_count.info().last_access_time_us != 0
            && (self.has_content() || self.prefs_path.join(REF_COUNT_FILE_NAME).exists())
    }

    pub fn install(&mut self) -> Result<InstallOutcome> {
        match self.state.state {
            DlcStateKind::Installed => return Ok(InstallOutcome::Completed),
            DlcStateKind::Installing => return Ok(InstallOutcome::AlreadyInstalling),
            DlcStateKind::NotInstalled => {}
        }

        let active_image = self.image_path(self.system.boot_slot().active());
        let image_existed = active_image.exists();

        if let Err(err) = self.create_dlc() {
            self.abort_install(err.code());
            return Err(err);
        }

        let mut preloaded = false;
        if self.manifest.preload_allowed && self.preloaded_image_path.exists() {
            match self.preloaded_copier() {
                Ok(matched) => preloaded = matched,
                Err(err) => {
                    error!("dlc: preloading {} failed: {err}", self.id);
                    self.abort_install(err.code());
                    return Err(err);
                }
            }
        }

        if self.is_verified && self.manifest.factory_install && self.factory_install_path.exists() {
            self.factory_install_copier();
        }

        if !self.is_verified && image_existed && !preloaded && self.verify() {
            warn!("dlc: lingering image of {} verified, skipping download", self.id);
        }

        if !self.is_verified {
            info!("dlc: {} needs an update-engine install", self.id);
            return Ok(InstallOutcome::External);
        }

        self.finish_install()?;

        if preloaded && !self.system.boot_slot().is_removable() {
            let path = self.system.paths().preloaded_content_dir.join(&self.id);
            if let Err(err) = utils::delete_path(&path) {
                error!("dlc: failed to delete preloaded image {}: {err}", path.display());
            }
        }
        Ok(InstallOutcome::Completed)
    }

    /// Verifies (if not yet verified) and mounts the active-slot image. On
    /// failure every file of this DLC is removed and the state returns to
    /// NOT_INSTALLED.
    pub fn finish_install(&mut self) -> Result<()> {
        if self.state.state == DlcStateKind::NotInstalled {
            return Err(DlcError::internal(format!("DLC {} is not being installed", self.id)));
        }
        if !self.is_verified && self.verify() {
            warn!("dlc: missing verification mark for {}, but the image is valid", self.id);
        }
        let mounted = if self.is_verified {
            self.mount()
        } else {
            Err(DlcError::internal(format!("image of {} failed verification", self.id)))
        };
        if let Err(err) = mounted {
            self.state.last_error_code = ErrorCode::Internal;
            if let Err(cleanup) = self.delete_internal() {
                error!("dlc: failed to clean up {} after install failure: {cleanup}", self.id);
            }
            return Err(err);
        }

        let user = self.system.primary_user();
        if let Err(err) = self.ref_count.installed_dlc(user.as_deref()) {
            warn!("dlc: failed to update ref-count of {}: {err}", self.id);
        }
        if let Err(err) = self.system.update_engine().set_dlc_active_value(true, &self.id) {
            warn!("dlc: update-engine failed to set {} active: {err}", self.id);
        }
        Ok(())
    }

    /// Rolls an in-flight install back to NOT_INSTALLED, recording `reason`
    /// as the last error. A DLC that is not installing is left untouched.
    pub fn cancel_install(&mut self, reason: &DlcError) -> Result<()> {
        if !self.is_installing() {
            return Ok(());
        }
        info!("dlc: cancelling install of {}: {reason}", self.id);
        self.state.last_error_code = reason.code();
        self.delete_internal()
    }

    /// Unmounts and releases the DLC, keeping its images for delayed cleanup.
    pub fn uninstall(&mut self) -> Result<()> {
        match self.state.state {
            DlcStateKind::NotInstalled => {
                info!("dlc: {} is not installed, nothing to uninstall", self.id);
                return Ok(());
            }
            DlcStateKind::Installing => {
                return Err(DlcError::busy(format!("DLC {} is being installed", self.id)))
            }
            DlcStateKind::Installed => {}
        }

        self.unmount()?;
        self.set_inactive();

        let user = self.system.primary_user();
        if let Err(err) = self.ref_count.uninstalled_dlc(user.as_deref()) {
            warn!("dlc: failed to update ref-count of {}: {err}", self.id);
        }
        for slot in Slot::ALL {
            if let Err(err) = self.slot_prefs(slot).delete(VERIFIED) {
                error!("dlc: failed to clear verified mark of {} ({}): {err}", self.id, slot.name());
            }
        }
        self.is_verified = false;
        self.mount_point = None;
        self.change_state(DlcStateKind::NotInstalled);
        Ok(())
    }

    /// Like [`Dlc::uninstall`] but deletes images and prefs immediately.
    pub fn purge(&mut self) -> Result<()> {
        match self.state.state {
            DlcStateKind::Installing => {
                return Err(DlcError::busy(format!("DLC {} is being installed", self.id)))
            }
            DlcStateKind::Installed => {
                self.unmount()?;
                self.set_inactive();
            }
            DlcStateKind::NotInstalled => {}
        }
        info!("dlc: purging {}", self.id);
        self.delete_internal()
    }

    /// Prepares the inactive slot for an OS update. Returns true when the
    /// DLC should be updated along with the OS.
    pub fn make_ready_for_update(&self) -> bool {
        let inactive = self.system.boot_slot().inactive();
        // The stale mark must go first; a verified mark on a half-written
        // image would be trusted after reboot.
        if let Err(err) = self.slot_prefs(inactive).delete(VERIFIED) {
            error!("dlc: failed to clear inactive verified mark of {}: {err}", self.id);
            return false;
        }
        if !self.is_verified {
            return false;
        }
        let path = self.image_path(inactive);
        if let Some(size) = utils::file_size(&path) {
            if size > self.manifest.preallocated_size {
                warn!(
                    "dlc: inactive image of {} is {size} bytes, larger than preallocated {}; shrinking is unsupported",
                    self.id, self.manifest.preallocated_size
                );
                return false;
            }
        }
        if let Err(err) = utils::create_file(&path, self.manifest.preallocated_size) {
            error!("dlc: failed to create inactive image {}: {err}", path.display());
            return false;
        }
        true
    }

    /// Marks the inactive slot verified after an OS update wrote it.
    pub fn update_completed(&self) -> Result<()> {
        self.slot_prefs(self.system.boot_slot().inactive()).create(VERIFIED).map_err(|err| {
            DlcError::internal(format!("failed to mark inactive {} as verified: {err}", self.id))
        })
    }

    /// Marks the active slot verified after update-engine finished writing it.
    pub fn install_completed(&mut self) -> Result<()> {
        if let Err(err) = self.mark_verified() {
            self.state.last_error_code = ErrorCode::Internal;
            return Err(DlcError::internal(format!(
                "failed to mark active {} as verified: {err}",
                self.id
            )));
        }
        Ok(())
    }

    /// Raises the install progress; decreases and calls outside INSTALLING
    /// are ignored.
    pub fn change_progress(&mut self, progress: f64) {
        if !self.is_installing() {
            warn!("dlc: cannot change progress of {}, it is not being installed", self.id);
            return;
        }
        if progress.is_nan() || progress <= self.state.progress {
            return;
        }
        self.state.progress = progress.min(1.0);
        if self.state.progress >= 1.0
            || self.state.progress - self.last_reported_progress >= PROGRESS_NOTIFY_DELTA
        {
            self.last_reported_progress = self.state.progress;
            self.system.reporter().dlc_state_changed(&self.state);
        }
    }

    fn slot_prefs(&self, slot: Slot) -> Prefs {
        Prefs::for_slot(&self.system.paths().prefs_dir, &self.id, slot)
    }

    fn create_dlc(&mut self) -> Result<()> {
        for path in [&self.content_id_path, &self.content_package_path, &self.prefs_path] {
            utils::create_dir(path).map_err(|err| {
                DlcError::internal(format!("failed to create directory {}: {err}", path.display()))
            })?;
        }
        for slot in Slot::ALL {
            let image = self.image_path(slot);
            utils::create_file(&image, self.manifest.preallocated_size).map_err(|err| {
                DlcError::allocation(format!("failed to create image {}: {err}", image.display()))
            })?;
        }
        self.change_state(DlcStateKind::Installing);
        Ok(())
    }

    /// Copies the preloaded image into the active slot. Returns whether the
    /// copy matched the manifest digest.
    fn preloaded_copier(&mut self) -> Result<bool> {
        let size = utils::file_size(&self.preloaded_image_path).ok_or_else(|| {
            DlcError::internal(format!("failed to get the size of preloaded {}", self.id))
        })?;
        if size != self.manifest.image_size {
            return Err(DlcError::internal(format!(
                "preloaded {} is {size} bytes, manifest says {}",
                self.id, self.manifest.image_size
            )));
        }

        self.mark_unverified();
        let image = self.image_path(self.system.boot_slot().active());
        let digest = utils::copy_and_hash_file(&self.preloaded_image_path, &image, size)
            .map_err(|err| {
                DlcError::internal(format!("failed to copy preloaded {} into {}: {err}", self.id, image.display()))
            })?;
        if digest != self.manifest.image_sha256 {
            warn!(
                "dlc: preloaded image of {} is corrupt: expected {} found {}",
                self.id,
                hex::encode(self.manifest.image_sha256),
                hex::encode(digest)
            );
            return Ok(false);
        }
        if let Err(err) = self.mark_verified() {
            error!("dlc: failed to mark preloaded {} verified, assuming it is: {err}", self.id);
        }
        Ok(true)
    }

    /// Moves a factory-staged image into the inactive slot. Failures only
    /// cost the staged copy.
    fn factory_install_copier(&mut self) {
        let inactive = self.system.boot_slot().inactive();
        let image = self.image_path(inactive);
        let size = self.manifest.image_size;
        match utils::copy_and_hash_file(&self.factory_install_path, &image, size) {
            Ok(digest) if digest == self.manifest.image_sha256 => {
                if let Err(err) = self.slot_prefs(inactive).create(VERIFIED) {
                    error!("dlc: failed to mark factory image of {} verified: {err}", self.id);
                }
            }
            Ok(_) => warn!("dlc: factory image of {} does not match its manifest", self.id),
            Err(err) => error!("dlc: failed to copy factory image of {}: {err}", self.id),
        }
        let staged = self.system.paths().factory_install_dir.join(&self.id);
        if let Err(err) = utils::delete_path(&staged) {
            error!("dlc: failed to delete factory image {}: {err}", staged.display());
        }
    }

    /// Hashes the active image and marks it verified on a match.
    fn verify(&mut self) -> bool {
        let image = self.image_path(self.system.boot_slot().active());
        let digest = match utils::hash_file(&image, self.manifest.image_size) {
            Ok(digest) => digest,
            Err(err) => {
                error!("dlc: failed to hash {}: {err}", image.display());
                return false;
            }
        };
        if digest != self.manifest.image_sha256 {
            warn!(
                "dlc: verification failed for {}: expected {} found {}",
                image.display(),
                hex::encode(self.manifest.image_sha256),
                hex::encode(digest)
            );
            return false;
        }
        if let Err(err) = self.mark_verified() {
            warn!("dlc: failed to mark {} verified, assuming it is: {err}", self.id);
        }
        true
    }

    fn mark_verified(&mut self) -> std::io::Result<()> {
        self.is_verified = true;
        self.slot_prefs(self.system.boot_slot().active()).create(VERIFIED)
    }

    fn mark_unverified(&mut self) {
        self.is_verified = false;
        if let Err(err) = self.slot_prefs(self.system.boot_slot().active()).delete(VERIFIED) {
            error!("dlc: failed to clear verified mark of {}: {err}", self.id);
        }
    }

    fn mount(&mut self) -> Result<()> {
        let slot = self.system.boot_slot().active();
        let mount_point = self
            .system
            .image_loader()
            .load_dlc_image(&self.id, &self.package, slot.name(), IMAGE_LOADER_TIMEOUT)
            .map_err(|err| DlcError::internal(format!("image-loader is unavailable for load: {err}")))?;
        if mount_point.is_empty() {
            return Err(DlcError::internal(format!("image-loader failed to mount {}", self.id)));
        }
        self.mount_point = Some(PathBuf::from(mount_point));
        self.change_state(DlcStateKind::Installed);
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        let unloaded = self
            .system
            .image_loader()
            .unload_dlc_image(&self.id, &self.package, IMAGE_LOADER_TIMEOUT)
            .map_err(|err| DlcError::internal(format!("image-loader is unavailable for unload: {err}")))?;
        if !unloaded {
            return Err(DlcError::internal(format!("image-loader failed to unmount {}", self.id)));
        }
        Ok(())
    }

    fn set_inactive(&self) {
        if let Err(err) = self.system.update_engine().set_dlc_active_value(false, &self.id) {
            warn!("dlc: failed to set {} inactive: {err}", self.id);
        }
    }

    /// Removes content and prefs of this DLC and moves to NOT_INSTALLED even
    /// if some paths survive.
    fn delete_internal(&mut self) -> Result<()> {
        let mut undeleted = Vec::new();
        for path in [self.content_id_path.clone(), self.prefs_path.clone()] {
            match utils::delete_path(&path) {
                Ok(()) => info!("dlc: deleted {}", path.display()),
                Err(err) => {
                    error!("dlc: failed to delete {}: {err}", path.display());
                    undeleted.push(path.display().to_string());
                }
            }
        }
        if let Err(err) = self.ref_count.reset() {
            error!("dlc: failed to reset ref-count of {}: {err}", self.id);
        }
        self.is_verified = false;
        self.mount_point = None;
        self.change_state(DlcStateKind::NotInstalled);

        if undeleted.is_empty() {
            Ok(())
        } else {
            self.state.last_error_code = ErrorCode::Internal;
            Err(DlcError::internal(format!("could not delete {}", undeleted.join(","))))
        }
    }

    /// Failure before the install reached INSTALLING or update-engine: drop
    /// everything created so far.
    fn abort_install(&mut self, code: ErrorCode) {
        self.state.last_error_code = code;
        if let Err(err) = self.delete_internal() {
            error!("dlc: failed to clean up {} after install failure: {err}", self.id);
        }
    }

    fn change_state(&mut self, next: DlcStateKind) {
        let previous = self.state.state;
        self.state.state = next;
        match next {
            DlcStateKind::NotInstalled => {
                self.state.progress = 0.0;
                self.state.root_path.clear();
            }
            DlcStateKind::Installing => {
                self.state.progress = 0.0;
                self.state.last_error_code = ErrorCode::None;
            }
            DlcStateKind::Installed => {
                self.state.progress = 1.0;
                self.state.root_path = self
                    .mount_point
                    .as_deref()
                    .map(Path::to_string_lossy)
                    .map(|root| root.into_owned())
                    .unwrap_or_default();
            }
        }
        self.last_reported_progress = self.state.progress;
        if previous != next {
            info!("dlc: {} is now {}", self.id, next.as_str());
            self.system.reporter().dlc_state_changed(&self.state);
        }
    }
}
