// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The set of supported DLCs.
//!
//! Built once at startup from the manifest directory. The manager decides
//! which DLCs are dangling; scheduling the cleanup belongs to the caller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};

use crate::dlc::{Dlc, InstallOutcome};
use crate::error::{DlcError, Result};
use crate::state::{DlcId, DlcStateKind};
use crate::system_state::SystemState;
use crate::utils;

pub struct DlcManager {
    system: Arc<SystemState>,
    dlcs: BTreeMap<DlcId, Dlc>,
}

impl DlcManager {
    /// Loads every DLC with a valid manifest and deletes on-disk state of
    /// ids that are no longer supported.
    pub fn new(system: Arc<SystemState>) -> Result<Self> {
        let paths = system.paths().clone();
        utils::create_dir(&paths.prefs_dir).map_err(|err| {
            DlcError::internal(format!("failed to create {}: {err}", paths.prefs_dir.display()))
        })?;
        let ids = utils::scan_directory(&paths.manifest_dir).map_err(|err| {
            DlcError::internal(format!("failed to scan {}: {err}", paths.manifest_dir.display()))
        })?;

        let mut dlcs = BTreeMap::new();
        for id in ids {
            match Dlc::initialize(&id, system.clone()) {
                Ok(dlc) => {
                    dlcs.insert(id, dlc);
                }
                Err(err) => warn!("dlc: skipping {id}: {err}"),
            }
        }
        info!("dlc: {} supported DLCs", dlcs.len());

        let manager = Self { system, dlcs };
        for root in [&paths.content_dir, &paths.preloaded_content_dir, &paths.prefs_dir] {
            manager.delete_unsupported(root);
        }
        Ok(manager)
    }

    fn delete_unsupported(&self, root: &Path) {
        let entries = match utils::scan_directory(root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("dlc: failed to scan {}: {err}", root.display());
                return;
            }
        };
        for id in entries.into_iter().filter(|id| !self.dlcs.contains_key(id)) {
            let path = root.join(&id);
            match utils::delete_path(&path) {
                Ok(()) => info!("dlc: removed unsupported {}", path.display()),
                Err(err) => error!("dlc: failed to remove unsupported {}: {err}", path.display()),
            }
        }
    }

    pub fn system(&self) -> &Arc<SystemState> {
        &self.system
    }

    pub fn supported_ids(&self) -> Vec<DlcId> {
        self.dlcs.keys().cloned().collect()
    }

    pub fn get_dlc(&self, id: &str) -> Result<&Dlc> {
        self.dlcs.get(id).ok_or_else(|| unsupported(id))
    }

    fn get_dlc_mut(&mut self, id: &str) -> Result<&mut Dlc> {
        self.dlcs.get_mut(id).ok_or_else(|| unsupported(id))
    }

    pub fn dlcs(&self) -> impl Iterator<Item = &Dlc> {
        self.dlcs.values()
    }

    pub fn get_installed(&self) -> Vec<DlcId> {
        self.ids_where(|dlc| dlc.is_installed())
    }

    /// Ids with an image in either slot, installed or not.
    pub fn get_existing_dlcs(&self) -> Vec<DlcId> {
        self.ids_where(Dlc::has_content)
    }

    pub fn installing_ids(&self) -> Vec<DlcId> {
        self.ids_where(Dlc::is_installing)
    }

    pub fn is_installing(&self) -> bool {
        self.dlcs.values().any(Dlc::is_installing)
    }

    /// Prepares every DLC for an OS update and returns those to update.
    pub fn get_dlcs_to_update(&self) -> Vec<DlcId> {
        self.ids_where(Dlc::make_ready_for_update)
    }

    pub fn install_completed(&mut self, ids: &[DlcId]) -> Result<()> {
        self.check_supported(ids)?;
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.get_dlc_mut(id)?.install_completed() {
                error!("dlc: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn update_completed(&mut self, ids: &[DlcId]) -> Result<()> {
        self.check_supported(ids)?;
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.get_dlc(id)?.update_completed() {
                error!("dlc: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Starts installing `id`. Returns true when update-engine has to
    /// deliver the image.
    pub fn install(&mut self, id: &str) -> Result<bool> {
        let outcome = self.get_dlc_mut(id)?.install()?;
        Ok(outcome == InstallOutcome::External)
    }

    pub fn finish_install(&mut self, id: &str) -> Result<()> {
        self.get_dlc_mut(id)?.finish_install()
    }

    pub fn cancel_install(&mut self, id: &str, reason: &DlcError) -> Result<()> {
        self.get_dlc_mut(id)?.cancel_install(reason)
    }

    pub fn uninstall(&mut self, id: &str) -> Result<()> {
        self.get_dlc_mut(id)?.uninstall()
    }

    pub fn purge(&mut self, id: &str) -> Result<()> {
        self.get_dlc_mut(id)?.purge()
    }

    /// Forwards update-engine progress to every installing DLC.
    pub fn change_progress(&mut self, progress: f64) {
        for dlc in self.dlcs.values_mut().filter(|dlc| dlc.is_installing()) {
            dlc.change_progress(progress);
        }
    }

    /// True while some NOT_INSTALLED DLC could expire; the caller keeps a
    /// cleanup timer armed for as long as this holds.
    pub fn has_cleanup_candidates(&self) -> bool {
        self.dlcs.values().any(Dlc::is_cleanup_candidate)
    }

    /// Purges every dangling DLC and returns the purged ids.
    pub fn cleanup_dangling_dlcs(&mut self) -> Vec<DlcId> {
        let mut purged = Vec::new();
        for (id, dlc) in self.dlcs.iter_mut() {
            if !dlc.should_purge() {
                continue;
            }
            match dlc.purge() {
                Ok(()) => {
                    info!("dlc: purged dangling {id}");
                    purged.push(id.clone());
                }
                Err(err) => error!("dlc: failed to purge dangling {id}: {err}"),
            }
        }
        purged
    }

    pub fn state_of(&self, id: &str) -> Result<DlcStateKind> {
        Ok(self.get_dlc(id)?.state().state)
    }

    fn ids_where(&self, pred: impl Fn(&Dlc) -> bool) -> Vec<DlcId> {
        self.dlcs.iter().filter(|(_, dlc)| pred(dlc)).map(|(id, _)| id.clone()).collect()
    }

    fn check_supported(&self, ids: &[DlcId]) -> Result<()> {
        match ids.iter().find(|id| !self.dlcs.contains_key(id.as_str())) {
            Some(id) => Err(unsupported(id)),
            None => Ok(()),
        }
    }
}

fn unsupported(id: &str) -> DlcError {
    DlcError::invalid_dlc(format!("unsupported DLC {id}"))
}
