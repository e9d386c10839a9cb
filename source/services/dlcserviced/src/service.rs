// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: DLC service core: RPC handlers, update-engine handshake and timers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/dlc_host (scenarios, invariants)
//!
//! Single-threaded. Every entry point (RPC, update-engine status, session
//! change, timer) runs to completion before the next one starts; the owner
//! drives timers through [`DlcService::run_pending`].
//!
//! INVARIANTS:
//! - At most one watchdog and one cleanup task are pending
//! - No state transition happens after [`DlcService::shutdown`]

use std::time::Duration;

use dlc::{
    DlcError, DlcId, DlcManager, DlcState, DlcStateKind, Operation, Result, StatusResult,
};
use log::{debug, error, info, warn};

use crate::event_loop::{MessageLoop, TaskId};
use crate::protocol::{ExistingDlc, Request, Response};

pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);
pub const CLEANUP_DEBOUNCE: Duration = Duration::from_secs(30 * 60);

/// Timer periods; tests shorten them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub watchdog: Duration,
    pub cleanup_debounce: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self { watchdog: WATCHDOG_PERIOD, cleanup_debounce: CLEANUP_DEBOUNCE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Watchdog,
    Cleanup,
}

pub struct DlcService {
    manager: DlcManager,
    tasks: MessageLoop<Task>,
    timers: Timers,
    watchdog: Option<TaskId>,
    cleanup: Option<TaskId>,
    idle_polls: u32,
    shut_down: bool,
}

impl DlcService {
    pub fn new(manager: DlcManager, timers: Timers) -> Self {
        let tasks = MessageLoop::new(manager.system().clock());
        let mut service = Self {
            manager,
            tasks,
            timers,
            watchdog: None,
            cleanup: None,
            idle_polls: 0,
            shut_down: false,
        };
        service.refresh_update_engine_status();
        service.reevaluate_cleanup();
        service
    }

    pub fn manager(&self) -> &DlcManager {
        &self.manager
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.is_some()
    }

    pub fn cleanup_scheduled(&self) -> bool {
        self.cleanup.is_some()
    }

    /// Time until the next timer fires, if any is pending.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.tasks.next_deadline()
    }

    /// Dispatches a decoded RPC.
    pub fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Install { id, omaha_url } => self.install(&id, &omaha_url).map(|()| Response::Done),
            Request::Uninstall { id } => self.uninstall(&id).map(|()| Response::Done),
            Request::Purge { id } => self.purge(&id).map(|()| Response::Done),
            Request::GetState { id } => self.get_state(&id).map(Response::State),
            Request::GetInstalled => Ok(Response::States(self.get_installed())),
            Request::GetExistingDlcs => Ok(Response::Existing(self.get_existing_dlcs())),
            Request::InstallCompleted { ids } => {
                self.install_completed(&ids).map(|()| Response::Done)
            }
            Request::UpdateCompleted { ids } => self.update_completed(&ids).map(|()| Response::Done),
        }
    }

    pub fn install(&mut self, id: &str, omaha_url: &str) -> Result<()> {
        self.ensure_running()?;
        let result = self.install_internal(id, omaha_url);
        if let Err(err) = &result {
            error!("dlcserviced: install {id} failed: {err}");
        }
        self.reevaluate_cleanup();
        result
    }

    fn install_internal(&mut self, id: &str, omaha_url: &str) -> Result<()> {
        let state = self.manager.state_of(id)?;
        if state != DlcStateKind::Installing && self.manager.is_installing() {
            return Err(DlcError::busy(format!(
                "cannot install {id} while {} is installing",
                self.manager.installing_ids().join(",")
            )));
        }
        self.cancel_cleanup();

        if !self.manager.install(id)? {
            return Ok(());
        }
        if let Err(err) = self.install_with_update_engine(id, omaha_url) {
            if let Err(cancel_err) = self.manager.cancel_install(id, &err) {
                error!("dlcserviced: failed to cancel install of {id}: {cancel_err}");
            }
            return Err(err);
        }
        self.idle_polls = 0;
        self.arm_watchdog();
        Ok(())
    }

    fn install_with_update_engine(&self, id: &str, omaha_url: &str) -> Result<()> {
        let system = self.manager.system();
        let status = system
            .update_engine()
            .get_status_advanced()
            .map_err(|err| DlcError::busy(format!("failed to get update_engine status: {err}")))?;
        system.set_update_engine_status(status);
        match status.current_operation {
            Operation::Idle => {}
            Operation::UpdatedNeedReboot => {
                return Err(DlcError::need_reboot(
                    "update_engine applied an update, device needs a reboot",
                ))
            }
            other => {
                return Err(DlcError::busy(format!(
                    "update_engine is busy: {}",
                    other.as_str()
                )))
            }
        }

        info!("dlcserviced: asking update_engine to install {id}");
        system.update_engine().attempt_install(omaha_url, &[id.to_string()]).map_err(|err| {
            DlcError::busy(format!("update_engine failed to schedule install of {id}: {err}"))
        })
    }

    pub fn uninstall(&mut self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let result = self.manager.uninstall(id);
        self.reevaluate_cleanup();
        result
    }

    pub fn purge(&mut self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let result = self.manager.purge(id);
        self.reevaluate_cleanup();
        result
    }

    pub fn get_state(&self, id: &str) -> Result<DlcState> {
        Ok(self.manager.get_dlc(id)?.state().clone())
    }

    /// States of every installed DLC.
    pub fn get_installed(&self) -> Vec<DlcState> {
        self.manager
            .dlcs()
            .filter(|dlc| dlc.is_installed())
            .map(|dlc| dlc.state().clone())
            .collect()
    }

    pub fn get_existing_dlcs(&self) -> Vec<ExistingDlc> {
        self.manager
            .dlcs()
            .filter(|dlc| dlc.has_content())
            .map(|dlc| ExistingDlc {
                id: dlc.id().to_string(),
                name: dlc.name().to_string(),
                description: dlc.description().to_string(),
                used_bytes_on_disk: dlc.used_bytes_on_disk(),
            })
            .collect()
    }

    /// Prepares the inactive slot of every verified DLC for an OS update.
    pub fn get_dlcs_to_update(&self) -> Vec<DlcId> {
        self.manager.get_dlcs_to_update()
    }

    pub fn install_completed(&mut self, ids: &[DlcId]) -> Result<()> {
        self.ensure_running()?;
        self.manager.install_completed(ids)
    }

    pub fn update_completed(&mut self, ids: &[DlcId]) -> Result<()> {
        self.ensure_running()?;
        self.manager.update_completed(ids)
    }

    /// Handles a `StatusUpdateAdvanced` signal.
    pub fn on_status_update(&mut self, status: StatusResult) {
        if self.shut_down {
            return;
        }
        self.manager.system().set_update_engine_status(status);
        self.handle_status(status, false);
        self.reevaluate_cleanup();
    }

    /// Handles a `SessionStateChanged` signal.
    pub fn on_session_changed(&mut self, state: &str) {
        if self.shut_down {
            return;
        }
        self.manager.system().on_session_changed(state);
        self.reevaluate_cleanup();
    }

    /// Runs every timer whose deadline has passed; returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some((id, task)) = self.tasks.pop_ready() {
            ran += 1;
            match task {
                Task::Watchdog => {
                    if self.watchdog == Some(id) {
                        self.watchdog = None;
                    }
                    self.on_watchdog();
                }
                Task::Cleanup => {
                    if self.cleanup == Some(id) {
                        self.cleanup = None;
                    }
                    self.on_cleanup();
                }
            }
        }
        ran
    }

    /// Drops every timer. Later signals and mutating RPCs are refused.
    pub fn shutdown(&mut self) {
        self.tasks.clear();
        self.watchdog = None;
        self.cleanup = None;
        self.shut_down = true;
        info!("dlcserviced: shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            Err(DlcError::internal("dlc service is shutting down"))
        } else {
            Ok(())
        }
    }

    fn refresh_update_engine_status(&self) {
        let system = self.manager.system();
        match system.update_engine().get_status_advanced() {
            Ok(status) => system.set_update_engine_status(status),
            Err(err) => warn!("dlcserviced: failed to get update_engine status: {err}"),
        }
    }

    /// `polled` is set when the status came from the watchdog instead of a
    /// signal.
    fn handle_status(&mut self, status: StatusResult, polled: bool) {
        if !self.manager.is_installing() {
            self.cancel_watchdog();
            return;
        }
        if status.current_operation == Operation::UpdatedNeedReboot {
            self.cancel_all(&DlcError::need_reboot(
                "update_engine applied an update, device needs a reboot",
            ));
            return;
        }
        if !status.is_install {
            if polled && status.current_operation == Operation::Idle && self.idle_polls == 0 {
                self.idle_polls += 1;
                warn!("dlcserviced: update_engine idle with install outstanding, retrying");
                self.arm_watchdog();
                return;
            }
            self.cancel_all(&DlcError::internal(format!(
                "update_engine status {} is not for an install",
                status.current_operation.as_str()
            )));
            return;
        }

        self.idle_polls = 0;
        match status.current_operation {
            Operation::Idle => {
                info!("dlcserviced: update_engine idle, finishing install");
                self.cancel_watchdog();
                for id in self.manager.installing_ids() {
                    if let Err(err) = self.manager.finish_install(&id) {
                        error!("dlcserviced: failed to finish install of {id}: {err}");
                    }
                }
            }
            Operation::ReportingErrorEvent => {
                self.cancel_all(&DlcError::internal("update_engine reported an install failure"));
            }
            Operation::Downloading => {
                self.manager.change_progress(status.progress);
                self.arm_watchdog();
            }
            _ => self.arm_watchdog(),
        }
    }

    fn cancel_all(&mut self, reason: &DlcError) {
        self.cancel_watchdog();
        self.idle_polls = 0;
        for id in self.manager.installing_ids() {
            warn!("dlcserviced: cancelling install of {id}: {reason}");
            if let Err(err) = self.manager.cancel_install(&id, reason) {
                error!("dlcserviced: failed to cancel install of {id}: {err}");
            }
        }
    }

    fn on_watchdog(&mut self) {
        if !self.manager.is_installing() {
            return;
        }
        let status = self.manager.system().update_engine().get_status_advanced();
        match status {
            Ok(status) => {
                debug!("dlcserviced: watchdog polled {}", status.current_operation.as_str());
                self.manager.system().set_update_engine_status(status);
                self.handle_status(status, true);
            }
            Err(err) => {
                warn!("dlcserviced: watchdog failed to get update_engine status: {err}");
                self.arm_watchdog();
            }
        }
        self.reevaluate_cleanup();
    }

    fn on_cleanup(&mut self) {
        if self.manager.is_installing() {
            return;
        }
        let purged = self.manager.cleanup_dangling_dlcs();
        if !purged.is_empty() {
            info!("dlcserviced: cleaned up {}", purged.join(","));
        }
        self.reevaluate_cleanup();
    }

    fn arm_watchdog(&mut self) {
        self.cancel_watchdog();
        self.watchdog = Some(self.tasks.post_delayed(Task::Watchdog, self.timers.watchdog));
    }

    fn cancel_watchdog(&mut self) {
        if let Some(id) = self.watchdog.take() {
            self.tasks.cancel(id);
        }
    }

    /// Keeps a cleanup task pending while some DLC may expire and nothing is
    /// installing.
    fn reevaluate_cleanup(&mut self) {
        if self.shut_down {
            return;
        }
        if self.manager.is_installing() || !self.manager.has_cleanup_candidates() {
            self.cancel_cleanup();
            return;
        }
        if self.cleanup.is_none() {
            self.cleanup =
                Some(self.tasks.post_delayed(Task::Cleanup, self.timers.cleanup_debounce));
        }
    }

    fn cancel_cleanup(&mut self) {
        if let Some(id) = self.cleanup.take() {
            self.tasks.cancel(id);
        }
    }
}
