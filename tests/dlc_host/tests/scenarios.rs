// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: End-to-end DLC service flows against collaborator fakes
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 20 tests
//!
//! TEST_SCOPE:
//!   - Install handshake with update-engine
//!   - Status-driven transitions and the watchdog
//!   - Dangling cleanup timer
//!   - Session forwarding into ref-counts
//!
//! TEST_SCENARIOS:
//!   - test_pristine_install_via_update_engine(): INSTALLING then INSTALLED with mount root
//!   - test_verified_image_short_circuits(): no AttemptInstall, straight to INSTALLED
//!   - test_mount_failure_rolls_back(): internal error, files and verified mark gone
//!   - test_preload_size_mismatch_fails_cleanly(): failure with no content left
//!   - test_dangling_cleanup_after_expiry(): purge after six days, not before
//!   - test_pushed_reboot_signal_cancels_install(): need-reboot, nothing left on disk
//!   - test_failed_unmount_keeps_dlc_active(): still INSTALLED and active

use std::time::Duration;

use dlc::{DlcStateKind, ErrorCode, Operation, Slot};
use dlc_host::{image_for, status, Host, LoaderCall};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[test]
fn test_pristine_install_via_update_engine() {
    let host = Host::new(&["a"]);
    let mut service = host.service();

    service.install("a", "").expect("install");
    assert_eq!(host.engine.attempts(), vec![vec!["a".to_string()]]);
    assert!(service.watchdog_armed());
    assert_eq!(host.reporter.kinds(), vec![DlcStateKind::Installing]);
    assert_eq!(host.reporter.states()[0].progress, 0.0);

    host.deliver_image("a", Slot::A);
    service.on_status_update(status(Operation::Downloading, 0.5, true));
    service.on_status_update(status(Operation::Idle, 0.0, true));

    let kinds = host.reporter.kinds();
    assert_eq!(kinds.first(), Some(&DlcStateKind::Installing));
    assert_eq!(kinds.last(), Some(&DlcStateKind::Installed));
    let installed = host.reporter.states().pop().expect("state");
    assert_eq!(installed.progress, 1.0);
    assert_eq!(installed.root_path, "/run/imageloader/a/package");
    assert_eq!(service.get_installed(), vec![installed]);
    assert!(!service.watchdog_armed());
    assert!(host.verified_path("a", Slot::A).exists());
    assert_eq!(host.engine.active_values(), vec![(true, "a".to_string())]);
}

#[test]
fn test_pristine_install_emits_exactly_two_transitions() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    host.deliver_image("a", Slot::A);
    service.on_status_update(status(Operation::Idle, 0.0, true));
    assert_eq!(host.reporter.kinds(), vec![DlcStateKind::Installing, DlcStateKind::Installed]);
}

#[test]
fn test_verified_image_short_circuits() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    let mut service = host.service();

    service.install("a", "").expect("install");
    assert!(host.engine.attempts().is_empty());
    assert_eq!(host.loader.calls(), vec![LoaderCall::Load { id: "a".into(), slot: "Dlc-A".into() }]);
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::Installed);
    assert!(!service.watchdog_armed());
}

#[test]
fn test_mount_failure_rolls_back() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    host.loader.refuse_mounts(true);
    let mut service = host.service();

    assert!(service.install("a", "").is_err());
    let state = service.get_state("a").expect("state");
    assert_eq!(state.state, DlcStateKind::NotInstalled);
    assert_eq!(state.last_error_code, ErrorCode::Internal);
    assert!(!host.image_path("a", Slot::A).exists());
    assert!(!host.image_path("a", Slot::B).exists());
    assert!(!host.verified_path("a", Slot::A).exists());
}

#[test]
fn test_preload_size_mismatch_fails_cleanly() {
    let host = Host::with_manifests(&[("a", r#","preload-allowed":true"#)]);
    let mut image = image_for("a");
    image.push(0);
    host.write_preload("a", &image);
    let mut service = host.service();

    assert!(service.install("a", "").is_err());
    assert!(host.files_of("a").is_empty(), "left behind: {:?}", host.files_of("a"));
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::NotInstalled);
    assert!(host.engine.attempts().is_empty());
}

#[test]
fn test_dangling_cleanup_after_expiry() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.uninstall("a").expect("uninstall");
    assert!(host.ref_count_path("a").exists());
    assert!(service.cleanup_scheduled());

    // The debounce passes but the DLC has not expired yet.
    host.clock.advance(Duration::from_secs(31 * 60));
    assert_eq!(service.run_pending(), 1);
    assert!(host.image_path("a", Slot::A).exists());
    assert!(service.cleanup_scheduled());

    host.clock.advance(6 * DAY);
    service.run_pending();
    assert!(!host.ref_count_path("a").exists());
    assert!(!host.paths.content_dir.join("a").exists());
    assert!(service.manager().supported_ids().contains(&"a".to_string()));
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::NotInstalled);
    assert!(!service.cleanup_scheduled());
}

#[test]
fn test_update_engine_busy_rejects_install() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    host.engine.set_status(status(Operation::Downloading, 0.2, false));

    let err = service.install("a", "").expect_err("busy");
    assert_eq!(err.code(), ErrorCode::Busy);
    assert!(host.files_of("a").is_empty());
    assert_eq!(service.get_state("a").expect("state").last_error_code, ErrorCode::Busy);
}

#[test]
fn test_pending_reboot_rejects_install() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    host.engine.set_status(status(Operation::UpdatedNeedReboot, 1.0, false));

    let err = service.install("a", "").expect_err("need reboot");
    assert_eq!(err.code(), ErrorCode::NeedReboot);
    assert!(host.engine.attempts().is_empty());
}

#[test]
fn test_rejected_attempt_cancels_install() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    host.engine.reject_attempts(true);

    assert_eq!(service.install("a", "").expect_err("busy").code(), ErrorCode::Busy);
    assert!(!service.manager().is_installing());
    assert!(!service.watchdog_armed());
    assert!(host.files_of("a").is_empty());
}

#[test]
fn test_second_install_while_installing_is_busy() {
    let host = Host::new(&["a", "b"]);
    let mut service = host.service();
    service.install("a", "").expect("install a");
    service.install("a", "").expect("same id is a no-op");
    assert_eq!(service.install("b", "").expect_err("busy").code(), ErrorCode::Busy);
    assert_eq!(host.engine.attempts().len(), 1);
}

#[test]
fn test_reporting_error_event_cancels() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.on_status_update(status(Operation::ReportingErrorEvent, 0.0, true));

    let state = service.get_state("a").expect("state");
    assert_eq!(state.state, DlcStateKind::NotInstalled);
    assert_eq!(state.last_error_code, ErrorCode::Internal);
    assert!(host.files_of("a").is_empty());
}

#[test]
fn test_watchdog_retries_idle_once_then_cancels() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    let queries = host.engine.status_queries();

    // update-engine never reports and stays idle.
    host.clock.advance(Duration::from_secs(5));
    service.run_pending();
    assert_eq!(host.engine.status_queries(), queries + 1);
    assert!(service.manager().is_installing());
    assert!(service.watchdog_armed());

    host.clock.advance(Duration::from_secs(5));
    service.run_pending();
    assert!(!service.manager().is_installing());
    assert_eq!(service.get_state("a").expect("state").last_error_code, ErrorCode::Internal);
}

#[test]
fn test_watchdog_recovers_lost_idle_signal() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.on_status_update(status(Operation::Downloading, 0.9, true));

    host.deliver_image("a", Slot::A);
    host.engine.set_status(status(Operation::Idle, 0.0, true));
    host.clock.advance(Duration::from_secs(5));
    service.run_pending();
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::Installed);
}

#[test]
fn test_watchdog_cancels_on_pending_reboot() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    host.engine.set_status(status(Operation::UpdatedNeedReboot, 1.0, false));
    host.clock.advance(Duration::from_secs(5));
    service.run_pending();
    assert_eq!(service.get_state("a").expect("state").last_error_code, ErrorCode::NeedReboot);
}

#[test]
fn test_status_signal_rearms_watchdog() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    let queries = host.engine.status_queries();

    host.clock.advance(Duration::from_secs(4));
    service.on_status_update(status(Operation::CheckingForUpdate, 0.0, true));
    host.clock.advance(Duration::from_secs(4));
    assert_eq!(service.run_pending(), 0);
    assert_eq!(host.engine.status_queries(), queries);
    assert_eq!(service.next_deadline(), Some(Duration::from_secs(1)));
}

#[test]
fn test_session_user_is_recorded_on_install() {
    let host = Host::with_manifests(&[("a", r#","used-by":"user""#)]);
    host.seed_verified_image("a");
    let mut service = host.service();
    host.login(&mut service, "0123abcd");
    service.install("a", "").expect("install");

    let info = service.manager().get_dlc("a").expect("dlc").ref_count().info().clone();
    assert_eq!(info.users, vec!["0123abcd".to_string()]);

    service.uninstall("a").expect("uninstall");
    let info = service.manager().get_dlc("a").expect("dlc").ref_count().info().clone();
    assert!(info.users.is_empty());
}

#[test]
fn test_install_cancels_pending_cleanup() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.uninstall("a").expect("uninstall");
    assert!(service.cleanup_scheduled());

    host.seed_verified_image("a");
    service.install("a", "").expect("reinstall");
    assert!(!service.cleanup_scheduled());

    host.clock.advance(6 * DAY);
    service.run_pending();
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::Installed);
}

#[test]
fn test_not_install_status_cancels_install() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.on_status_update(status(Operation::CheckingForUpdate, 0.0, false));
    assert!(!service.manager().is_installing());
    assert!(!service.watchdog_armed());
}

#[test]
fn test_pushed_reboot_signal_cancels_install() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.on_status_update(status(Operation::Downloading, 0.4, true));

    service.on_status_update(status(Operation::UpdatedNeedReboot, 1.0, true));
    let state = service.get_state("a").expect("state");
    assert_eq!(state.state, DlcStateKind::NotInstalled);
    assert_eq!(state.last_error_code, ErrorCode::NeedReboot);
    assert!(host.files_of("a").is_empty(), "left behind: {:?}", host.files_of("a"));
    assert!(!service.watchdog_armed());
}

#[test]
fn test_failed_unmount_keeps_dlc_active() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    let mut service = host.service();
    service.install("a", "").expect("install");
    host.loader.refuse_unmounts(true);

    assert_eq!(service.uninstall("a").expect_err("unmount").code(), ErrorCode::Internal);
    assert_eq!(service.purge("a").expect_err("unmount").code(), ErrorCode::Internal);
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::Installed);
    assert_eq!(host.engine.active_values(), vec![(true, "a".to_string())]);

    host.loader.refuse_unmounts(false);
    service.uninstall("a").expect("uninstall");
    assert_eq!(
        host.engine.active_values(),
        vec![(true, "a".to_string()), (false, "a".to_string())]
    );
}
