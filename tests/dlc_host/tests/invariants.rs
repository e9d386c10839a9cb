// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Properties that must hold for every DLC regardless of history
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 tests (1 property)
//!
//! TEST_SCOPE:
//!   - INSTALLED implies a verified active slot and a mount point
//!   - Failed installs leave nothing on disk
//!   - Progress never regresses within an install
//!   - Uninstall/Purge are refused while installing
//!   - Unsupported content is removed at startup

use std::fs;

use dlc::{DlcStateKind, ErrorCode, Operation, Slot};
use dlc_host::{status, Host};
use proptest::prelude::*;

fn assert_installed_invariant(host: &Host, service: &dlcserviced::DlcService) {
    for dlc in service.manager().dlcs() {
        if dlc.state().state == DlcStateKind::Installed {
            assert!(host.verified_path(dlc.id(), Slot::A).exists(), "{} not verified", dlc.id());
            assert!(!dlc.state().root_path.is_empty(), "{} has no mount", dlc.id());
        }
    }
}

#[test]
fn test_installed_implies_verified_and_mounted() {
    let host = Host::new(&["a", "b", "c"]);
    host.seed_verified_image("a");
    let mut service = host.service();

    service.install("a", "").expect("install a");
    assert_installed_invariant(&host, &service);

    service.install("b", "").expect("install b");
    host.deliver_image("b", Slot::A);
    service.on_status_update(status(Operation::Idle, 0.0, true));
    assert_installed_invariant(&host, &service);

    // The verified mark was lost; finishing re-hashes the image.
    host.seed_verified_image("c");
    fs::remove_file(host.verified_path("c", Slot::A)).expect("drop mark");
    service.install("c", "").expect("install c");
    assert_eq!(service.get_state("c").expect("state").state, DlcStateKind::Installed);
    assert_installed_invariant(&host, &service);

    service.uninstall("a").expect("uninstall");
    assert!(!host.verified_path("a", Slot::A).exists());
    assert!(host.image_path("a", Slot::A).exists());
    assert_installed_invariant(&host, &service);
}

#[test]
fn test_failed_installs_leave_no_files() {
    let host = Host::new(&["a"]);
    let mut service = host.service();

    service.install("a", "").expect("install");
    // update-engine wrote garbage; finishing fails verification.
    service.on_status_update(status(Operation::Idle, 0.0, true));
    let state = service.get_state("a").expect("state");
    assert_eq!(state.state, DlcStateKind::NotInstalled);
    assert_eq!(state.last_error_code, ErrorCode::Internal);
    assert!(host.files_of("a").is_empty(), "left behind: {:?}", host.files_of("a"));

    // A later install needs no manual cleanup.
    service.install("a", "").expect("retry");
    host.deliver_image("a", Slot::A);
    service.on_status_update(status(Operation::Idle, 0.0, true));
    assert_eq!(service.get_state("a").expect("state").state, DlcStateKind::Installed);
}

#[test]
fn test_uninstall_and_purge_refused_while_installing() {
    let host = Host::new(&["a"]);
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.on_status_update(status(Operation::Downloading, 0.3, true));
    let before = service.get_state("a").expect("state");

    assert_eq!(service.uninstall("a").expect_err("busy").code(), ErrorCode::Busy);
    assert_eq!(service.purge("a").expect_err("busy").code(), ErrorCode::Busy);
    assert_eq!(service.get_state("a").expect("state"), before);
    assert!(host.image_path("a", Slot::A).exists());
}

#[test]
fn test_unsupported_content_removed_at_startup() {
    let host = Host::new(&["a"]);
    for root in [&host.paths.content_dir, &host.paths.preloaded_content_dir, &host.paths.prefs_dir] {
        fs::create_dir_all(root.join("gone/package")).expect("stale dir");
    }
    let service = host.service();
    assert_eq!(service.manager().supported_ids(), vec!["a".to_string()]);
    assert!(!host.paths.content_dir.join("gone").exists());
    assert!(!host.paths.preloaded_content_dir.join("gone").exists());
    assert!(!host.paths.prefs_dir.join("gone").exists());
}

#[test]
fn test_reinstall_refreshes_last_access() {
    let host = Host::new(&["a"]);
    host.seed_verified_image("a");
    let mut service = host.service();
    service.install("a", "").expect("install");
    service.uninstall("a").expect("uninstall");
    let uninstalled_at = service.manager().get_dlc("a").expect("dlc").ref_count().info().last_access_time_us;

    host.clock.advance(std::time::Duration::from_secs(60));
    host.seed_verified_image("a");
    service.install("a", "").expect("reinstall");
    let info = service.manager().get_dlc("a").expect("dlc").ref_count().info().clone();
    assert_eq!(info.last_access_time_us, uninstalled_at + 60_000_000);
    assert_eq!(info.users, vec!["system".to_string()]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_progress_is_monotone(updates in prop::collection::vec(0.0f64..1.0, 1..24)) {
        let host = Host::new(&["a"]);
        let mut service = host.service();
        service.install("a", "").expect("install");

        let mut last = 0.0;
        for progress in updates {
            service.on_status_update(status(Operation::Downloading, progress, true));
            let current = service.get_state("a").expect("state").progress;
            prop_assert!(current >= last, "progress went from {} to {}", last, current);
            last = current;
        }
        let reported: Vec<f64> = host
            .reporter
            .states()
            .iter()
            .filter(|state| state.state == DlcStateKind::Installing)
            .map(|state| state.progress)
            .collect();
        prop_assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
