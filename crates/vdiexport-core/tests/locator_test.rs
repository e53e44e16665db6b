//! Integration tests for VM lookup.

mod common;

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use common::{shared_sim, vm_record, FakeApi, FakeClock, SESSION_TOKEN};
use vdiexport_core::locator::locate;
use vdiexport_core::{Error, MatchPolicy, PowerState, Session, VmQuery};

fn session() -> Session {
    Session::new(SESSION_TOKEN).unwrap()
}

#[test]
fn test_locate_by_address() {
    let clock = FakeClock::new();
    let sim = shared_sim("Stopped");
    let api = FakeApi::new(
        &clock,
        &sim,
        vec![
            vm_record("vm-1", "build-box", Path::new("/data/vm-1.img"), "10.0.0.5"),
            vm_record("vm-2", "db", Path::new("/data/vm-2.img"), "10.0.0.6"),
        ],
    );

    let vm = locate(&api, &session(), &VmQuery::parse("10.0.0.5"), MatchPolicy::FirstMatch).unwrap();

    assert_eq!(vm.id, "vm-1");
    assert_eq!(vm.display_name, "build-box");
    assert_eq!(vm.power_state, PowerState::Stopped);
    assert_eq!(vm.root_disk_path, PathBuf::from("/data/vm-1.img"));
    assert_eq!(vm.address, Some("10.0.0.5".parse::<IpAddr>().unwrap()));
    assert_eq!(api.calls().lists, vec!["vmNics.ip=10.0.0.5"]);
}

#[test]
fn test_locate_by_id_uses_nic_address() {
    let clock = FakeClock::new();
    let sim = shared_sim("Running");
    let api = FakeApi::new(
        &clock,
        &sim,
        vec![vm_record("4b1c0f6e", "build-box", Path::new("/data/vm-1.img"), "10.0.0.5")],
    );

    let vm = locate(&api, &session(), &VmQuery::parse("4b1c0f6e"), MatchPolicy::Reject).unwrap();

    assert_eq!(vm.id, "4b1c0f6e");
    assert_eq!(vm.address, Some("10.0.0.5".parse::<IpAddr>().unwrap()));
    assert_eq!(api.calls().lists, vec!["uuid=4b1c0f6e"]);
}

#[test]
fn test_no_match_is_not_found() {
    let clock = FakeClock::new();
    let sim = shared_sim("Running");
    let api = FakeApi::new(
        &clock,
        &sim,
        vec![vm_record("vm-1", "build-box", Path::new("/data/vm-1.img"), "10.0.0.5")],
    );

    let err = locate(&api, &session(), &VmQuery::parse("10.9.9.9"), MatchPolicy::FirstMatch).unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }), "unexpected error: {err}");
}

#[test]
fn test_multiple_matches() {
    let clock = FakeClock::new();
    let sim = shared_sim("Stopped");
    let api = FakeApi::new(
        &clock,
        &sim,
        vec![
            vm_record("vm-1", "build-box", Path::new("/data/vm-1.img"), "10.0.0.5"),
            vm_record("vm-2", "build-box-clone", Path::new("/data/vm-2.img"), "10.0.0.5"),
        ],
    );
    let query = VmQuery::parse("10.0.0.5");

    let vm = locate(&api, &session(), &query, MatchPolicy::FirstMatch).unwrap();
    assert_eq!(vm.id, "vm-1", "first match in API order wins");

    let err = locate(&api, &session(), &query, MatchPolicy::Reject).unwrap_err();
    match err {
        Error::NotFound { message } => {
            assert!(message.contains("vm-1"));
            assert!(message.contains("vm-2"));
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn test_missing_root_volume_is_not_found() {
    let clock = FakeClock::new();
    let sim = shared_sim("Running");
    let mut record = vm_record("vm-1", "build-box", Path::new("/data/vm-1.img"), "10.0.0.5");
    record.all_volumes.retain(|v| v.volume_type != "Root");
    let api = FakeApi::new(&clock, &sim, vec![record]);

    let err = locate(&api, &session(), &VmQuery::parse("vm-1"), MatchPolicy::FirstMatch).unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }));
}
