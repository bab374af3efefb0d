#[path = "common/mod.rs"]
mod common;

use common::{fresh_supervisor, write_conf};
use finix::api::{Command, Frame};
use finix::conds::{CondState, Conds};
use tempfile::tempdir;

#[test]
fn emit_plus_then_minus_restores_pre_state() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "");
    supervisor.bootstrap(Some(2)).unwrap();

    let before = supervisor.conds().get("usr/x");
    assert_eq!(before, CondState::Off);

    let replies = supervisor.apply_request(&Frame::with_text(Command::Event, "+usr/x"));
    assert_eq!(replies.last().unwrap().cmd, Command::Ack);
    assert_eq!(supervisor.conds().get("usr/x"), CondState::On);
    assert!(paths.cond_file("usr/x").exists());

    let replies = supervisor.apply_request(&Frame::with_text(Command::Event, "-usr/x"));
    assert_eq!(replies.last().unwrap().cmd, Command::Ack);
    assert_eq!(supervisor.conds().get("usr/x"), before);
    assert!(!paths.cond_file("usr/x").exists());
}

#[test]
fn malformed_emit_is_nacked() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "");
    supervisor.bootstrap(Some(2)).unwrap();

    for bad in ["", "+", "-", "usr/x"] {
        let replies = supervisor.apply_request(&Frame::with_text(Command::Event, bad));
        assert_eq!(replies.last().unwrap().cmd, Command::Nack, "input {bad:?}");
    }
}

#[test]
fn stale_condition_files_are_wiped_at_boot() {
    let dir = tempdir().unwrap();
    let cond_dir = dir.path().join("cond");
    std::fs::create_dir_all(cond_dir.join("svc")).unwrap();
    std::fs::write(cond_dir.join("svc/old"), b"").unwrap();

    let conds = Conds::new(cond_dir.clone()).unwrap();
    assert_eq!(conds.get("svc/old"), CondState::Off);
    assert!(!cond_dir.join("svc/old").exists());
    assert!(cond_dir.exists());
}

#[test]
fn nested_condition_paths_round_trip_on_disk() {
    let dir = tempdir().unwrap();
    let mut conds = Conds::new(dir.path().join("cond")).unwrap();

    conds.set("net/eth0/up");
    assert!(dir.path().join("cond/net/eth0/up").exists());

    conds.clear("net/eth0/up");
    assert!(!dir.path().join("cond/net/eth0/up").exists());
    assert_eq!(conds.get("net/eth0/up"), CondState::Off);
}
