#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{fresh_supervisor, write_conf};
use finix::service::SvcState;
use tempfile::tempdir;

// Records pinned to level 7 never spawn at the test runlevel, so these
// exercises stay process-free.

#[test]
fn reconcile_twice_is_reconcile_once() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(
        &paths,
        "service [7] name:a /bin/a\nservice [7] name:b /bin/b -- b daemon\n",
    );
    supervisor.bootstrap(Some(2)).unwrap();

    supervisor.reload().unwrap();
    let first: Vec<(String, SvcState)> = supervisor
        .registry()
        .iter()
        .map(|(_, svc)| (svc.name().to_string(), svc.state))
        .collect();

    supervisor.reload().unwrap();
    let second: Vec<(String, SvcState)> = supervisor
        .registry()
        .iter()
        .map(|(_, svc)| (svc.name().to_string(), svc.state))
        .collect();

    assert_eq!(first, second);
    assert!(!supervisor.registry().iter().any(|(_, svc)| svc.changed));
    assert!(!supervisor.registry().iter().any(|(_, svc)| svc.removal));
}

#[test]
fn added_stanza_appears_and_removed_stanza_goes_away() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "service [7] name:keep /bin/keep\n");
    supervisor.bootstrap(Some(2)).unwrap();
    assert_eq!(supervisor.registry().len(), 1);

    fs::write(
        paths.conf_dir.join("new.conf"),
        "service [7] name:fresh /bin/fresh\n",
    )
    .unwrap();
    supervisor.reload().unwrap();
    assert_eq!(supervisor.registry().len(), 2);
    assert!(!supervisor.registry().by_name("fresh", None).is_empty());

    fs::remove_file(paths.conf_dir.join("new.conf")).unwrap();
    supervisor.reload().unwrap();
    assert_eq!(supervisor.registry().len(), 1);
    assert!(supervisor.registry().by_name("fresh", None).is_empty());
}

#[test]
fn job_identity_survives_reload() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "service [7] name:stable /bin/stable\n");
    supervisor.bootstrap(Some(2)).unwrap();

    let before = supervisor.registry().by_name("stable", None);
    supervisor.reload().unwrap();
    let after = supervisor.registry().by_name("stable", None);
    assert_eq!(before, after);
}

#[test]
fn attribute_edit_sets_changed_only_once() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "service [7] name:svc /bin/svc -- one\n");
    supervisor.bootstrap(Some(2)).unwrap();

    write_conf(&paths, "service [7] name:svc /bin/svc -- two\n");
    supervisor.reload().unwrap();

    let key = &supervisor.registry().by_name("svc", None)[0];
    let svc = supervisor.registry().get(key).unwrap();
    assert_eq!(svc.conf.desc, "two");
    // The record never ran, so converge clears the changed flag in place.
    assert!(!svc.changed);

    supervisor.reload().unwrap();
    let svc = supervisor.registry().get(key).unwrap();
    assert!(!svc.changed);
}

#[test]
fn same_runlevel_request_is_a_noop() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "service [7] name:a /bin/a\n");
    supervisor.bootstrap(Some(2)).unwrap();
    assert_eq!(supervisor.runlevel(), 2);

    let states: Vec<SvcState> = supervisor
        .registry()
        .iter()
        .map(|(_, svc)| svc.state)
        .collect();
    supervisor.request_runlevel(2);
    let after: Vec<SvcState> = supervisor
        .registry()
        .iter()
        .map(|(_, svc)| svc.state)
        .collect();
    assert_eq!(supervisor.runlevel(), 2);
    assert_eq!(states, after);
}

#[test]
fn manual_service_waits_for_explicit_start() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "service [2] <usr/never> manual:yes name:m /bin/m\n");
    supervisor.bootstrap(Some(2)).unwrap();

    let key = &supervisor.registry().by_name("m", None)[0];
    assert_eq!(supervisor.registry().get(key).unwrap().state, SvcState::Halted);

    // An explicit start arms it; the unmet condition parks it in WAITING.
    let frame = finix::api::Frame::with_text(finix::api::Command::Start, "m");
    let replies = supervisor.apply_request(&frame);
    assert_eq!(replies.last().unwrap().cmd, finix::api::Command::Ack);
    assert_eq!(
        supervisor.registry().get(key).unwrap().state,
        SvcState::Waiting
    );
}
