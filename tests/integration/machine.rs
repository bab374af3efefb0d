#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{fresh_supervisor, reap_until, write_conf, write_script};
use finix::api::{Command, Frame};
use finix::conds::CondState;
use finix::service::SvcState;
use tempfile::tempdir;

// Everything that forks lives in this one test: waitpid(-1) in one scenario
// would otherwise steal exits belonging to another running in parallel.
#[test]
fn service_lifecycle_end_to_end() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());

    let seq = dir.path().join("seq");
    let marker = dir.path().join("task.done");
    let r1 = write_script(
        dir.path(),
        "r1.sh",
        &format!("#!/bin/sh\nsleep 0.2\necho 1 >> {}\n", seq.display()),
    );
    let r2 = write_script(
        dir.path(),
        "r2.sh",
        &format!("#!/bin/sh\necho 2 >> {}\n", seq.display()),
    );
    let t1 = write_script(
        dir.path(),
        "t1.sh",
        &format!("#!/bin/sh\ntouch {}\n", marker.display()),
    );
    let s2 = write_script(dir.path(), "s2.sh", "#!/bin/sh\nexec sleep 30\n");
    let s3 = write_script(dir.path(), "s3.sh", "#!/bin/sh\nexec sleep 30\n");
    let sb = write_script(dir.path(), "sb.sh", "#!/bin/sh\nexec sleep 30\n");

    let base = format!(
        "run [2] {}\nrun [2] {}\ntask [2] {}\nservice [2] {}\nservice [3] {}\nservice [23] {}\n",
        r1.display(),
        r2.display(),
        t1.display(),
        s2.display(),
        s3.display(),
        sb.display()
    );
    write_conf(&paths, &base);
    supervisor.bootstrap(Some(2)).unwrap();
    assert_eq!(supervisor.runlevel(), 2);

    // Serial `run` stanzas, parallel task, and the level-2 services.
    reap_until(&mut supervisor, "bootstrap to settle", |sup| {
        let state_of = |name: &str| {
            let keys = sup.registry().by_name(name, None);
            sup.registry().get(&keys[0]).unwrap().state
        };
        state_of("r1.sh") == SvcState::Halted
            && state_of("r2.sh") == SvcState::Halted
            && state_of("t1.sh") == SvcState::Halted
            && state_of("s2.sh") == SvcState::Running
            && state_of("sb.sh") == SvcState::Running
    });
    assert_eq!(fs::read_to_string(&seq).unwrap(), "1\n2\n");
    assert!(marker.exists());

    let pid_of = |sup: &finix::supervisor::Supervisor, name: &str| {
        let keys = sup.registry().by_name(name, None);
        sup.registry().get(&keys[0]).unwrap().pid
    };
    let state_of = |sup: &finix::supervisor::Supervisor, name: &str| {
        let keys = sup.registry().by_name(name, None);
        sup.registry().get(&keys[0]).unwrap().state
    };

    let s2_pid = pid_of(&supervisor, "s2.sh");
    let sb_pid = pid_of(&supervisor, "sb.sh");
    assert!(s2_pid > 0 && sb_pid > 0);
    assert_eq!(
        supervisor.conds().get(&format!("svc/{}", s2.display())),
        CondState::On
    );
    assert_eq!(state_of(&supervisor, "s3.sh"), SvcState::Halted);

    // Start on an already-running record: ACK, nothing happens.
    let replies = supervisor.apply_request(&Frame::with_text(Command::Start, "s2.sh"));
    assert_eq!(replies.last().unwrap().cmd, Command::Ack);
    assert_eq!(pid_of(&supervisor, "s2.sh"), s2_pid);

    // Level change: s2 out, s3 in, sb untouched.
    supervisor.request_runlevel(3);
    reap_until(&mut supervisor, "runlevel 3", |sup| {
        sup.runlevel() == 3
            && {
                let keys = sup.registry().by_name("s3.sh", None);
                sup.registry().get(&keys[0]).unwrap().state == SvcState::Running
            }
            && {
                let keys = sup.registry().by_name("s2.sh", None);
                sup.registry().get(&keys[0]).unwrap().state == SvcState::Halted
            }
    });
    assert_eq!(pid_of(&supervisor, "sb.sh"), sb_pid);
    assert_eq!(
        supervisor.conds().get(&format!("svc/{}", s2.display())),
        CondState::Off
    );

    // A run still executing when the level changes is allowed to finish,
    // and the new level's services wait for it.
    let slow_done = dir.path().join("slow.done");
    let slow = write_script(
        dir.path(),
        "slow.sh",
        &format!("#!/bin/sh\nsleep 0.5\ntouch {}\n", slow_done.display()),
    );
    let with_slow = format!("{}run [3] {}\n", base, slow.display());
    write_conf(&paths, &with_slow);
    supervisor.reload().unwrap();
    assert_eq!(state_of(&supervisor, "slow.sh"), SvcState::Running);

    supervisor.request_runlevel(2);
    assert_eq!(supervisor.runlevel(), 3, "transition must wait for the run");
    reap_until(&mut supervisor, "slow run to finish the transition", |sup| {
        if sup.runlevel() == 3 {
            let keys = sup.registry().by_name("s2.sh", None);
            assert_ne!(
                sup.registry().get(&keys[0]).unwrap().state,
                SvcState::Running,
                "new level's services must wait for the run sequence"
            );
        }
        sup.runlevel() == 2
    });
    assert!(slow_done.exists(), "run must terminate, not be signalled");
    assert_eq!(state_of(&supervisor, "slow.sh"), SvcState::Halted);
    reap_until(&mut supervisor, "level 2 to settle", |sup| {
        let keys = sup.registry().by_name("s2.sh", None);
        sup.registry().get(&keys[0]).unwrap().state == SvcState::Running
    });

    // Dynamic add: a new stanza plus a reload brings up exactly one child.
    let d = write_script(dir.path(), "d.sh", "#!/bin/sh\nexec sleep 30\n");
    let mut conf = base.clone();
    conf.push_str(&format!("service [23] {}\n", d.display()));
    write_conf(&paths, &conf);
    supervisor.reload().unwrap();
    reap_until(&mut supervisor, "dynamic add", |sup| {
        let keys = sup.registry().by_name("d.sh", None);
        !keys.is_empty() && sup.registry().get(&keys[0]).unwrap().state == SvcState::Running
    });
    let d_fact = format!("svc/{}", d.display());
    assert_eq!(supervisor.conds().get(&d_fact), CondState::On);

    // Gated by condition: g waits for x, then follows it up.
    let x = write_script(dir.path(), "x.sh", "#!/bin/sh\nexec sleep 30\n");
    let g = write_script(dir.path(), "g.sh", "#!/bin/sh\nexec sleep 30\n");
    conf.push_str(&format!("service [23] <svc/{}> {}\n", x.display(), g.display()));
    write_conf(&paths, &conf);
    supervisor.reload().unwrap();
    reap_until(&mut supervisor, "gated service to wait", |sup| {
        let keys = sup.registry().by_name("g.sh", None);
        !keys.is_empty() && sup.registry().get(&keys[0]).unwrap().state == SvcState::Waiting
    });

    conf.push_str(&format!("service [23] {}\n", x.display()));
    write_conf(&paths, &conf);
    supervisor.reload().unwrap();
    reap_until(&mut supervisor, "gated service to follow", |sup| {
        let keys = sup.registry().by_name("g.sh", None);
        sup.registry().get(&keys[0]).unwrap().state == SvcState::Running
    });

    // Reload without restart: description-only change, SIGHUP-capable.
    let hupd = write_script(
        dir.path(),
        "hupd.sh",
        "#!/bin/sh\ntrap '' HUP\nwhile true; do sleep 1; done\n",
    );
    conf.push_str(&format!("service [23] {} -- one\n", hupd.display()));
    write_conf(&paths, &conf);
    supervisor.reload().unwrap();
    reap_until(&mut supervisor, "hupd to start", |sup| {
        let keys = sup.registry().by_name("hupd.sh", None);
        !keys.is_empty() && sup.registry().get(&keys[0]).unwrap().state == SvcState::Running
    });
    let hupd_pid = pid_of(&supervisor, "hupd.sh");

    let relabeled = conf.replace("-- one", "-- two");
    write_conf(&paths, &relabeled);
    supervisor.reload().unwrap();
    assert_eq!(pid_of(&supervisor, "hupd.sh"), hupd_pid);
    let keys = supervisor.registry().by_name("hupd.sh", None);
    let record = supervisor.registry().get(&keys[0]).unwrap();
    assert_eq!(record.conf.desc, "two");
    assert!(!record.changed);

    // Dynamic remove: stanzas disappear, records drain and vanish.
    write_conf(&paths, &base);
    supervisor.reload().unwrap();
    reap_until(&mut supervisor, "dynamic remove", |sup| {
        sup.registry().by_name("d.sh", None).is_empty()
            && sup.registry().by_name("g.sh", None).is_empty()
            && sup.registry().by_name("x.sh", None).is_empty()
            && sup.registry().by_name("hupd.sh", None).is_empty()
    });
    assert_eq!(supervisor.conds().get(&d_fact), CondState::Off);

    // Operator stop of the survivors.
    for name in ["s2.sh", "s3.sh", "sb.sh"] {
        let replies = supervisor.apply_request(&Frame::with_text(Command::Stop, name));
        assert_eq!(replies.last().unwrap().cmd, Command::Ack);
    }
    reap_until(&mut supervisor, "survivors to stop", |sup| {
        sup.registry()
            .iter()
            .all(|(_, svc)| svc.state == SvcState::Halted && svc.pid == 0)
    });
}

#[test]
fn unknown_selectors_are_nacked() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "");
    supervisor.bootstrap(Some(2)).unwrap();

    for cmd in [Command::Start, Command::Stop, Command::Restart, Command::Query] {
        let replies = supervisor.apply_request(&Frame::with_text(cmd, "ghost"));
        assert_eq!(replies.last().unwrap().cmd, Command::Nack);
    }
}

#[test]
fn query_reports_missing_conditions() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(
        &paths,
        "service [2] <usr/a,usr/b> name:gated /bin/gated\n",
    );
    supervisor.bootstrap(Some(2)).unwrap();

    let replies = supervisor.apply_request(&Frame::with_text(Command::Query, "gated"));
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].text(), "usr/a,usr/b");
    assert_eq!(replies.last().unwrap().cmd, Command::Ack);

    supervisor.apply_request(&Frame::with_text(Command::Event, "+usr/a"));
    let replies = supervisor.apply_request(&Frame::with_text(Command::Query, "gated"));
    assert_eq!(replies[0].text(), "usr/b");
}

#[test]
fn enumerate_streams_one_frame_per_record() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(
        &paths,
        "service [7] name:a /bin/a\nservice [7] name:b /bin/b\ntask [7] name:c /bin/c\n",
    );
    supervisor.bootstrap(Some(2)).unwrap();

    let replies = supervisor.apply_request(&Frame::new(Command::Enumerate));
    assert_eq!(replies.len(), 4);
    assert_eq!(replies.last().unwrap().cmd, Command::Ack);

    let names: Vec<String> = replies[..3]
        .iter()
        .map(|frame| {
            finix::api::Snapshot::from_text(frame.text())
                .unwrap()
                .name
        })
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn runlevel_query_reports_previous_and_current() {
    let dir = tempdir().unwrap();
    let (paths, mut supervisor) = fresh_supervisor(dir.path());
    write_conf(&paths, "");
    supervisor.bootstrap(Some(3)).unwrap();

    let replies = supervisor.apply_request(&Frame::new(Command::GetRunlevel));
    assert_eq!(replies[0].runlevel, 3);
    assert_eq!(replies[0].text(), "0 3");
}
