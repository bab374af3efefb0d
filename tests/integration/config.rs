#[path = "common/mod.rs"]
mod common;

use std::fs;
use std::os::unix::fs::symlink;

use finix::config::{self, LogSink, SvcKind};
use finix::runtime::Paths;
use tempfile::tempdir;

#[test]
fn snippets_parse_in_lexical_order_after_main() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    fs::create_dir_all(&paths.conf_dir).unwrap();

    fs::write(&paths.conf, "service name:a /bin/a\n").unwrap();
    fs::write(paths.conf_dir.join("20-c.conf"), "service name:c /bin/c\n").unwrap();
    fs::write(paths.conf_dir.join("10-b.conf"), "service name:b /bin/b\n").unwrap();

    let conf = config::load(&paths).unwrap();
    let names: Vec<&str> = conf.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn enabled_symlinks_are_followed_and_dangling_skipped() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    fs::create_dir_all(paths.enabled_dir()).unwrap();

    let available = dir.path().join("sshd.conf");
    fs::write(&available, "service name:sshd /usr/sbin/sshd -D\n").unwrap();
    symlink(&available, paths.enabled_dir().join("sshd.conf")).unwrap();
    symlink(
        dir.path().join("gone.conf"),
        paths.enabled_dir().join("gone.conf"),
    )
    .unwrap();

    let conf = config::load(&paths).unwrap();
    assert_eq!(conf.services.len(), 1);
    assert_eq!(conf.services[0].name, "sshd");
}

#[test]
fn include_splices_in_place() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());

    let extra = dir.path().join("extra.conf");
    fs::write(&extra, "service name:mid /bin/mid\n").unwrap();
    fs::write(
        &paths.conf,
        format!(
            "service name:first /bin/first\ninclude {}\nservice name:last /bin/last\n",
            extra.display()
        ),
    )
    .unwrap();

    let conf = config::load(&paths).unwrap();
    let names: Vec<&str> = conf.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["first", "mid", "last"]);
}

#[test]
fn include_cycles_abort_only_the_file() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());

    // The main file includes itself; the include line is skipped with a
    // warning and the rest of the file still parses.
    fs::write(
        &paths.conf,
        format!(
            "service name:a /bin/a\ninclude {}\nservice name:b /bin/b\n",
            paths.conf.display()
        ),
    )
    .unwrap();

    let conf = config::load(&paths).unwrap();
    let names: Vec<&str> = conf.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn missing_configuration_is_empty_not_an_error() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    let conf = config::load(&paths).unwrap();
    assert!(conf.services.is_empty());
    assert!(conf.env.is_empty());
}

#[test]
fn mixed_record_kinds_in_one_file() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    fs::write(
        &paths.conf,
        "task [S] /sbin/restorecon\n\
         run [S] /etc/rc.local\n\
         sysv [2345] /etc/init.d/legacy\n\
         tty [12345] /dev/tty1\n\
         inetd echo/tcp nowait [2345] internal\n\
         service [2345] log:console /usr/sbin/ntpd -n -- NTP daemon\n",
    )
    .unwrap();

    let conf = config::load(&paths).unwrap();
    let kinds: Vec<SvcKind> = conf.services.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SvcKind::Task,
            SvcKind::Run,
            SvcKind::Sysv,
            SvcKind::Tty,
            SvcKind::Inetd,
            SvcKind::Service,
        ]
    );
    assert_eq!(conf.services[5].log, LogSink::Console);
    assert_eq!(conf.services[5].desc, "NTP daemon");
}

#[test]
fn comments_and_tabs_are_whitespace() {
    let dir = tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    fs::write(
        &paths.conf,
        "# leading comment\n\tservice\t[2]\t/bin/tabbed # trailing comment\n",
    )
    .unwrap();

    let conf = config::load(&paths).unwrap();
    assert_eq!(conf.services.len(), 1);
    assert_eq!(conf.services[0].name, "tabbed");
}
