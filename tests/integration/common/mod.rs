#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use finix::runtime::Paths;
use finix::supervisor::Supervisor;

/// Scratch layout plus a supervisor rooted in it.
pub fn fresh_supervisor(dir: &Path) -> (Paths, Supervisor) {
    let paths = Paths::rooted(dir);
    fs::create_dir_all(&paths.conf_dir).unwrap();
    fs::create_dir_all(&paths.run_dir).unwrap();
    let supervisor = Supervisor::new(paths.clone(), false).unwrap();
    (paths, supervisor)
}

pub fn write_conf(paths: &Paths, text: &str) {
    fs::write(&paths.conf, text).unwrap();
}

/// Writes an executable helper script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Polls `check` until it returns true or the timeout expires.
pub fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

/// Polls `check` against the supervisor, reaping between attempts.
pub fn reap_until(
    supervisor: &mut Supervisor,
    what: &str,
    mut check: impl FnMut(&Supervisor) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        supervisor.reap_now();
        supervisor.fire_timers();
        if check(supervisor) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}
