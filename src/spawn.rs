//! Child supervision: fork/exec, pidfiles, reaping, exit classification.
//!
//! This module is the only caller of fork, execve, and waitpid. The child
//! side resets signal dispositions, calls setsid, chdirs to /, drops
//! privileges, applies resource limits, attaches to its cgroup, redirects
//! stdio per the log-sink policy, and execs. Any setup failure makes the
//! child `_exit` nonzero so the supervisor classifies it as a crash.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, User, chdir, dup2, execve, fork, setsid};
use tracing::{debug, warn};

use crate::config::{LogRotate, PidfilePolicy, RlimVal, RlimitRes, RlimitRule, SvcKind};
use crate::error::SpawnError;
use crate::logging;
use crate::runtime::Paths;
use crate::service::Service;

/// Logical exit status of a reaped child; signal deaths are folded into
/// 128+signo so callers always see nonzero for abnormal termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// Process id.
    pub pid: i32,
    /// Logical exit code.
    pub code: i32,
}

/// Everything the child setup needs besides the record itself.
pub struct SpawnCtx<'a> {
    /// Resolved filesystem layout.
    pub paths: &'a Paths,
    /// Environment table accumulated from `KEY=VALUE` directives.
    pub env: &'a [(String, String)],
    /// Global log-rotation policy for file sinks.
    pub rotate: LogRotate,
}

/// Stdio redirection handed to the child.
enum Stdio {
    /// Connect a pre-opened descriptor to stdin/stdout/stderr.
    Fd(RawFd),
    /// Open the named path in the child.
    Path(&'static str),
}

/// Forks and execs the record's command. Returns the child pid.
pub fn spawn(svc: &Service, ctx: &SpawnCtx<'_>) -> Result<i32, SpawnError> {
    let argv = build_argv(svc)?;
    let envp = build_env(ctx.env, svc)?;
    let ids = resolve_ids(svc)?;

    // File sinks are opened before the fork so open/rotate errors surface
    // in the supervisor's own log.
    let sink = logging::open_sink(svc, ctx.rotate).map_err(|source| SpawnError::Start {
        service: svc.name().into(),
        source,
    })?;
    let stdio = match &sink {
        Some(file) => Stdio::Fd(file.as_raw_fd()),
        None => match svc.conf.log {
            crate::config::LogSink::Console => Stdio::Path("/dev/console"),
            _ => Stdio::Path("/dev/null"),
        },
    };

    let pid = do_fork(svc, &argv, &envp, ids, stdio)?;
    drop(sink);

    write_pidfile(svc, pid, ctx.paths);
    debug!("spawned {} as pid {pid}", svc.name());
    Ok(pid)
}

/// Forks an inetd child with `conn_fd` as its stdio. Used for both `nowait`
/// connection children and `wait`-mode listener handoff.
pub fn spawn_inetd(
    svc: &Service,
    ctx: &SpawnCtx<'_>,
    conn_fd: RawFd,
) -> Result<i32, SpawnError> {
    let argv = build_argv(svc)?;
    let envp = build_env(ctx.env, svc)?;
    let ids = resolve_ids(svc)?;
    do_fork(svc, &argv, &envp, ids, Stdio::Fd(conn_fd))
}

fn do_fork(
    svc: &Service,
    argv: &[CString],
    envp: &[CString],
    ids: Option<(Uid, Gid, CString)>,
    stdio: Stdio,
) -> Result<i32, SpawnError> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
        Ok(ForkResult::Child) => {
            // Only reached when setup or exec failed.
            let _ = child_setup(svc, argv, envp, ids, stdio);
            unsafe { libc::_exit(127) }
        }
        Err(errno) => Err(SpawnError::Start {
            service: svc.name().into(),
            source: io::Error::from_raw_os_error(errno as i32),
        }),
    }
}

/// Runs in the child between fork and exec. Every step that fails aborts
/// the exec; the parent sees exit 127.
fn child_setup(
    svc: &Service,
    argv: &[CString],
    envp: &[CString],
    ids: Option<(Uid, Gid, CString)>,
    stdio: Stdio,
) -> io::Result<()> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(io::Error::from)?;
    setsid().map_err(io::Error::from)?;
    chdir("/").map_err(io::Error::from)?;

    apply_rlimits(&svc.conf.rlimits)?;
    attach_cgroup(svc.conf.cgroup.as_deref());

    if let Some((uid, gid, user)) = ids {
        nix::unistd::setgid(gid).map_err(io::Error::from)?;
        // Supplementary groups are best-effort for single-group accounts.
        let _ = nix::unistd::initgroups(&user, gid);
        nix::unistd::setuid(uid).map_err(io::Error::from)?;
    }

    let fd = match stdio {
        Stdio::Fd(fd) => fd,
        Stdio::Path(path) => fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?
            .into_raw_fd(),
    };
    dup2(fd, 0).map_err(io::Error::from)?;
    dup2(fd, 1).map_err(io::Error::from)?;
    dup2(fd, 2).map_err(io::Error::from)?;

    execve(&argv[0], argv, envp).map_err(io::Error::from)?;
    Ok(())
}

/// Builds the exec argv. SysV scripts get a `start` argument; ttys exec the
/// external getty helper with the recorded terminal settings.
fn build_argv(svc: &Service) -> Result<Vec<CString>, SpawnError> {
    let mut words: Vec<String> = vec![svc.conf.cmd.display().to_string()];

    match svc.conf.kind {
        SvcKind::Sysv => words.push("start".into()),
        SvcKind::Tty => {
            if let Some(tty) = &svc.conf.tty {
                words.push("-L".into());
                words.push(tty.dev.display().to_string());
                words.push(tty.baud.unwrap_or(38400).to_string());
                if let Some(term) = &tty.term {
                    words.push(term.clone());
                }
            }
        }
        _ => words.extend(svc.conf.args.iter().cloned()),
    }

    words
        .into_iter()
        .map(|w| CString::new(w).map_err(|_| SpawnError::BadArgv(svc.name().into())))
        .collect()
}

/// Merges the baseline environment with `KEY=VALUE` directives.
fn build_env(
    table: &[(String, String)],
    svc: &Service,
) -> Result<Vec<CString>, SpawnError> {
    let mut pairs: Vec<(String, String)> = vec![
        ("PATH".into(), "/sbin:/usr/sbin:/bin:/usr/bin".into()),
        ("HOME".into(), "/".into()),
        ("SHELL".into(), "/bin/sh".into()),
    ];
    for (key, value) in table {
        pairs.retain(|(k, _)| k != key);
        pairs.push((key.clone(), value.clone()));
    }

    pairs
        .into_iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}"))
                .map_err(|_| SpawnError::BadArgv(svc.name().into()))
        })
        .collect()
}

/// Looks up the configured uid/gid pair before forking.
fn resolve_ids(svc: &Service) -> Result<Option<(Uid, Gid, CString)>, SpawnError> {
    let Some(username) = &svc.conf.user else {
        return Ok(None);
    };

    let wrap = |reason: String| SpawnError::Start {
        service: svc.name().into(),
        source: io::Error::new(io::ErrorKind::NotFound, reason),
    };

    let user = User::from_name(username)
        .map_err(|err| wrap(err.to_string()))?
        .ok_or_else(|| wrap(format!("unknown user '{username}'")))?;

    let gid = match &svc.conf.group {
        Some(group_name) => nix::unistd::Group::from_name(group_name)
            .map_err(|err| wrap(err.to_string()))?
            .ok_or_else(|| wrap(format!("unknown group '{group_name}'")))?
            .gid,
        None => user.gid,
    };

    let cname = CString::new(username.as_str())
        .map_err(|_| SpawnError::BadArgv(svc.name().into()))?;
    Ok(Some((user.uid, gid, cname)))
}

fn apply_rlimits(rules: &[RlimitRule]) -> io::Result<()> {
    for rule in rules {
        let resource = map_resource(rule.res);
        let (cur_soft, cur_hard) = getrlimit(resource).map_err(io::Error::from)?;
        let soft = match rule.soft {
            RlimVal::Keep => cur_soft,
            RlimVal::Infinity => nix::sys::resource::RLIM_INFINITY,
            RlimVal::Limit(v) => v,
        };
        let hard = match rule.hard {
            RlimVal::Keep => cur_hard,
            RlimVal::Infinity => nix::sys::resource::RLIM_INFINITY,
            RlimVal::Limit(v) => v,
        };
        setrlimit(resource, soft, hard).map_err(io::Error::from)?;
    }
    Ok(())
}

fn map_resource(res: RlimitRes) -> Resource {
    match res {
        RlimitRes::As => Resource::RLIMIT_AS,
        RlimitRes::Core => Resource::RLIMIT_CORE,
        RlimitRes::Cpu => Resource::RLIMIT_CPU,
        RlimitRes::Data => Resource::RLIMIT_DATA,
        RlimitRes::Fsize => Resource::RLIMIT_FSIZE,
        RlimitRes::Locks => Resource::RLIMIT_LOCKS,
        RlimitRes::Memlock => Resource::RLIMIT_MEMLOCK,
        RlimitRes::Msgqueue => Resource::RLIMIT_MSGQUEUE,
        RlimitRes::Nice => Resource::RLIMIT_NICE,
        RlimitRes::Nofile => Resource::RLIMIT_NOFILE,
        RlimitRes::Nproc => Resource::RLIMIT_NPROC,
        RlimitRes::Rss => Resource::RLIMIT_RSS,
        RlimitRes::Rtprio => Resource::RLIMIT_RTPRIO,
        RlimitRes::Rttime => Resource::RLIMIT_RTTIME,
        RlimitRes::Sigpending => Resource::RLIMIT_SIGPENDING,
        RlimitRes::Stack => Resource::RLIMIT_STACK,
    }
}

/// Joins the configured cgroup by writing our pid to its procs file. The
/// controller properties themselves belong to the cgroup collaborator.
fn attach_cgroup(group: Option<&str>) {
    let Some(group) = group else { return };
    let procs = format!("/sys/fs/cgroup/{group}/cgroup.procs");
    let _ = fs::write(procs, std::process::id().to_string());
}

/// Writes the pidfile for records under the implicit or explicit policy.
/// Foreign pidfiles belong to the daemon itself.
pub fn write_pidfile(svc: &Service, pid: i32, paths: &Paths) {
    if matches!(svc.conf.pidfile, PidfilePolicy::Foreign(_)) {
        return;
    }
    let path = svc.pidfile_path(paths);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(err) = fs::write(&path, format!("{pid}\n")) {
        warn!("failed to write pidfile {}: {err}", path.display());
    }
}

/// Removes a supervisor-managed pidfile once the record halts.
pub fn remove_pidfile(svc: &Service, paths: &Paths) {
    if matches!(svc.conf.pidfile, PidfilePolicy::Foreign(_)) {
        return;
    }
    let _ = fs::remove_file(svc.pidfile_path(paths));
}

/// Parses the pid out of a daemon-written pidfile.
pub fn read_foreign_pidfile(path: &Path) -> Result<i32, SpawnError> {
    let text = fs::read_to_string(path).map_err(|err| SpawnError::Pidfile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| SpawnError::Pidfile {
            path: path.to_path_buf(),
            reason: format!("not a pid: {:?}", text.trim()),
        })?;
    if pid <= 0 {
        return Err(SpawnError::Pidfile {
            path: path.to_path_buf(),
            reason: "non-positive pid".into(),
        });
    }
    Ok(pid)
}

/// Forks, execs, and waits for a helper command (network bringup, runparts
/// entries, the shutdown hook). Blocking by design; only called outside the
/// event loop. Returns the logical exit code.
pub fn run_blocking(cmd: &Path, args: &[String]) -> Result<i32, SpawnError> {
    let label = cmd.display().to_string();
    let mut words = vec![label.clone()];
    words.extend(args.iter().cloned());
    let argv: Vec<CString> = words
        .into_iter()
        .map(|w| CString::new(w).map_err(|_| SpawnError::BadArgv(label.clone())))
        .collect::<Result<_, _>>()?;
    let envp = [CString::new("PATH=/sbin:/usr/sbin:/bin:/usr/bin")
        .map_err(|_| SpawnError::BadArgv(label.clone()))?];

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(128 + signal as i32);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(SpawnError::Start {
                        service: label,
                        source: io::Error::from_raw_os_error(errno as i32),
                    });
                }
            }
        },
        Ok(ForkResult::Child) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
            let _ = execve(&argv[0], &argv, &envp);
            unsafe { libc::_exit(127) }
        }
        Err(errno) => Err(SpawnError::Start {
            service: label,
            source: io::Error::from_raw_os_error(errno as i32),
        }),
    }
}

/// Reaps every exited child without blocking.
pub fn reap() -> Vec<Exit> {
    let mut exits = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => exits.push(Exit {
                pid: pid.as_raw(),
                code,
            }),
            Ok(WaitStatus::Signaled(pid, signal, _)) => exits.push(Exit {
                pid: pid.as_raw(),
                code: 128 + signal as i32,
            }),
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!("waitpid failed: {err}");
                break;
            }
        }
    }
    exits
}

/// Delivers a signal to a service process.
pub fn deliver(pid: i32, signo: i32, service: &str) -> Result<(), SpawnError> {
    let signal = Signal::try_from(signo).map_err(|source| SpawnError::Signal {
        service: service.into(),
        source,
    })?;
    kill(Pid::from_raw(pid), signal).map_err(|source| SpawnError::Signal {
        service: service.into(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogSink, SvcConf};
    use crate::registry::SvcKey;
    use crate::runlevel::LevelMask;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn service(kind: SvcKind, cmd: &str, args: &[&str]) -> Service {
        let conf = SvcConf {
            kind,
            name: "t".into(),
            instance: String::new(),
            cmd: PathBuf::from(cmd),
            args: args.iter().map(|s| s.to_string()).collect(),
            levels: LevelMask::default_runlevels(),
            conds: Vec::new(),
            nohup: false,
            pidfile: PidfilePolicy::Implicit,
            stop_signal: libc::SIGTERM,
            manual: false,
            log: LogSink::Null,
            user: None,
            group: None,
            rlimits: Vec::new(),
            cgroup: None,
            desc: String::new(),
            origin: PathBuf::from("/etc/finix.conf"),
            inetd: None,
            tty: None,
        };
        Service::new(SvcKey::new(1, ""), conf)
    }

    #[test]
    fn sysv_argv_gets_start() {
        let svc = service(SvcKind::Sysv, "/etc/init.d/net", &[]);
        let argv = build_argv(&svc).unwrap();
        assert_eq!(argv[1].to_str().unwrap(), "start");
    }

    #[test]
    fn env_table_overrides_baseline() {
        let svc = service(SvcKind::Service, "/bin/d", &[]);
        let env = build_env(&[("PATH".into(), "/opt/bin".into())], &svc).unwrap();
        let rendered: Vec<&str> = env.iter().map(|e| e.to_str().unwrap()).collect();
        assert!(rendered.contains(&"PATH=/opt/bin"));
        assert!(!rendered.iter().any(|e| e.starts_with("PATH=/sbin")));
    }

    #[test]
    fn foreign_pidfile_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert!(read_foreign_pidfile(&path).is_err());

        std::fs::write(&path, "4321\n").unwrap();
        assert_eq!(read_foreign_pidfile(&path).unwrap(), 4321);
    }

    #[test]
    fn spawn_and_reap_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        std::fs::create_dir_all(&paths.run_dir).unwrap();

        let svc = service(SvcKind::Task, "/bin/sh", &["-c", "exit 0"]);
        let ctx = SpawnCtx {
            paths: &paths,
            env: &[],
            rotate: LogRotate::default(),
        };

        let pid = spawn(&svc, &ctx).unwrap();
        assert!(pid > 0);
        assert!(svc.pidfile_path(&paths).exists());

        // Reap with a bounded wait; the child exits immediately.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut seen = None;
        while std::time::Instant::now() < deadline {
            if let Some(exit) = reap().into_iter().find(|e| e.pid == pid) {
                seen = Some(exit);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(seen, Some(Exit { pid, code: 0 }));
    }
}
