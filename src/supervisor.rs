//! The supervisor context and its event loop.
//!
//! One struct owns the registry, condition store, runlevel governor, timer
//! wheel, control socket, and the event loop descriptors; every mutation
//! happens on this thread. Handlers never block: they adjust record state,
//! enqueue follow-up steps, and return to the epoll wait.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{debug, error, info, warn};

use crate::api::{ApiServer, Command, ConnStatus, Frame, Snapshot};
use crate::conds::Conds;
use crate::config::{self, Conf, SvcKind};
use crate::error::SupervisorError;
use crate::event::{
    FIRST_DYNAMIC, Poller, TOK_INOTIFY, TOK_LISTENER, TOK_SIGNAL, TOK_TIMER, TimerKind,
    Timers,
};
use crate::inetd::{self, InetdSocket};
use crate::reconcile;
use crate::registry::{Registry, SvcKey};
use crate::runlevel::{self, Phase, Runlevel, Shutdown};
use crate::runtime::Paths;
use crate::service::{CrashDisposition, KILL_DEADLINE, SvcState};
use crate::spawn::{self, SpawnCtx};

/// Upper bound on worklist iterations per converge; generous multiple of
/// the record count plus condition-graph depth.
const STEP_BOUND_SLACK: usize = 64;

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Armed halt/reboot; the caller issues `reboot(2)` when PID 1.
    Shutdown(Shutdown),
    /// Plain exit (non-PID-1 mode).
    Quit,
}

#[derive(Clone, Copy)]
enum WatchClass {
    Config,
    RunDir,
}

enum DynSource {
    Conn,
    Inetd(SvcKey),
}

/// The supervisor: all state, one thread.
pub struct Supervisor {
    paths: Paths,
    pid1: bool,
    conf: Conf,
    registry: Registry,
    conds: Conds,
    runlevel: Runlevel,
    timers: Timers,
    poller: Poller,
    signals: SignalFd,
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, WatchClass>,
    api: ApiServer,
    sources: HashMap<u64, DynSource>,
    inetd_socks: HashMap<SvcKey, (InetdSocket, u64)>,
    inetd_children: HashMap<i32, SvcKey>,
    next_token: u64,
    pending: VecDeque<SvcKey>,
    run_queue: VecDeque<SvcKey>,
    conf_dirty: bool,
    quitting: bool,
    debug: bool,
    debug_hook: Option<Box<dyn Fn(bool)>>,
    wdog_pid: i32,
    exit: Option<ExitAction>,
}

impl Supervisor {
    /// Builds the context: blocks the signal set, creates the event-loop
    /// descriptors, and binds the control socket. Failures here are the
    /// fatal class; the caller escalates to the rescue path.
    pub fn new(paths: Paths, pid1: bool) -> Result<Self, SupervisorError> {
        let mut mask = SigSet::empty();
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGPWR,
        ] {
            mask.add(sig);
        }
        mask.thread_block().map_err(|errno| SupervisorError::Fatal {
            subsystem: "signal mask",
            source: std::io::Error::from_raw_os_error(errno as i32),
        })?;

        let signals = SignalFd::with_flags(
            &mask,
            SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK,
        )
        .map_err(|errno| SupervisorError::Fatal {
            subsystem: "signalfd",
            source: std::io::Error::from_raw_os_error(errno as i32),
        })?;

        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
            .map_err(|errno| SupervisorError::Fatal {
                subsystem: "inotify",
                source: std::io::Error::from_raw_os_error(errno as i32),
            })?;

        fs::create_dir_all(&paths.run_dir)?;
        let api = ApiServer::bind(&paths.control_socket()).map_err(|source| {
            SupervisorError::Fatal {
                subsystem: "control socket",
                source,
            }
        })?;

        let conds = Conds::new(paths.cond_dir())?;
        let poller = Poller::new()?;
        let timers = Timers::new()?;

        poller.add(signals.as_fd().as_raw_fd(), TOK_SIGNAL)?;
        poller.add(inotify.as_fd().as_raw_fd(), TOK_INOTIFY)?;
        poller.add(timers.fd(), TOK_TIMER)?;
        poller.add(api.listener_fd(), TOK_LISTENER)?;

        let mut sup = Self {
            paths,
            pid1,
            conf: Conf::default(),
            registry: Registry::new(),
            conds,
            runlevel: Runlevel::new(),
            timers,
            poller,
            signals,
            inotify,
            watches: HashMap::new(),
            api,
            sources: HashMap::new(),
            inetd_socks: HashMap::new(),
            inetd_children: HashMap::new(),
            next_token: FIRST_DYNAMIC,
            pending: VecDeque::new(),
            run_queue: VecDeque::new(),
            conf_dirty: false,
            quitting: false,
            debug: false,
            debug_hook: None,
            wdog_pid: 0,
            exit: None,
        };
        sup.add_watches();
        Ok(sup)
    }

    /// Installs a hook invoked when the debug command toggles verbosity.
    pub fn set_debug_hook(&mut self, hook: Box<dyn Fn(bool)>) {
        self.debug_hook = Some(hook);
    }

    /// Current runlevel, for status output and tests.
    pub fn runlevel(&self) -> u8 {
        self.runlevel.current()
    }

    /// Read access to the registry for tests and status rendering.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Read access to the condition store.
    pub fn conds(&self) -> &Conds {
        &self.conds
    }

    fn add_watches(&mut self) {
        let conf_flags = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_MOVED_FROM;
        let pid_flags = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_DELETE;

        let mut conf_targets = vec![self.paths.conf_dir.clone(), self.paths.enabled_dir()];
        if let Some(parent) = self.paths.conf.parent() {
            conf_targets.push(parent.to_path_buf());
        }
        for target in conf_targets {
            match self.inotify.add_watch(&target, conf_flags) {
                Ok(wd) => {
                    self.watches.insert(wd, WatchClass::Config);
                }
                Err(err) => debug!("no config watch on {}: {err}", target.display()),
            }
        }

        match self.inotify.add_watch(&self.paths.run_dir, pid_flags) {
            Ok(wd) => {
                self.watches.insert(wd, WatchClass::RunDir);
            }
            Err(err) => warn!(
                "no pidfile watch on {}: {err}",
                self.paths.run_dir.display()
            ),
        }
    }

    /// First boot: parse everything, apply bootstrap-only globals, run the
    /// level-0 records, then head for the configured target level.
    pub fn bootstrap(&mut self, target_override: Option<u8>) -> Result<(), SupervisorError> {
        self.conf = config::load(&self.paths)?;
        let parsed = self.conf.clone();

        reconcile::mark(&mut self.registry);
        let report = reconcile::sweep(&mut self.registry, &parsed);
        for key in &report.added {
            self.subscribe_record(key);
            if let Some(svc) = self.registry.get_mut(key) {
                svc.changed = false;
            }
        }

        self.apply_bootstrap_globals();

        // Records with level 0 in their mask run during bootstrap. The
        // run sequence must terminate before bootstrap advances.
        self.rebuild_run_queue(runlevel::BOOTSTRAP);
        self.step_all();
        self.drain_pending();
        self.drain_run_sequence();

        if let Some(dir) = self.conf.globals.runparts.clone() {
            self.run_parts(&dir);
        }

        let target = target_override
            .or(self.conf.globals.target_level)
            .unwrap_or(runlevel::DEFAULT_TARGET);
        info!("bootstrap complete, entering runlevel {target}");
        self.request_runlevel(target);
        Ok(())
    }

    fn apply_bootstrap_globals(&mut self) {
        if let Some(hostname) = &self.conf.globals.hostname
            && !PathBuf::from("/etc/hostname").exists()
        {
            if let Err(err) = nix::unistd::sethostname(hostname) {
                warn!("cannot set hostname '{hostname}': {err}");
            }
        }

        for module in &self.conf.globals.modules {
            // Module loading belongs to the kernel-module collaborator.
            debug!("module '{module}' left to the module loader");
        }

        if let Some(script) = self.conf.globals.network.clone() {
            match spawn::run_blocking(&script, &[]) {
                Ok(0) => info!("network bringup {} done", script.display()),
                Ok(code) => warn!("network bringup {} exited {code}", script.display()),
                Err(err) => warn!("network bringup failed: {err}"),
            }
        }
    }

    fn run_parts(&mut self, dir: &std::path::Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            debug!("runparts directory {} missing", dir.display());
            return;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            match spawn::run_blocking(&path, &[]) {
                Ok(0) => debug!("runparts {} ok", path.display()),
                Ok(code) => warn!("runparts {} exited {code}", path.display()),
                Err(err) => warn!("runparts {} failed: {err}", path.display()),
            }
        }
    }

    /// Blocks until the bootstrap run sequence has terminated, bounded by
    /// the transition grace. The event loop is not running yet, so exits
    /// are reaped inline.
    fn drain_run_sequence(&mut self) {
        let deadline = std::time::Instant::now()
            + Duration::from_secs(runlevel::TRANSITION_GRACE_SECS);
        while self.run_sequence_active() || !self.run_queue.is_empty() {
            if std::time::Instant::now() >= deadline {
                warn!("run sequence still busy after grace; proceeding");
                break;
            }
            self.handle_exits();
            self.drain_pending();
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// The event loop. Returns once a shutdown is armed and the registry has
    /// drained (or, outside PID 1, when asked to quit).
    pub fn run(&mut self) -> Result<ExitAction, SupervisorError> {
        info!("finix supervising {} records", self.registry.len());

        loop {
            if let Some(action) = self.exit {
                return Ok(action);
            }

            let events = self.poller.wait(64)?;
            let fired: Vec<u64> = events.iter().map(|(tok, _, _)| *tok).collect();
            let writable: Vec<u64> = events
                .iter()
                .filter(|(_, _, w)| *w)
                .map(|(tok, _, _)| *tok)
                .collect();

            // Dispatch order within one wakeup: reap children, apply
            // inotify, serve the control API, then fire timers.
            if fired.contains(&TOK_SIGNAL) {
                self.process_signals();
            }
            self.drain_pending();

            if fired.contains(&TOK_INOTIFY) {
                self.process_inotify();
            }
            self.drain_pending();

            if fired.contains(&TOK_LISTENER) {
                self.accept_conns();
            }
            for token in &fired {
                if *token >= FIRST_DYNAMIC {
                    self.handle_dynamic_readable(*token);
                }
            }
            for token in writable {
                if token >= FIRST_DYNAMIC {
                    self.flush_conn(token);
                }
            }
            self.drain_pending();

            if fired.contains(&TOK_TIMER) {
                self.timers.drain_fd();
                for kind in self.timers.drain_due() {
                    self.handle_timer(kind);
                }
            }
            self.drain_pending();

            self.check_transition();
        }
    }

    /// Reaps exited children and applies the results. The loop calls this
    /// on SIGCHLD; tests call it directly after waiting out a child.
    pub fn reap_now(&mut self) {
        self.handle_exits();
        self.drain_pending();
        self.check_transition();
    }

    /// Fires every due deadline, as the loop's timer phase would.
    pub fn fire_timers(&mut self) {
        for kind in self.timers.drain_due() {
            self.handle_timer(kind);
        }
        self.drain_pending();
        self.check_transition();
    }

    /// Applies a control frame as if it had arrived on the socket and
    /// returns the reply frames.
    pub fn apply_request(&mut self, frame: &Frame) -> Vec<Frame> {
        let replies = self.handle_request(frame);
        self.drain_pending();
        self.check_transition();
        replies
    }

    /// Applies pending pidfile and config inotify events.
    pub fn poll_files(&mut self) {
        self.process_inotify();
        self.drain_pending();
    }

    fn process_signals(&mut self) {
        let mut reaped = false;
        let mut actions: Vec<Signal> = Vec::new();

        while let Ok(Some(info)) = self.signals.read_signal() {
            match Signal::try_from(info.ssi_signo as i32) {
                Ok(Signal::SIGCHLD) => reaped = true,
                Ok(sig) => actions.push(sig),
                Err(_) => {}
            }
        }

        // Children first: a reap may unblock everything else.
        if reaped {
            self.handle_exits();
        }

        for sig in actions {
            match sig {
                Signal::SIGHUP => {
                    info!("SIGHUP: reloading configuration");
                    if let Err(err) = self.reload() {
                        error!("reload failed: {err}");
                    }
                }
                Signal::SIGTERM | Signal::SIGINT => {
                    if self.pid1 {
                        self.request_runlevel(6);
                    } else {
                        info!("{sig:?}: stopping all services");
                        self.quit();
                    }
                }
                Signal::SIGUSR1 | Signal::SIGUSR2 | Signal::SIGPWR => {
                    self.request_runlevel(0);
                }
                _ => {}
            }
        }
    }

    /// Stops everything and leaves the loop; non-PID-1 shutdown.
    fn quit(&mut self) {
        self.quitting = true;
        for key in self.registry.keys() {
            if let Some(svc) = self.registry.get_mut(&key) {
                svc.enabled = false;
            }
            self.begin_stop(&key);
        }
        self.drain_pending();
        self.exit_when_drained();
    }

    fn exit_when_drained(&mut self) {
        if !self.any_alive() && self.exit.is_none() {
            self.exit = Some(if self.pid1 {
                match self.runlevel.shutdown() {
                    Some(action) => ExitAction::Shutdown(action),
                    None => ExitAction::Quit,
                }
            } else {
                ExitAction::Quit
            });
        }
    }

    fn any_alive(&self) -> bool {
        self.registry.iter().any(|(_, svc)| svc.alive())
            || !self.inetd_children.is_empty()
    }

    // ---- child exits -----------------------------------------------------

    fn handle_exits(&mut self) {
        for exit in spawn::reap() {
            self.handle_exit(exit.pid, exit.code);
        }
    }

    fn handle_exit(&mut self, pid: i32, code: i32) {
        if pid == self.wdog_pid {
            warn!("watchdog process {pid} exited {code}");
            self.wdog_pid = 0;
            return;
        }

        if let Some(key) = self.inetd_children.remove(&pid) {
            if let Some(svc) = self.registry.get_mut(&key) {
                svc.conns = svc.conns.saturating_sub(1);
                let rearm = svc
                    .conf
                    .inetd
                    .as_ref()
                    .is_some_and(|conf| conf.wait)
                    && svc.state == SvcState::Running;
                if rearm {
                    // wait-mode child released the listener; watch it again.
                    if let Some((sock, token)) = self.inetd_socks.get(&key) {
                        let _ = self.poller.add(sock.raw_fd(), *token);
                    }
                }
            }
            return;
        }

        let Some(key) = self.registry.by_pid(pid) else {
            debug!("reaped stray pid {pid} (exit {code})");
            return;
        };
        self.registry.unmap_pid(pid);

        let (state, kind, forking, starting) = {
            let Some(svc) = self.registry.get_mut(&key) else {
                return;
            };
            svc.pid = 0;
            (svc.state, svc.conf.kind, svc.forking(), svc.starting)
        };

        match state {
            SvcState::Stopping => {
                self.to_halted(&key);
            }
            SvcState::Running if kind.oneshot() && code == 0 => {
                if let Some(svc) = self.registry.get_mut(&key) {
                    svc.done = true;
                }
                self.to_halted(&key);
            }
            SvcState::Running if forking && starting && code == 0 => {
                // The daemon parent exited after forking; adoption happens
                // when the pidfile shows up.
                debug!("{key} daemonized, waiting for pidfile");
            }
            SvcState::Running => {
                self.handle_crash(&key, code);
            }
            other => {
                debug!("{key} exited {code} in state {other}");
                self.to_halted(&key);
            }
        }
    }

    fn handle_crash(&mut self, key: &SvcKey, code: i32) {
        let (name, fact, oneshot, is_run) = {
            let Some(svc) = self.registry.get_mut(key) else {
                return;
            };
            (
                svc.name().to_string(),
                svc.fact(),
                svc.conf.kind.oneshot(),
                svc.conf.kind == SvcKind::Run,
            )
        };
        self.clear_fact(&fact);

        if oneshot {
            // Failed tasks stay visibly crashed; nothing restarts them until
            // the next level entry, reload, or explicit start.
            if let Some(svc) = self.registry.get_mut(key) {
                svc.state = SvcState::Crashed;
                svc.done = true;
            }
            warn!("{name} exited {code}");
            // A failed run still terminates its slot in the serial sequence.
            if is_run && self.run_queue.front() == Some(key) {
                self.run_queue.pop_front();
                if let Some(next) = self.run_queue.front().cloned() {
                    self.schedule(next);
                }
            }
            return;
        }

        let disposition = {
            let Some(svc) = self.registry.get_mut(key) else {
                return;
            };
            svc.note_crash(std::time::Instant::now())
        };

        match disposition {
            CrashDisposition::Backoff(delay) => {
                if let Some(svc) = self.registry.get_mut(key) {
                    svc.state = SvcState::Crashed;
                }
                warn!("{name} crashed (exit {code}); restarting in {delay:?}");
                self.timers.arm(TimerKind::Backoff(key.clone()), delay);
            }
            CrashDisposition::Storm => {
                if let Some(svc) = self.registry.get_mut(key) {
                    svc.state = SvcState::Blocked;
                }
                error!(
                    "{name} crashed {} times within the restart window; \
                     blocked until started manually",
                    crate::service::RESTART_CAP
                );
            }
        }
    }

    // ---- inotify ---------------------------------------------------------

    fn process_inotify(&mut self) {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(err) => {
                warn!("inotify read failed: {err}");
                return;
            }
        };

        for event in events {
            let class = self.watches.get(&event.wd).copied();
            match class {
                Some(WatchClass::Config) => {
                    if !self.conf_dirty {
                        debug!("configuration changed on disk; reload pending");
                    }
                    self.conf_dirty = true;
                }
                Some(WatchClass::RunDir) => {
                    if let Some(name) = &event.name {
                        let name = name.to_string_lossy().into_owned();
                        if name.ends_with(".pid") {
                            let removed =
                                event.mask.contains(AddWatchFlags::IN_DELETE);
                            self.handle_pidfile_event(&name, removed);
                        }
                    }
                }
                None => {}
            }
        }
    }

    fn handle_pidfile_event(&mut self, basename: &str, removed: bool) {
        let Some(key) = self.registry.by_pidfile_basename(basename) else {
            return;
        };
        let (name, path, forking, starting, state) = {
            let Some(svc) = self.registry.get(&key) else {
                return;
            };
            (
                svc.name().to_string(),
                svc.pidfile_path(&self.paths),
                svc.forking(),
                svc.starting,
                svc.state,
            )
        };

        let pid_fact = format!("pid/{name}");
        if removed {
            self.clear_fact(&pid_fact);
            return;
        }
        self.set_fact(&pid_fact);

        if forking && starting && state == SvcState::Running {
            match spawn::read_foreign_pidfile(&path) {
                Ok(pid) => {
                    let fact = {
                        let Some(svc) = self.registry.get_mut(&key) else {
                            return;
                        };
                        svc.pid = pid;
                        svc.starting = false;
                        svc.fact()
                    };
                    self.registry.map_pid(pid, key.clone());
                    info!("{name} ready with pid {pid}");
                    self.set_fact(&fact);
                }
                Err(err) => warn!("{name}: {err}"),
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Kill(key) => {
                let Some(svc) = self.registry.get_mut(&key) else {
                    return;
                };
                if svc.state != SvcState::Stopping || svc.pid == 0 {
                    return;
                }
                if !svc.kill_escalated {
                    svc.kill_escalated = true;
                    let pid = svc.pid;
                    let name = svc.name().to_string();
                    info!("{name} ignored its stop signal; sending SIGKILL");
                    let _ = spawn::deliver(pid, libc::SIGKILL, &name);
                    self.timers.arm(TimerKind::Kill(key), KILL_DEADLINE);
                } else {
                    // Second expiry without a reap; give up on the pid.
                    let pid = svc.pid;
                    warn!("{} unkillable (pid {pid}); abandoning", svc.name());
                    self.registry.unmap_pid(pid);
                    if let Some(svc) = self.registry.get_mut(&key) {
                        svc.pid = 0;
                    }
                    self.to_halted(&key);
                }
            }
            TimerKind::Backoff(key) => {
                let level = self.runlevel.current();
                let Some(svc) = self.registry.get_mut(&key) else {
                    return;
                };
                if svc.state == SvcState::Crashed && svc.eligible(level) {
                    svc.state = SvcState::Waiting;
                    self.schedule(key);
                }
            }
            TimerKind::Grace => {
                if self.runlevel.phase() == Phase::Draining {
                    warn!(
                        "runlevel {} transition grace expired; proceeding",
                        self.runlevel.target()
                    );
                    self.finish_transition();
                } else if self.runlevel.shutdown().is_some() || self.quitting {
                    // Final grace: leave with whatever is still alive.
                    warn!("shutdown grace expired with processes remaining");
                    self.exit = Some(if self.pid1 {
                        match self.runlevel.shutdown() {
                            Some(action) => ExitAction::Shutdown(action),
                            None => ExitAction::Quit,
                        }
                    } else {
                        ExitAction::Quit
                    });
                }
            }
        }
    }

    // ---- control API -----------------------------------------------------

    fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn accept_conns(&mut self) {
        let mut counter = self.next_token;
        let accepted = self.api.accept(|| {
            let token = counter;
            counter += 1;
            token
        });
        self.next_token = counter;

        for (token, fd) in accepted {
            if self.poller.add(fd, token).is_ok() {
                self.sources.insert(token, DynSource::Conn);
            } else {
                self.api.close(token);
            }
        }
    }

    fn handle_dynamic_readable(&mut self, token: u64) {
        let inetd_key = match self.sources.get(&token) {
            Some(DynSource::Conn) => None,
            Some(DynSource::Inetd(key)) => Some(key.clone()),
            None => return,
        };
        match inetd_key {
            Some(key) => self.handle_inetd_ready(&key),
            None => self.handle_conn_readable(token),
        }
    }

    fn handle_conn_readable(&mut self, token: u64) {
        match self.api.read_request(token) {
            Ok(Some(frame)) => {
                debug!("control request {:?}", frame.cmd);
                let replies = self.handle_request(&frame);
                self.api.queue(token, &replies);
                self.flush_conn(token);
            }
            Ok(None) => {}
            Err(err) => {
                debug!("dropping control connection: {err}");
                self.close_conn(token);
            }
        }
    }

    fn flush_conn(&mut self, token: u64) {
        match self.api.flush(token) {
            Ok(ConnStatus::Done) => self.close_conn(token),
            Ok(ConnStatus::NeedWrite) => {
                if let Some(fd) = self.api.conn_fd(token) {
                    let _ = self.poller.set_writable(fd, token, true);
                }
            }
            Err(err) => {
                debug!("control write failed: {err}");
                self.close_conn(token);
            }
        }
    }

    fn close_conn(&mut self, token: u64) {
        if let Some(fd) = self.api.close(token) {
            let _ = self.poller.delete(fd);
        }
        self.sources.remove(&token);
    }

    fn handle_request(&mut self, frame: &Frame) -> Vec<Frame> {
        let ack = || vec![Frame::new(Command::Ack)];
        let nack = || vec![Frame::new(Command::Nack)];

        match frame.cmd {
            Command::Runlevel => {
                let level = runlevel::normalize(frame.runlevel);
                if level > 9 {
                    return nack();
                }
                self.request_runlevel(level);
                ack()
            }
            Command::Debug => {
                self.debug = !self.debug;
                info!("debug logging {}", if self.debug { "on" } else { "off" });
                if let Some(hook) = &self.debug_hook {
                    hook(self.debug);
                }
                ack()
            }
            Command::Reload => match self.reload() {
                Ok(()) => ack(),
                Err(err) => {
                    error!("reload failed: {err}");
                    nack()
                }
            },
            Command::Event => {
                let text = frame.text().to_string();
                match text.split_at_checked(1) {
                    Some(("+", cond)) if !cond.is_empty() => {
                        self.set_fact(cond);
                        ack()
                    }
                    Some(("-", cond)) if !cond.is_empty() => {
                        self.clear_fact(cond);
                        ack()
                    }
                    _ => nack(),
                }
            }
            Command::Start => {
                let keys = self.registry.select(frame.text());
                if keys.is_empty() {
                    return nack();
                }
                for key in keys {
                    self.operator_start(&key);
                }
                ack()
            }
            Command::Stop => {
                let keys = self.registry.select(frame.text());
                if keys.is_empty() {
                    return nack();
                }
                if keys.iter().any(|key| {
                    self.registry.get(key).is_some_and(|svc| svc.protected)
                }) {
                    return nack();
                }
                for key in keys {
                    self.operator_stop(&key);
                }
                ack()
            }
            Command::Restart => {
                let keys = self.registry.select(frame.text());
                if keys.is_empty() {
                    return nack();
                }
                for key in keys {
                    self.operator_restart(&key);
                }
                ack()
            }
            Command::Query => {
                let keys = self.registry.select(frame.text());
                let Some(key) = keys.first() else {
                    return nack();
                };
                let Some(svc) = self.registry.get(key) else {
                    return nack();
                };
                let missing: Vec<String> = svc
                    .conf
                    .conds
                    .iter()
                    .filter(|cond| {
                        self.conds.get(cond) != crate::conds::CondState::On
                    })
                    .cloned()
                    .collect();
                vec![
                    Frame::with_text(Command::Query, &missing.join(",")),
                    Frame::new(Command::Ack),
                ]
            }
            Command::Enumerate => {
                let mut frames: Vec<Frame> = self
                    .registry
                    .keys()
                    .iter()
                    .filter_map(|key| self.snapshot(key))
                    .map(|snap| Frame::with_text(Command::Enumerate, &snap.to_text()))
                    .collect();
                frames.push(Frame::new(Command::Ack));
                frames
            }
            Command::Find => {
                let keys = self.registry.select(frame.text());
                let Some(snap) = keys.first().and_then(|key| self.snapshot(key)) else {
                    return nack();
                };
                vec![
                    Frame::with_text(Command::Find, &snap.to_text()),
                    Frame::new(Command::Ack),
                ]
            }
            Command::GetRunlevel => {
                let mut reply = Frame::with_text(
                    Command::GetRunlevel,
                    &format!("{} {}", self.runlevel.previous(), self.runlevel.current()),
                );
                reply.runlevel = self.runlevel.current();
                vec![reply, Frame::new(Command::Ack)]
            }
            Command::InetdQuery => {
                let keys = self.registry.select(frame.text());
                let Some(svc) = keys.first().and_then(|key| self.registry.get(key))
                else {
                    return nack();
                };
                if svc.conf.inetd.is_none() {
                    return nack();
                }
                vec![
                    Frame::with_text(
                        Command::InetdQuery,
                        &format!("connections={}", svc.conns),
                    ),
                    Frame::new(Command::Ack),
                ]
            }
            Command::WatchdogHello => match frame.text().parse::<i32>() {
                Ok(pid) if pid > 0 => {
                    info!("watchdog handover from pid {pid}");
                    self.wdog_pid = pid;
                    ack()
                }
                _ => nack(),
            },
            Command::Ack | Command::Nack => nack(),
        }
    }

    fn snapshot(&self, key: &SvcKey) -> Option<Snapshot> {
        let svc = self.registry.get(key)?;
        let mut command = svc.conf.cmd.display().to_string();
        for arg in &svc.conf.args {
            command.push(' ');
            command.push_str(arg);
        }
        Some(Snapshot {
            job: key.job,
            instance: key.instance.clone(),
            name: svc.name().to_string(),
            state: svc.state.to_string(),
            pid: svc.pid,
            levels: svc.conf.levels.to_string(),
            command,
            desc: svc.conf.desc.clone(),
        })
    }

    // ---- operator actions ------------------------------------------------

    fn operator_start(&mut self, key: &SvcKey) {
        if let Some(svc) = self.registry.get_mut(key) {
            svc.enabled = true;
            svc.done = false;
            if svc.state == SvcState::Blocked {
                svc.state = SvcState::Halted;
                svc.reset_restarts();
            }
            if svc.state == SvcState::Crashed {
                svc.state = SvcState::Halted;
            }
        }
        self.schedule(key.clone());
        self.drain_pending();
    }

    fn operator_stop(&mut self, key: &SvcKey) {
        if let Some(svc) = self.registry.get_mut(key) {
            svc.enabled = false;
        }
        self.begin_stop(key);
        self.drain_pending();
    }

    fn operator_restart(&mut self, key: &SvcKey) {
        let running = {
            let Some(svc) = self.registry.get_mut(key) else {
                return;
            };
            svc.done = false;
            svc.enabled = true;
            if matches!(svc.state, SvcState::Running | SvcState::Stopping) {
                svc.restarting = true;
                true
            } else {
                false
            }
        };
        if running {
            self.begin_stop(key);
        } else {
            self.operator_start(key);
        }
        self.drain_pending();
    }

    // ---- conditions ------------------------------------------------------

    fn set_fact(&mut self, cond: &str) {
        if self.conds.set(cond) {
            self.schedule_subscribers(cond);
        }
    }

    fn clear_fact(&mut self, cond: &str) {
        if self.conds.clear(cond) {
            self.schedule_subscribers(cond);
        }
    }

    fn schedule_subscribers(&mut self, cond: &str) {
        let subs: Vec<SvcKey> = self.conds.subscribers(cond).to_vec();
        for key in subs {
            self.schedule(key);
        }
    }

    fn subscribe_record(&mut self, key: &SvcKey) {
        self.conds.unsubscribe(key);
        let conds = self
            .registry
            .get(key)
            .map(|svc| svc.conf.conds.clone())
            .unwrap_or_default();
        for cond in conds {
            self.conds.subscribe(&cond, key.clone());
        }
    }

    // ---- state machine ---------------------------------------------------

    fn schedule(&mut self, key: SvcKey) {
        if !self.pending.contains(&key) {
            self.pending.push_back(key);
        }
    }

    fn drain_pending(&mut self) {
        let bound = (self.registry.len() + STEP_BOUND_SLACK)
            * (self.registry.len() + STEP_BOUND_SLACK);
        let mut steps = 0;
        while let Some(key) = self.pending.pop_front() {
            self.step(&key);
            steps += 1;
            if steps > bound {
                warn!("step worklist did not settle; breaking");
                self.pending.clear();
                break;
            }
        }
    }

    fn step_all(&mut self) {
        for key in self.registry.keys() {
            self.schedule(key);
        }
        self.drain_pending();
    }

    /// One transition attempt for one record; progress re-schedules the
    /// record until it settles, which bounds the whole pass.
    fn step(&mut self, key: &SvcKey) {
        let level = if self.runlevel.phase() == Phase::Draining {
            self.runlevel.target()
        } else {
            self.runlevel.current()
        };

        let (state, startable, eligible, conds_ok, any_off, is_run) = {
            let Some(svc) = self.registry.get(key) else {
                return;
            };
            (
                svc.state,
                svc.startable(level),
                svc.eligible(level),
                self.conds.all_on(&svc.conf.conds),
                self.conds.any_off(&svc.conf.conds),
                svc.conf.kind == SvcKind::Run,
            )
        };

        match state {
            SvcState::Halted => {
                if self.registry.get(key).is_some_and(|svc| svc.removal) {
                    self.remove_record(key);
                    return;
                }
                // A run that already ran (or was disarmed) must not wedge
                // the serial queue at its head.
                if is_run && !startable && self.run_queue.front() == Some(key) {
                    self.run_queue.pop_front();
                    if let Some(next) = self.run_queue.front().cloned() {
                        self.schedule(next);
                    }
                }
                // During a drain, nothing new starts until the level settles.
                if self.runlevel.phase() == Phase::Draining {
                    return;
                }
                if startable && (!is_run || self.run_gate(key)) {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.state = SvcState::Waiting;
                    }
                    self.schedule(key.clone());
                }
            }
            SvcState::Waiting => {
                if !eligible {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.state = SvcState::Halted;
                    }
                } else if conds_ok && self.runlevel.phase() != Phase::Draining {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.state = SvcState::Ready;
                    }
                    self.start_record(key);
                }
            }
            SvcState::Ready => {
                self.start_record(key);
            }
            SvcState::Running => {
                // An executing run rides out the drain; the governor only
                // reclaims it once the transition grace has expired.
                let run_finishing = is_run && self.runlevel.phase() == Phase::Draining;
                if (!eligible && !run_finishing) || any_off {
                    self.begin_stop(key);
                }
            }
            SvcState::Stopping => {}
            SvcState::Crashed => {
                if !eligible
                    && let Some(svc) = self.registry.get_mut(key)
                {
                    svc.state = SvcState::Halted;
                }
            }
            SvcState::Blocked => {}
            SvcState::Dead => {
                self.remove_record(key);
            }
        }
    }

    /// A `run` record may only start at the head of the serial queue.
    fn run_gate(&mut self, key: &SvcKey) -> bool {
        match self.run_queue.front() {
            Some(front) => front == key,
            None => true,
        }
    }

    fn start_record(&mut self, key: &SvcKey) {
        let kind = match self.registry.get(key) {
            Some(svc) => svc.conf.kind,
            None => return,
        };

        if kind == SvcKind::Inetd {
            self.start_inetd(key);
            return;
        }

        let spawn_result = {
            let Some(svc) = self.registry.get(key) else {
                return;
            };
            let ctx = SpawnCtx {
                paths: &self.paths,
                env: &self.conf.env,
                rotate: self.conf.globals.rotate,
            };
            spawn::spawn(svc, &ctx)
        };

        match spawn_result {
            Ok(pid) => {
                let (fact, forking, name) = {
                    let Some(svc) = self.registry.get_mut(key) else {
                        return;
                    };
                    svc.state = SvcState::Running;
                    svc.pid = pid;
                    svc.starting = true;
                    svc.kill_escalated = false;
                    svc.changed = false;
                    (svc.fact(), svc.forking(), svc.name().to_string())
                };
                self.registry.map_pid(pid, key.clone());
                info!("starting {name} (pid {pid})");

                if !forking {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.starting = false;
                    }
                    self.set_fact(&fact);
                }
            }
            Err(err) => {
                error!("{err}");
                self.handle_crash(key, 127);
            }
        }
    }

    fn start_inetd(&mut self, key: &SvcKey) {
        let conf = {
            let Some(svc) = self.registry.get(key) else {
                return;
            };
            match &svc.conf.inetd {
                Some(conf) => conf.clone(),
                None => return,
            }
        };

        match inetd::open_socket(&conf) {
            Ok(sock) => {
                let token = self.next_token();
                if let Err(err) = self.poller.add(sock.raw_fd(), token) {
                    warn!("cannot watch inetd socket: {err}");
                    return;
                }
                self.sources.insert(token, DynSource::Inetd(key.clone()));
                self.inetd_socks.insert(key.clone(), (sock, token));

                let fact = {
                    let Some(svc) = self.registry.get_mut(key) else {
                        return;
                    };
                    svc.state = SvcState::Running;
                    svc.starting = false;
                    info!("inetd {} listening", svc.name());
                    svc.fact()
                };
                self.set_fact(&fact);
            }
            Err(err) => {
                warn!("inetd {key} cannot bind: {err}");
                self.handle_crash(key, 1);
            }
        }
    }

    fn handle_inetd_ready(&mut self, key: &SvcKey) {
        let Some(svc) = self.registry.get(key) else {
            return;
        };
        let Some(conf) = svc.conf.inetd.clone() else {
            return;
        };
        if svc.state != SvcState::Running {
            return;
        }

        let Some((sock, token)) = self.inetd_socks.get(key) else {
            return;
        };
        let token = *token;

        match sock {
            InetdSocket::Udp(socket) => {
                if conf.internal {
                    inetd::serve_builtin_dgram(&conf.svc, socket);
                    return;
                }
                // External UDP handlers take the socket itself, wait-style.
                let fd = socket.as_raw_fd();
                let _ = self.poller.delete(fd);
                let ctx = SpawnCtx {
                    paths: &self.paths,
                    env: &self.conf.env,
                    rotate: self.conf.globals.rotate,
                };
                match spawn::spawn_inetd(svc, &ctx, fd) {
                    Ok(pid) => {
                        self.inetd_children.insert(pid, key.clone());
                        if let Some(svc) = self.registry.get_mut(key) {
                            svc.conns += 1;
                        }
                    }
                    Err(err) => warn!("inetd spawn failed: {err}"),
                }
            }
            InetdSocket::Tcp(listener) => {
                let accepted = match listener.accept() {
                    Ok(pair) => pair,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        debug!("inetd accept failed: {err}");
                        return;
                    }
                };
                let (stream, _) = accepted;

                let local = stream.local_addr().ok();
                if let Some(local) = local
                    && !inetd::accept_allowed(&conf.filters, &local)
                {
                    debug!("inetd {} refused connection by filter", conf.svc);
                    return;
                }

                if conf.internal {
                    let _ = stream.set_nonblocking(false);
                    inetd::serve_builtin_stream(&conf.svc, stream);
                    return;
                }

                let ctx = SpawnCtx {
                    paths: &self.paths,
                    env: &self.conf.env,
                    rotate: self.conf.globals.rotate,
                };
                if conf.wait {
                    // Hand the listener to the child and stop watching it
                    // until that child exits.
                    drop(stream);
                    let fd = listener.as_raw_fd();
                    let _ = self.poller.delete(fd);
                    match spawn::spawn_inetd(svc, &ctx, fd) {
                        Ok(pid) => {
                            self.inetd_children.insert(pid, key.clone());
                            if let Some(svc) = self.registry.get_mut(key) {
                                svc.conns += 1;
                            }
                        }
                        Err(err) => {
                            warn!("inetd spawn failed: {err}");
                            let _ = self.poller.add(fd, token);
                        }
                    }
                } else {
                    let _ = stream.set_nonblocking(false);
                    match spawn::spawn_inetd(svc, &ctx, stream.as_raw_fd()) {
                        Ok(pid) => {
                            self.inetd_children.insert(pid, key.clone());
                            if let Some(svc) = self.registry.get_mut(key) {
                                svc.conns += 1;
                            }
                        }
                        Err(err) => warn!("inetd spawn failed: {err}"),
                    }
                }
            }
        }
    }

    fn stop_inetd(&mut self, key: &SvcKey) {
        if let Some((sock, token)) = self.inetd_socks.remove(key) {
            let _ = self.poller.delete(sock.raw_fd());
            self.sources.remove(&token);
        }
    }

    fn begin_stop(&mut self, key: &SvcKey) {
        let (state, kind, pid, signal, name) = {
            let Some(svc) = self.registry.get(key) else {
                return;
            };
            (
                svc.state,
                svc.conf.kind,
                svc.pid,
                svc.conf.stop_signal,
                svc.name().to_string(),
            )
        };

        match state {
            SvcState::Waiting | SvcState::Ready => {
                if let Some(svc) = self.registry.get_mut(key) {
                    svc.state = SvcState::Halted;
                }
                self.schedule(key.clone());
            }
            SvcState::Crashed | SvcState::Blocked => {
                if let Some(svc) = self.registry.get_mut(key) {
                    svc.state = SvcState::Halted;
                }
                self.schedule(key.clone());
            }
            SvcState::Running if kind == SvcKind::Inetd => {
                self.stop_inetd(key);
                self.to_halted(key);
            }
            SvcState::Running if pid > 0 => {
                info!("stopping {name} (pid {pid})");
                if let Some(svc) = self.registry.get_mut(key) {
                    svc.state = SvcState::Stopping;
                    svc.kill_escalated = false;
                }
                if let Err(err) = spawn::deliver(pid, signal, &name) {
                    warn!("{err}");
                }
                self.timers.arm(TimerKind::Kill(key.clone()), KILL_DEADLINE);
            }
            SvcState::Running => {
                // No pid to signal (forking service that never wrote its
                // pidfile); fold straight to HALTED.
                self.to_halted(key);
            }
            _ => {}
        }
    }

    /// The single funnel for reaching HALTED: clears facts and pidfiles,
    /// advances the run queue, finishes removals, and triggers restarts.
    fn to_halted(&mut self, key: &SvcKey) {
        let stale_pid = self.registry.get(key).map(|svc| svc.pid).unwrap_or(0);
        if stale_pid > 0 {
            self.registry.unmap_pid(stale_pid);
        }

        let (fact, name, is_run, removal, restarting, changed) = {
            let Some(svc) = self.registry.get_mut(key) else {
                return;
            };
            svc.pid = 0;
            svc.starting = false;
            svc.kill_escalated = false;
            svc.state = if svc.removal {
                SvcState::Dead
            } else {
                SvcState::Halted
            };
            (
                svc.fact(),
                svc.name().to_string(),
                svc.conf.kind == SvcKind::Run,
                svc.removal,
                std::mem::take(&mut svc.restarting),
                svc.changed,
            )
        };

        self.clear_fact(&fact);
        let pid_fact = format!("pid/{name}");
        self.clear_fact(&pid_fact);
        if let Some(svc) = self.registry.get(key) {
            spawn::remove_pidfile(svc, &self.paths);
        }

        debug!("{name} halted");

        if is_run && self.run_queue.front() == Some(key) {
            self.run_queue.pop_front();
            if let Some(next) = self.run_queue.front().cloned() {
                self.schedule(next);
            }
        }

        if removal {
            self.remove_record(key);
        } else if restarting || changed {
            if changed && let Some(svc) = self.registry.get_mut(key) {
                svc.changed = false;
            }
            self.schedule(key.clone());
        }

        self.check_transition();
        self.exit_when_drained_if_shutdown();
    }

    fn exit_when_drained_if_shutdown(&mut self) {
        let shutting_down = self.runlevel.shutdown().is_some()
            && self.runlevel.phase() == Phase::Idle;
        if shutting_down || self.quitting {
            self.exit_when_drained();
        }
    }

    fn remove_record(&mut self, key: &SvcKey) {
        self.conds.unsubscribe(key);
        self.timers.cancel(|kind| match kind {
            TimerKind::Kill(k) | TimerKind::Backoff(k) => k == key,
            TimerKind::Grace => false,
        });
        self.stop_inetd(key);
        self.run_queue.retain(|k| k != key);
        if let Some(svc) = self.registry.remove(key) {
            debug!("record {key} ({}) removed", svc.name());
        }
    }

    // ---- runlevel transitions --------------------------------------------

    /// Serialized transition: stop everything that does not belong to the
    /// new level, wait (bounded) for the drain, then start the rest.
    pub fn request_runlevel(&mut self, level: u8) {
        let level = runlevel::normalize(level);
        if !self.runlevel.request(level) {
            debug!("already at runlevel {level}");
            return;
        }
        info!(
            "runlevel {} -> {level}",
            self.runlevel.previous()
        );

        // Entering a level re-runs its one-shot records and disarms manual
        // services that do not belong there.
        for (_, svc) in self.registry.iter_mut() {
            if svc.conf.kind.oneshot() {
                svc.done = false;
            }
            if svc.conf.manual && !svc.conf.levels.contains(level) {
                svc.enabled = false;
            }
        }

        self.rebuild_run_queue(level);

        // Running `run` stanzas are left alone: the governor does not
        // advance past a level's run sequence until each run has
        // terminated, bounded by the grace timer.
        let to_stop: Vec<SvcKey> = self
            .registry
            .iter()
            .filter(|(_, svc)| {
                !svc.eligible(level)
                    && !(svc.conf.kind == SvcKind::Run
                        && svc.state == SvcState::Running)
                    && matches!(
                        svc.state,
                        SvcState::Waiting
                            | SvcState::Ready
                            | SvcState::Running
                            | SvcState::Crashed
                    )
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in to_stop {
            self.begin_stop(&key);
        }
        self.drain_pending();

        self.timers.arm(
            TimerKind::Grace,
            Duration::from_secs(runlevel::TRANSITION_GRACE_SECS),
        );
        self.check_transition();
    }

    fn rebuild_run_queue(&mut self, level: u8) {
        self.run_queue = self
            .registry
            .iter()
            .filter(|(_, svc)| {
                svc.conf.kind == SvcKind::Run && svc.startable(level)
            })
            .map(|(key, _)| key.clone())
            .collect();
    }

    /// Whether any `run` stanza still has a live process; the governor may
    /// not advance past a level's run sequence while one is executing.
    fn run_sequence_active(&self) -> bool {
        self.registry
            .iter()
            .any(|(_, svc)| svc.conf.kind == SvcKind::Run && svc.alive())
    }

    /// Completes the draining phase once no record still has to stop and
    /// the outgoing level's run sequence has terminated.
    fn check_transition(&mut self) {
        if self.runlevel.phase() != Phase::Draining {
            return;
        }
        let target = self.runlevel.target();
        let still_stopping = self
            .registry
            .iter()
            .any(|(_, svc)| !svc.eligible(target) && svc.state == SvcState::Stopping);
        if !still_stopping && !self.run_sequence_active() {
            self.finish_transition();
        }
    }

    fn finish_transition(&mut self) {
        self.timers.cancel(|kind| matches!(kind, TimerKind::Grace));
        self.runlevel.settle();
        let level = self.runlevel.current();
        info!("runlevel {level} reached");

        if let Some(action) = self.runlevel.shutdown() {
            if let Some(script) = self.conf.globals.shutdown.clone() {
                match spawn::run_blocking(&script, &[]) {
                    Ok(_) => {}
                    Err(err) => warn!("shutdown command failed: {err}"),
                }
            }
            info!("system {action}");
            // Stray inetd children are on their own now.
            for pid in self.inetd_children.keys().copied().collect::<Vec<_>>() {
                let _ = spawn::deliver(pid, libc::SIGTERM, "inetd child");
            }
            self.exit_when_drained();
            if self.exit.is_none() {
                debug!("waiting for remaining processes before {action}");
                self.timers.arm(
                    TimerKind::Grace,
                    Duration::from_secs(runlevel::TRANSITION_GRACE_SECS),
                );
            }
            return;
        }

        self.step_all();
    }

    // ---- reload ----------------------------------------------------------

    /// The reload protocol: mark, sweep, settle conditions, converge.
    /// Reconciling an unchanged configuration performs no transitions.
    pub fn reload(&mut self) -> Result<(), SupervisorError> {
        let new_conf = config::load(&self.paths)?;
        self.conf_dirty = false;

        // Mark: dynamic-mark all records, demote every fact to FLUX.
        reconcile::mark(&mut self.registry);
        self.conds.mark_flux("");

        // Sweep.
        let report = reconcile::sweep(&mut self.registry, &new_conf);
        for key in report.added.iter().chain(report.changed.iter()) {
            self.subscribe_record(key);
        }

        // Unset environment keys that disappeared; running services keep
        // the environment they were spawned with.
        for key in config::removed_env_keys(&self.conf, &new_conf) {
            unsafe { std::env::remove_var(&key) };
        }
        let old_rotate = self.conf.globals.rotate;
        self.conf = new_conf;
        if old_rotate != self.conf.globals.rotate {
            debug!("log rotation policy updated");
        }

        // Re-assert facts owned by live, unchanged records, then settle
        // whatever remains in FLUX to OFF before converging.
        let reassert: Vec<(String, Option<String>)> = self
            .registry
            .iter()
            .filter(|(_, svc)| {
                svc.state == SvcState::Running && !svc.changed && !svc.removal
            })
            .map(|(_, svc)| {
                let pid_fact = (svc.pid > 0 && svc.pidfile_path(&self.paths).exists())
                    .then(|| format!("pid/{}", svc.name()));
                (svc.fact(), pid_fact)
            })
            .collect();
        for (fact, pid_fact) in reassert {
            self.conds.reassert(&fact);
            if let Some(pid_fact) = pid_fact {
                self.conds.reassert(&pid_fact);
            }
        }
        for cond in self.conds.settle_flux() {
            self.schedule_subscribers(&cond);
        }

        // Converge: removals stop, incompatible changes stop+start, friendly
        // changes get the reconfigure signal in place.
        for key in &report.removed {
            self.begin_stop(key);
            // Already-halted removals fall straight through to deletion.
            self.schedule(key.clone());
        }
        for key in &report.changed {
            let (state, nohup, pid, name) = {
                let Some(svc) = self.registry.get(key) else {
                    continue;
                };
                (
                    svc.state,
                    svc.conf.nohup,
                    svc.pid,
                    svc.name().to_string(),
                )
            };
            match state {
                SvcState::Running if nohup => {
                    // Does not accept the reconfigure signal: full cycle.
                    self.begin_stop(key);
                }
                SvcState::Running if pid > 0 => {
                    debug!("{name} reconfigured in place");
                    let _ = spawn::deliver(pid, libc::SIGHUP, &name);
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.changed = false;
                    }
                    let fact = self
                        .registry
                        .get(key)
                        .map(|svc| svc.fact());
                    if let Some(fact) = fact {
                        self.set_fact(&fact);
                    }
                }
                SvcState::Blocked => {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.state = SvcState::Halted;
                        svc.changed = false;
                        svc.reset_restarts();
                    }
                    self.schedule(key.clone());
                }
                _ => {
                    if let Some(svc) = self.registry.get_mut(key) {
                        svc.changed = false;
                        svc.done = false;
                    }
                    self.schedule(key.clone());
                }
            }
        }

        // Reload recovers blocked records even when otherwise unchanged.
        let blocked: Vec<SvcKey> = self
            .registry
            .iter()
            .filter(|(_, svc)| svc.state == SvcState::Blocked)
            .map(|(key, _)| key.clone())
            .collect();
        for key in blocked {
            if let Some(svc) = self.registry.get_mut(&key) {
                svc.state = SvcState::Halted;
                svc.reset_restarts();
            }
            self.schedule(key);
        }

        self.rebuild_run_queue(self.runlevel.current());
        self.step_all();
        Ok(())
    }
}
