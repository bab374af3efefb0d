//! Service records and the per-record state machine vocabulary.
//!
//! A record steps through HALTED → WAITING → READY → RUNNING → STOPPING →
//! HALTED. CRASHED and BLOCKED are the failure sinks; DEAD is terminal for
//! records whose defining file disappeared. The transition sequencing is
//! driven by the supervisor; this module owns the record itself plus the
//! pure decisions (eligibility, restart windowing, backoff).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use strum_macros::Display;

use crate::config::{PidfilePolicy, SvcConf};
use crate::registry::SvcKey;
use crate::runtime::Paths;

/// Time a stopping process gets between the stop signal and SIGKILL.
pub const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// Window over which exits are counted toward the restart cap.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Number of exits within [`RESTART_WINDOW`] that blocks a service.
pub const RESTART_CAP: usize = 10;

/// First backoff step after a crash; doubles per crash up to [`BACKOFF_MAX`].
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// State of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SvcState {
    /// Not running and not wanted (or not yet wanted).
    Halted,
    /// Wanted, but at least one start condition is not ON.
    Waiting,
    /// All conditions met; start is imminent.
    Ready,
    /// Process alive (or, for inetd, socket registered).
    Running,
    /// Stop signal sent; waiting for the exit.
    Stopping,
    /// Exited unexpectedly; backoff timer armed.
    Crashed,
    /// Exceeded the restart cap; operator action required.
    Blocked,
    /// Deleted record awaiting final removal.
    Dead,
}

/// Outcome of recording an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDisposition {
    /// Try again after this backoff.
    Backoff(Duration),
    /// Too many exits inside the window.
    Storm,
}

/// One configured service, task, run, tty, or inetd entry.
#[derive(Debug)]
pub struct Service {
    /// Registry key.
    pub key: SvcKey,
    /// Parsed attributes; compared byte-for-byte on reload.
    pub conf: SvcConf,
    /// Current state.
    pub state: SvcState,
    /// Live process id; 0 unless RUNNING or STOPPING.
    pub pid: i32,
    /// Attributes differ from the previous configuration.
    pub changed: bool,
    /// Started but not yet confirmed (forking services clear this when the
    /// pidfile shows up).
    pub starting: bool,
    /// Dynamic mark set at the start of a reconcile sweep.
    pub dirty: bool,
    /// Defining file disappeared; drive to HALTED and remove.
    pub removal: bool,
    /// Operator enable latch. Defaults to off for `manual:yes` records; an
    /// explicit start arms it, an explicit stop (or, for manual records,
    /// leaving their levels) disarms it.
    pub enabled: bool,
    /// One-shot record already ran at the current level.
    pub done: bool,
    /// Restart requested; start again as soon as HALTED is reached.
    pub restarting: bool,
    /// Shielded from API stop requests (built-in inetd handlers).
    pub protected: bool,
    /// SIGKILL escalation already fired for the current stop.
    pub kill_escalated: bool,
    /// Live inetd connections.
    pub conns: u32,
    /// Recent exit timestamps inside the restart window.
    restarts: VecDeque<Instant>,
    /// Crashes since the last successful stretch, for the backoff schedule.
    crash_streak: u32,
}

impl Service {
    /// Wraps a parsed candidate into a fresh HALTED record.
    pub fn new(key: SvcKey, conf: SvcConf) -> Self {
        let protected = conf.inetd.as_ref().is_some_and(|i| i.internal);
        let enabled = !conf.manual;
        Self {
            key,
            conf,
            state: SvcState::Halted,
            pid: 0,
            changed: false,
            starting: false,
            dirty: false,
            removal: false,
            enabled,
            done: false,
            restarting: false,
            protected,
            kill_escalated: false,
            conns: 0,
            restarts: VecDeque::with_capacity(RESTART_CAP),
            crash_streak: 0,
        }
    }

    /// Registration name.
    pub fn name(&self) -> &str {
        &self.conf.name
    }

    /// The `svc/<cmd>` fact this record asserts while RUNNING. Instances
    /// append `:<id>` so they do not shadow each other.
    pub fn fact(&self) -> String {
        if self.key.instance.is_empty() {
            format!("svc/{}", self.conf.cmd.display())
        } else {
            format!("svc/{}:{}", self.conf.cmd.display(), self.key.instance)
        }
    }

    /// Whether the record forks away from the supervised child and must be
    /// adopted through its pidfile.
    pub fn forking(&self) -> bool {
        matches!(self.conf.pidfile, PidfilePolicy::Foreign(_))
    }

    /// Basename of the pidfile that identifies this record in run-dir
    /// inotify events, if any applies.
    pub fn pidfile_basename(&self) -> Option<String> {
        match &self.conf.pidfile {
            PidfilePolicy::Implicit => Some(format!("{}.pid", self.conf.name)),
            PidfilePolicy::Explicit(path) | PidfilePolicy::Foreign(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }

    /// Resolved pidfile path.
    pub fn pidfile_path(&self, paths: &Paths) -> PathBuf {
        match &self.conf.pidfile {
            PidfilePolicy::Implicit => paths.pidfile(&self.conf.name),
            PidfilePolicy::Explicit(path) | PidfilePolicy::Foreign(path) => path.clone(),
        }
    }

    /// Whether the record should be alive at `level`. Removal always loses;
    /// the enable latch covers both `manual:yes` and operator stops.
    pub fn eligible(&self, level: u8) -> bool {
        !self.removal
            && self.state != SvcState::Dead
            && self.conf.levels.contains(level)
            && self.enabled
    }

    /// Whether a step at `level` may take this record out of HALTED. One-shot
    /// records run once per level entry.
    pub fn startable(&self, level: u8) -> bool {
        self.eligible(level) && !(self.conf.kind.oneshot() && self.done)
    }

    /// Whether the record is in a state that implies a live process.
    pub fn alive(&self) -> bool {
        matches!(self.state, SvcState::Running | SvcState::Stopping) && self.pid > 0
    }

    /// Records an unexpected exit and decides between backing off and
    /// declaring a restart storm.
    pub fn note_crash(&mut self, now: Instant) -> CrashDisposition {
        self.restarts.push_back(now);
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) > RESTART_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= RESTART_CAP {
            return CrashDisposition::Storm;
        }

        self.crash_streak += 1;
        let shift = (self.crash_streak - 1).min(4);
        let backoff = BACKOFF_BASE * (1 << shift);
        CrashDisposition::Backoff(backoff.min(BACKOFF_MAX))
    }

    /// Clears the restart history; called on operator start and on reload
    /// of a BLOCKED record.
    pub fn reset_restarts(&mut self) {
        self.restarts.clear();
        self.crash_streak = 0;
    }

    /// Number of exits currently inside the window.
    pub fn recent_exits(&self) -> usize {
        self.restarts.len()
    }
}
