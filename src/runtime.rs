//! Helpers for resolving the supervisor's filesystem layout.
use std::path::{Path, PathBuf};

/// Default main configuration file.
pub const DEFAULT_CONF: &str = "/etc/finix.conf";

/// Default snippet directory; `enabled/` lives underneath it.
pub const DEFAULT_CONF_DIR: &str = "/etc/finix.d";

/// Default run directory for conditions, pidfiles, and the control socket.
pub const DEFAULT_RUN_DIR: &str = "/run/finix";

/// Resolved filesystem layout threaded through the supervisor context.
///
/// Every component takes paths from here instead of consulting globals, so
/// tests can point a whole supervisor at a scratch directory.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Main configuration file.
    pub conf: PathBuf,
    /// Directory of `*.conf` snippets.
    pub conf_dir: PathBuf,
    /// Run directory owned by the supervisor.
    pub run_dir: PathBuf,
}

impl Paths {
    /// System defaults used when running as process 1.
    pub fn system() -> Self {
        Self {
            conf: PathBuf::from(DEFAULT_CONF),
            conf_dir: PathBuf::from(DEFAULT_CONF_DIR),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
        }
    }

    /// Layout rooted at an arbitrary directory, used by tests and by
    /// `--config`/`--rundir` overrides.
    pub fn rooted(base: &Path) -> Self {
        Self {
            conf: base.join("finix.conf"),
            conf_dir: base.join("finix.d"),
            run_dir: base.join("run"),
        }
    }

    /// Directory of condition files.
    pub fn cond_dir(&self) -> PathBuf {
        self.run_dir.join("cond")
    }

    /// On-disk location of one condition fact.
    pub fn cond_file(&self, cond: &str) -> PathBuf {
        self.cond_dir().join(cond)
    }

    /// The control socket all `finixctl` requests arrive on.
    pub fn control_socket(&self) -> PathBuf {
        self.run_dir.join("control.sock")
    }

    /// Pidfile the supervisor writes for a service under the implicit policy.
    pub fn pidfile(&self, basename: &str) -> PathBuf {
        self.run_dir.join(format!("{basename}.pid"))
    }

    /// The `enabled/` subdirectory of the snippet directory.
    pub fn enabled_dir(&self) -> PathBuf {
        self.conf_dir.join("enabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout_stays_under_base() {
        let paths = Paths::rooted(Path::new("/tmp/x"));
        assert_eq!(paths.conf, PathBuf::from("/tmp/x/finix.conf"));
        assert_eq!(paths.cond_file("svc/a"), PathBuf::from("/tmp/x/run/cond/svc/a"));
        assert_eq!(paths.pidfile("ntpd"), PathBuf::from("/tmp/x/run/ntpd.pid"));
    }
}
