//! Error handling for finix.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Condition store error.
    #[error(transparent)]
    Cond(#[from] CondError),

    /// Error spawning or signalling a child process.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Control socket error.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Raw syscall error.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    /// A lookup by name or job id found nothing.
    #[error("no service matches '{0}'")]
    UnknownService(String),

    /// Fatal startup failure; the caller escalates to the rescue path.
    #[error("cannot initialize {subsystem}: {source}")]
    Fatal {
        /// Subsystem that failed to come up (control socket, signalfd, inotify).
        subsystem: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for configuration loading and parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration file or directory.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An `include` chain looped back on itself.
    #[error("include cycle through {0}")]
    IncludeCycle(PathBuf),
}

/// Error type for the condition store.
#[derive(Debug, Error)]
pub enum CondError {
    /// Error writing or removing a condition file.
    #[error("failed to persist condition '{path}': {source}")]
    Persist {
        /// Condition path that failed to persist.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for the child supervisor.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Error forking or executing a service process.
    #[error("failed to start service '{service}': {source}")]
    Start {
        /// The service name that failed to start.
        service: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Error delivering a signal to a service process.
    #[error("failed to signal service '{service}': {source}")]
    Signal {
        /// The service name that could not be signalled.
        service: String,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// A command or argument contained an interior NUL byte.
    #[error("invalid argv for service '{0}'")]
    BadArgv(String),

    /// Error reading a pidfile written by a forking daemon.
    #[error("unreadable pidfile {path}: {reason}")]
    Pidfile {
        /// Pidfile path.
        path: PathBuf,
        /// Why the contents were rejected.
        reason: String,
    },
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A frame arrived with the wrong magic or a truncated payload.
    #[error("malformed control frame: {0}")]
    BadFrame(&'static str),

    /// The supervisor refused the request.
    #[error("request refused")]
    Nack,

    /// Control socket not available or supervisor not running.
    #[error("control socket not available")]
    NotAvailable,
}
