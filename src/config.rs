//! Configuration management for finix.
//!
//! The configuration is line-based: one main file plus every `*.conf` under
//! the snippet directory and its `enabled/` subdirectory. Parsing is total:
//! a malformed line is logged and skipped, and never aborts the file.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::runlevel::LevelMask;
use crate::runtime::Paths;

/// Kind of a configured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SvcKind {
    /// Long-running supervised daemon.
    Service,
    /// One-shot command, started in parallel with its level peers.
    Task,
    /// One-shot command, serial-blocking within its level.
    Run,
    /// SysV-style script, invoked with a `start` argument.
    Sysv,
    /// Getty on a terminal device.
    Tty,
    /// Socket-activated service.
    Inetd,
}

impl SvcKind {
    /// One-shot kinds reach HALTED on a clean exit instead of CRASHED.
    pub fn oneshot(&self) -> bool {
        matches!(self, SvcKind::Task | SvcKind::Run | SvcKind::Sysv)
    }
}

/// How the service's pidfile is managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidfilePolicy {
    /// The supervisor writes `<run-dir>/<name>.pid` on start.
    Implicit,
    /// The supervisor writes the pidfile at the given path.
    Explicit(PathBuf),
    /// A forking daemon writes the file itself; the supervisor only reads it
    /// to learn the daemon's PID.
    Foreign(PathBuf),
}

/// Destination of a service's stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// Discard (default).
    Null,
    /// Inherit the console.
    Console,
    /// Append to a file, rotated per the global policy.
    File(PathBuf),
    /// Hand off to the syslog collaborator; finix records the metadata and
    /// silences the child's stdio.
    Syslog {
        /// Syslog facility name.
        facility: String,
        /// Syslog level name.
        level: String,
        /// Log tag, defaults to the service name.
        tag: String,
    },
    /// Explicitly off.
    Off,
}

/// Resource classes accepted by the `rlimit` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[allow(missing_docs)]
pub enum RlimitRes {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
}

/// One bound of a resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimVal {
    /// Leave the inherited value alone.
    Keep,
    /// `RLIM_INFINITY`.
    Infinity,
    /// A fixed value.
    Limit(u64),
}

/// One resource limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitRule {
    /// Resource class.
    pub res: RlimitRes,
    /// Soft limit.
    pub soft: RlimVal,
    /// Hard limit.
    pub hard: RlimVal,
}

/// Protocol field of an `inetd` stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum InetdProto {
    /// Stream socket.
    Tcp,
    /// Datagram socket.
    Udp,
}

/// Allow/deny rule for the interface a connection arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceRule {
    /// `false` when the interface name was prefixed with `!`.
    pub allow: bool,
    /// Interface name, e.g. `eth0`.
    pub iface: String,
}

/// Socket-activation settings parsed from an `inetd` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InetdConf {
    /// Service name or numeric port.
    pub svc: String,
    /// Port resolved at parse time when `svc` is numeric.
    pub port: Option<u16>,
    /// Protocol.
    pub proto: InetdProto,
    /// Interface filter rules in declaration order; first match wins.
    pub filters: Vec<IfaceRule>,
    /// `wait` semantics: hand the listening socket to a single child.
    pub wait: bool,
    /// Built-in handler (`internal` in place of a command path).
    pub internal: bool,
}

/// Terminal settings parsed from a `tty` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyConf {
    /// Device path.
    pub dev: PathBuf,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Terminal type handed to the getty.
    pub term: Option<String>,
    /// Raw option words (`noclear`, `nowait`, …) passed to the getty helper.
    pub opts: Vec<String>,
}

/// A candidate service record produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct SvcConf {
    /// Record kind.
    pub kind: SvcKind,
    /// Registration name: `name:` override or the command basename.
    pub name: String,
    /// Instance id from a `:ID` option; empty for the default instance.
    pub instance: String,
    /// Absolute command path.
    pub cmd: PathBuf,
    /// Arguments, `$VAR`-expanded.
    pub args: Vec<String>,
    /// Runlevels the record should be alive in.
    pub levels: LevelMask,
    /// Start condition conjunction; empty is always satisfied.
    pub conds: Vec<String>,
    /// The record does not accept the reconfigure signal (leading `!` in the
    /// condition field); a change forces stop+start.
    pub nohup: bool,
    /// Pidfile management.
    pub pidfile: PidfilePolicy,
    /// Signal used to stop the service.
    pub stop_signal: i32,
    /// Only started on explicit request.
    pub manual: bool,
    /// stdout/stderr destination.
    pub log: LogSink,
    /// Drop-privileges user.
    pub user: Option<String>,
    /// Drop-privileges group.
    pub group: Option<String>,
    /// Resource limits inherited from file scope plus per-line additions.
    pub rlimits: Vec<RlimitRule>,
    /// Cgroup selector in effect for this record.
    pub cgroup: Option<String>,
    /// Free-text description (after `--`).
    pub desc: String,
    /// File this record came from.
    pub origin: PathBuf,
    /// Socket-activation settings for `inetd` records.
    pub inetd: Option<InetdConf>,
    /// Terminal settings for `tty` records.
    pub tty: Option<TtyConf>,
}

/// Global log-rotation policy (`log size:BYTES count:N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotate {
    /// Rotate once a file sink exceeds this many bytes.
    pub size: u64,
    /// Number of rotated files kept.
    pub count: u32,
}

impl Default for LogRotate {
    fn default() -> Self {
        Self {
            size: 200 * 1024,
            count: 5,
        }
    }
}

/// A cgroup definition (`cgroup NAME ctrl.prop:val,...`). The property
/// writes belong to the cgroup collaborator; finix only records them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupDef {
    /// Group name.
    pub name: String,
    /// Raw `ctrl.prop:val` settings.
    pub props: Vec<String>,
}

/// Global settings collected across all parsed files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Globals {
    /// Hostname to set at bootstrap when `/etc/hostname` is absent.
    pub hostname: Option<String>,
    /// Kernel modules to load at bootstrap (boundary).
    pub modules: Vec<String>,
    /// Network bringup script run at bootstrap.
    pub network: Option<PathBuf>,
    /// Directory of executables run in lexical order at the end of bootstrap.
    pub runparts: Option<PathBuf>,
    /// Target runlevel after bootstrap.
    pub target_level: Option<u8>,
    /// Command run at shutdown.
    pub shutdown: Option<PathBuf>,
    /// Log-rotation policy for file sinks.
    pub rotate: LogRotate,
    /// Declared cgroups.
    pub cgroups: Vec<CgroupDef>,
}

/// Result of parsing the full configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conf {
    /// Global settings.
    pub globals: Globals,
    /// Candidate records in declaration order.
    pub services: Vec<SvcConf>,
    /// `KEY=VALUE` environment entries in declaration order.
    pub env: Vec<(String, String)>,
}

impl Conf {
    /// Looks up an accumulated environment entry.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Per-file scope: `rlimit` and `cgroup.NAME` directives establish defaults
/// for the records that follow them in the same file.
#[derive(Debug, Clone, Default)]
struct FileScope {
    rlimits: Vec<RlimitRule>,
    cgroup: Option<String>,
}

struct Parser {
    conf: Conf,
    expand: Regex,
    include_stack: Vec<PathBuf>,
}

/// Loads the main file plus every snippet. Missing files are not an error;
/// an empty configuration is valid.
pub fn load(paths: &Paths) -> Result<Conf, ConfigError> {
    let mut parser = Parser {
        conf: Conf::default(),
        expand: Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .unwrap(),
        include_stack: Vec::new(),
    };

    if paths.conf.exists() {
        parser.parse_file(&paths.conf)?;
    }

    for dir in [paths.conf_dir.clone(), paths.enabled_dir()] {
        for file in snippet_files(&dir) {
            parser.parse_file(&file)?;
        }
    }

    Ok(parser.conf)
}

/// `*.conf` entries of `dir` in lexical order. Symlinks are resolved and
/// dangling ones skipped.
fn snippet_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "conf") {
                return None;
            }
            match fs::canonicalize(&path) {
                Ok(resolved) if resolved.is_file() => Some(path),
                Ok(_) => None,
                Err(err) => {
                    debug!("skipping {}: {err}", path.display());
                    None
                }
            }
        })
        .collect();

    files.sort();
    files
}

impl Parser {
    fn parse_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.include_stack.contains(&canonical) {
            return Err(ConfigError::IncludeCycle(canonical));
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        self.include_stack.push(canonical);
        let mut scope = FileScope::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim().replace('\t', " ");
            if line.is_empty() {
                continue;
            }
            if let Err(reason) = self.parse_line(&line, path, &mut scope) {
                warn!(
                    "{}:{}: skipping malformed line: {reason}",
                    path.display(),
                    lineno + 1
                );
            }
        }

        self.include_stack.pop();
        Ok(())
    }

    fn parse_line(
        &mut self,
        line: &str,
        origin: &Path,
        scope: &mut FileScope,
    ) -> Result<(), String> {
        let mut tokens = line.split_whitespace();
        let Some(word) = tokens.next() else {
            return Ok(());
        };
        let rest: Vec<&str> = tokens.collect();

        match word {
            "host" | "hostname" => {
                self.conf.globals.hostname =
                    Some(rest.first().ok_or("missing hostname")?.to_string());
            }
            "module" => {
                if rest.is_empty() {
                    return Err("missing module name".into());
                }
                self.conf.globals.modules.push(rest.join(" "));
            }
            "network" => {
                self.conf.globals.network =
                    Some(PathBuf::from(rest.first().ok_or("missing path")?));
            }
            "runparts" => {
                self.conf.globals.runparts =
                    Some(PathBuf::from(rest.first().ok_or("missing directory")?));
            }
            "runlevel" => {
                let level: u8 = rest
                    .first()
                    .ok_or("missing level")?
                    .parse()
                    .map_err(|_| "level is not a number".to_string())?;
                if level == 0 || level == 6 || level > 9 {
                    return Err(format!("target level {level} is reserved"));
                }
                self.conf.globals.target_level = Some(level);
            }
            "include" => {
                let path = PathBuf::from(rest.first().ok_or("missing path")?);
                // Splice in place; the included file shares our env table but
                // keeps its own file scope.
                self.parse_file(&path).map_err(|err| err.to_string())?;
            }
            "shutdown" => {
                self.conf.globals.shutdown =
                    Some(PathBuf::from(rest.first().ok_or("missing path")?));
            }
            "log" => self.parse_log_global(&rest)?,
            "rlimit" => {
                let rule = parse_rlimit(&rest)?;
                scope.rlimits.retain(|r| r.res != rule.res);
                scope.rlimits.push(rule);
            }
            "cgroup" => {
                let name = rest.first().ok_or("missing cgroup name")?;
                self.conf.globals.cgroups.push(CgroupDef {
                    name: name.to_string(),
                    props: rest[1..].iter().map(|s| s.to_string()).collect(),
                });
            }
            word if word.starts_with("cgroup.") => {
                scope.cgroup = Some(word["cgroup.".len()..].to_string());
            }
            "service" | "task" | "run" | "sysv" => {
                let kind = SvcKind::from_str(word).map_err(|e| e.to_string())?;
                let svc = self.parse_svc(kind, &rest, origin, scope)?;
                self.push_candidate(svc);
            }
            "inetd" => {
                let svc = self.parse_inetd(&rest, origin, scope)?;
                self.push_candidate(svc);
            }
            "tty" => {
                let svc = self.parse_tty(&rest, origin, scope)?;
                self.push_candidate(svc);
            }
            word if word.contains('=') && !word.starts_with('=') => {
                let (key, value) = line.split_once('=').ok_or("bad assignment")?;
                let value = self.expand_vars(value.trim());
                self.conf
                    .env
                    .retain(|(k, _)| k != key.trim());
                self.conf.env.push((key.trim().to_string(), value));
            }
            other => {
                warn!("unknown directive '{other}' ignored");
            }
        }
        Ok(())
    }

    fn parse_log_global(&mut self, tokens: &[&str]) -> Result<(), String> {
        let mut rotate = self.conf.globals.rotate;
        for token in tokens {
            if let Some(value) = token.strip_prefix("size:") {
                rotate.size = parse_bytes(value)?;
            } else if let Some(value) = token.strip_prefix("count:") {
                rotate.count = value.parse().map_err(|_| "bad count".to_string())?;
            } else {
                return Err(format!("unknown log setting '{token}'"));
            }
        }
        self.conf.globals.rotate = rotate;
        Ok(())
    }

    /// Common parse of `service`/`task`/`run`/`sysv` stanzas:
    /// `[LVLS] <COND> [opts] /path args -- description`.
    fn parse_svc(
        &mut self,
        kind: SvcKind,
        tokens: &[&str],
        origin: &Path,
        scope: &FileScope,
    ) -> Result<SvcConf, String> {
        let (tokens, desc) = split_desc(tokens);
        let mut svc = self.blank(kind, origin, scope);
        svc.desc = desc;

        let mut iter = tokens.iter().peekable();
        while let Some(token) = iter.peek() {
            if token.starts_with('/') {
                break;
            }
            let Some(token) = iter.next() else { break };
            // sysv stanzas take only the runlevel and condition fields.
            if kind == SvcKind::Sysv
                && !token.starts_with('[')
                && !token.starts_with('<')
            {
                return Err(format!("sysv does not take option '{token}'"));
            }
            self.parse_svc_option(&mut svc, token)?;
        }

        let cmd = iter.next().ok_or("missing command path")?;
        svc.cmd = PathBuf::from(self.expand_vars(cmd));
        svc.args = iter.map(|arg| self.expand_vars(arg)).collect();
        if kind == SvcKind::Sysv && !svc.args.is_empty() {
            return Err("sysv takes no arguments".into());
        }

        if svc.name.is_empty() {
            svc.name = basename(&svc.cmd);
        }
        Ok(svc)
    }

    fn parse_svc_option(&self, svc: &mut SvcConf, token: &str) -> Result<(), String> {
        if token.starts_with('[') {
            svc.levels = token.parse()?;
        } else if let Some(inner) = token.strip_prefix('<') {
            let inner = inner.strip_suffix('>').ok_or("unterminated condition")?;
            let inner = match inner.strip_prefix('!') {
                Some(rest) => {
                    svc.nohup = true;
                    rest
                }
                None => inner,
            };
            svc.conds = inner
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|c| c.to_string())
                .collect();
        } else if token == "pid" {
            svc.pidfile = PidfilePolicy::Implicit;
        } else if let Some(spec) = token.strip_prefix("pid:") {
            svc.pidfile = match spec.strip_prefix('!') {
                Some(path) => PidfilePolicy::Foreign(PathBuf::from(path)),
                None => PidfilePolicy::Explicit(PathBuf::from(spec)),
            };
        } else if let Some(signo) = token.strip_prefix("kill:") {
            svc.stop_signal = signo
                .parse()
                .map_err(|_| format!("bad stop signal '{signo}'"))?;
        } else if let Some(name) = token.strip_prefix("name:") {
            svc.name = name.to_string();
        } else if let Some(value) = token.strip_prefix("manual:") {
            svc.manual = value == "yes";
        } else if token == "log" {
            svc.log = LogSink::Syslog {
                facility: "daemon".into(),
                level: "info".into(),
                tag: String::new(),
            };
        } else if let Some(spec) = token.strip_prefix("log:") {
            svc.log = parse_log_sink(spec)?;
        } else if let Some(ug) = token.strip_prefix('@') {
            match ug.split_once(':') {
                Some((user, group)) => {
                    svc.user = Some(user.to_string());
                    svc.group = Some(group.to_string());
                }
                None => svc.user = Some(ug.to_string()),
            }
        } else if let Some(id) = token.strip_prefix(':') {
            svc.instance = id.to_string();
        } else {
            return Err(format!("unknown option '{token}'"));
        }
        Ok(())
    }

    /// `inetd SVC/PROTO[@IFLIST] {wait|nowait} [LVLS] /path args` — or the
    /// word `internal` in place of a command for built-in handlers.
    fn parse_inetd(
        &mut self,
        tokens: &[&str],
        origin: &Path,
        scope: &FileScope,
    ) -> Result<SvcConf, String> {
        let (tokens, desc) = split_desc(tokens);
        let mut svc = self.blank(SvcKind::Inetd, origin, scope);
        svc.desc = desc;

        let mut iter = tokens.iter().peekable();
        let spec = iter.next().ok_or("missing service/proto")?;

        let (svcproto, iflist) = match spec.split_once('@') {
            Some((sp, list)) => (sp, Some(list)),
            None => (*spec, None),
        };
        let (name, proto) = svcproto.split_once('/').ok_or("missing /proto")?;
        let proto = InetdProto::from_str(proto).map_err(|e| e.to_string())?;

        let filters = iflist
            .map(|list| {
                list.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|rule| match rule.strip_prefix('!') {
                        Some(iface) => IfaceRule {
                            allow: false,
                            iface: iface.to_string(),
                        },
                        None => IfaceRule {
                            allow: true,
                            iface: rule.to_string(),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        let wait = match iter.next() {
            Some(&"wait") => true,
            Some(&"nowait") => false,
            other => return Err(format!("expected wait|nowait, got {other:?}")),
        };

        while let Some(token) = iter.peek() {
            if token.starts_with('/') || **token == "internal" {
                break;
            }
            let Some(token) = iter.next() else { break };
            self.parse_svc_option(&mut svc, token)?;
        }

        let mut internal = false;
        match iter.next() {
            Some(&"internal") => internal = true,
            Some(cmd) => {
                svc.cmd = PathBuf::from(self.expand_vars(cmd));
                svc.args = iter.map(|arg| self.expand_vars(arg)).collect();
            }
            None => return Err("missing command or 'internal'".into()),
        }

        svc.inetd = Some(InetdConf {
            svc: name.to_string(),
            port: name.parse().ok(),
            proto,
            filters,
            wait,
            internal,
        });
        if svc.name.is_empty() {
            svc.name = name.to_string();
        }
        Ok(svc)
    }

    /// `tty [LVLS] DEV [BAUD] [opts] [TERM]`. The getty itself is an
    /// external helper; the record only carries the terminal settings.
    fn parse_tty(
        &mut self,
        tokens: &[&str],
        origin: &Path,
        scope: &FileScope,
    ) -> Result<SvcConf, String> {
        let (tokens, desc) = split_desc(tokens);
        let mut svc = self.blank(SvcKind::Tty, origin, scope);
        svc.desc = desc;

        let mut tty = TtyConf {
            dev: PathBuf::new(),
            baud: None,
            term: None,
            opts: Vec::new(),
        };

        for token in tokens {
            if token.starts_with('[') {
                svc.levels = token.parse()?;
            } else if token.starts_with('/') {
                tty.dev = PathBuf::from(*token);
            } else if let Ok(baud) = token.parse::<u32>() {
                tty.baud = Some(baud);
            } else if matches!(*token, "noclear" | "nowait" | "nologin" | "rescue") {
                tty.opts.push(token.to_string());
            } else {
                tty.term = Some(token.to_string());
            }
        }

        if tty.dev.as_os_str().is_empty() {
            return Err("missing device".into());
        }

        svc.name = "tty".into();
        svc.instance = basename(&tty.dev);
        svc.cmd = PathBuf::from("/sbin/getty");
        svc.tty = Some(tty);
        Ok(svc)
    }

    fn blank(&self, kind: SvcKind, origin: &Path, scope: &FileScope) -> SvcConf {
        SvcConf {
            kind,
            name: String::new(),
            instance: String::new(),
            cmd: PathBuf::new(),
            args: Vec::new(),
            levels: LevelMask::default_runlevels(),
            conds: Vec::new(),
            nohup: false,
            pidfile: PidfilePolicy::Implicit,
            stop_signal: libc::SIGTERM,
            manual: false,
            log: LogSink::Null,
            user: None,
            group: None,
            rlimits: scope.rlimits.clone(),
            cgroup: scope.cgroup.clone(),
            desc: String::new(),
            origin: origin.to_path_buf(),
            inetd: None,
            tty: None,
        }
    }

    /// Later definitions of the same (name, instance) replace earlier ones,
    /// so a snippet under the config directory overrides the main file.
    fn push_candidate(&mut self, svc: SvcConf) {
        if let Some(existing) = self
            .conf
            .services
            .iter_mut()
            .find(|s| s.name == svc.name && s.instance == svc.instance)
        {
            debug!(
                "{} overrides earlier definition of {}:{}",
                svc.origin.display(),
                svc.name,
                svc.instance
            );
            *existing = svc;
        } else {
            self.conf.services.push(svc);
        }
    }

    /// Expands `$KEY` / `${KEY}` from the accumulated env table, falling
    /// back to the supervisor's own environment.
    fn expand_vars(&self, input: &str) -> String {
        self.expand
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let key = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or("");
                self.conf
                    .env_get(key)
                    .map(str::to_string)
                    .or_else(|| env::var(key).ok())
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Splits the trailing ` -- description` off a token list.
fn split_desc<'a>(tokens: &'a [&'a str]) -> (&'a [&'a str], String) {
    match tokens.iter().position(|t| *t == "--") {
        Some(pos) => (&tokens[..pos], tokens[pos + 1..].join(" ")),
        None => (tokens, String::new()),
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `rlimit [soft|hard|both] RES VALUE`.
fn parse_rlimit(tokens: &[&str]) -> Result<RlimitRule, String> {
    let mut iter = tokens.iter();
    let mut which = "both";
    let mut res = *iter.next().ok_or("missing resource")?;
    if matches!(res, "soft" | "hard" | "both") {
        which = res;
        res = *iter.next().ok_or("missing resource")?;
    }

    let res = RlimitRes::from_str(res).map_err(|_| format!("unknown resource '{res}'"))?;
    let raw = iter.next().ok_or("missing value")?;
    let value = if raw.eq_ignore_ascii_case("unlimited") || raw.eq_ignore_ascii_case("infinity")
    {
        RlimVal::Infinity
    } else {
        RlimVal::Limit(parse_bytes(raw)?)
    };

    Ok(RlimitRule {
        res,
        soft: if which == "hard" { RlimVal::Keep } else { value },
        hard: if which == "soft" { RlimVal::Keep } else { value },
    })
}

/// Parses `log:SPEC` on a service line.
fn parse_log_sink(spec: &str) -> Result<LogSink, String> {
    match spec {
        "null" => Ok(LogSink::Null),
        "console" => Ok(LogSink::Console),
        "off" => Ok(LogSink::Off),
        spec if spec.starts_with('/') => Ok(LogSink::File(PathBuf::from(spec))),
        spec if spec.starts_with("syslog") => {
            let mut facility = "daemon".to_string();
            let mut level = "info".to_string();
            let mut tag = String::new();
            for part in spec.split(':').skip(1) {
                if let Some(t) = part.strip_prefix("tag=") {
                    tag = t.to_string();
                } else if let Some((f, l)) = part.split_once('.') {
                    facility = f.to_string();
                    level = l.to_string();
                }
            }
            Ok(LogSink::Syslog {
                facility,
                level,
                tag,
            })
        }
        other => Err(format!("unknown log sink '{other}'")),
    }
}

/// Accepts plain byte counts plus `k`/`M`/`G` suffixes.
fn parse_bytes(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024),
        Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("bad number '{value}'"))
}

/// Returns the keys present in `old` but absent from `new`; the supervisor
/// unsets them from its own environment after a reload.
pub fn removed_env_keys(old: &Conf, new: &Conf) -> Vec<String> {
    let kept: HashSet<&str> = new.env.iter().map(|(k, _)| k.as_str()).collect();
    old.env
        .iter()
        .filter(|(k, _)| !kept.contains(k.as_str()))
        .map(|(k, _)| k.clone())
        .collect()
}
