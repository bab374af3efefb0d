//! Reload reconciliation: diffing parsed configuration against the registry.
//!
//! The mark and sweep passes live here and are pure bookkeeping over the
//! registry; the converge pass (actually stopping, signalling, and starting
//! records) is driven by the supervisor, which owns the condition store and
//! the child supervisor. Sweeping an unchanged configuration is a no-op:
//! no record ends up marked changed, added, or removed.

use tracing::debug;

use crate::config::Conf;
use crate::registry::{Registry, SvcKey};

/// Outcome of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records inserted for new candidates (changed flag set).
    pub added: Vec<SvcKey>,
    /// Existing records whose attributes differ byte-for-byte.
    pub changed: Vec<SvcKey>,
    /// Records whose defining stanza disappeared; marked for removal.
    pub removed: Vec<SvcKey>,
}

/// Mark pass: tags every record with the dynamic mark and clears the
/// changed flag. The caller demotes condition facts to FLUX alongside.
pub fn mark(registry: &mut Registry) {
    for (_, svc) in registry.iter_mut() {
        svc.dirty = true;
        svc.changed = false;
    }
}

/// Sweep pass: matches every parsed candidate against the registry.
///
/// Matching tries (origin file, name, instance) first, then falls back to
/// (command, instance) so a stanza moved between files keeps its record.
/// Matched records have their attributes replaced and the changed flag set
/// when anything differed; unmatched candidates are inserted fresh. Records
/// still carrying the dynamic mark afterwards are tagged for removal.
pub fn sweep(registry: &mut Registry, conf: &Conf) -> SweepReport {
    let mut report = SweepReport::default();

    for cand in &conf.services {
        let matched = registry
            .iter()
            .find(|(key, svc)| {
                svc.conf.origin == cand.origin
                    && svc.conf.name == cand.name
                    && key.instance == cand.instance
            })
            .or_else(|| {
                registry.iter().find(|(key, svc)| {
                    svc.dirty
                        && svc.conf.cmd == cand.cmd
                        && key.instance == cand.instance
                })
            })
            .map(|(key, _)| key.clone());

        match matched {
            Some(key) => {
                if let Some(svc) = registry.get_mut(&key) {
                    svc.dirty = false;
                    if svc.conf != *cand {
                        debug!("{} changed on disk", svc.name());
                        svc.conf = cand.clone();
                        svc.changed = true;
                        report.changed.push(key);
                    }
                }
            }
            None => {
                let key = registry.insert(cand.clone());
                if let Some(svc) = registry.get_mut(&key) {
                    svc.dirty = false;
                    svc.changed = true;
                }
                debug!("new record {key} for {}", cand.name);
                report.added.push(key);
            }
        }
    }

    let leftovers: Vec<SvcKey> = registry
        .iter()
        .filter(|(_, svc)| svc.dirty)
        .map(|(key, _)| key.clone())
        .collect();
    for key in leftovers {
        if let Some(svc) = registry.get_mut(&key) {
            svc.dirty = false;
            svc.removal = true;
            debug!("record {key} ({}) gone from disk", svc.name());
        }
        report.removed.push(key);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogSink, PidfilePolicy, SvcConf, SvcKind};
    use crate::runlevel::LevelMask;
    use std::path::PathBuf;

    fn cand(name: &str, cmd: &str, origin: &str) -> SvcConf {
        SvcConf {
            kind: SvcKind::Service,
            name: name.into(),
            instance: String::new(),
            cmd: PathBuf::from(cmd),
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
            rlimits: Vec::new(),
            cgroup: None,
            desc: String::new(),
            origin: PathBuf::from(origin),
            inetd: None,
            tty: None,
        }
    }

    fn conf_of(cands: Vec<SvcConf>) -> Conf {
        Conf {
            services: cands,
            ..Conf::default()
        }
    }

    #[test]
    fn sweep_is_idempotent() {
        let mut registry = Registry::new();
        let conf = conf_of(vec![cand("a", "/bin/a", "/etc/finix.conf")]);

        mark(&mut registry);
        let first = sweep(&mut registry, &conf);
        assert_eq!(first.added.len(), 1);

        mark(&mut registry);
        let second = sweep(&mut registry, &conf);
        assert!(second.added.is_empty());
        assert!(second.changed.is_empty());
        assert!(second.removed.is_empty());
        assert!(!registry.iter().any(|(_, svc)| svc.changed));
    }

    #[test]
    fn attribute_change_sets_flag_and_updates_conf() {
        let mut registry = Registry::new();
        let conf = conf_of(vec![cand("a", "/bin/a", "/etc/finix.conf")]);
        mark(&mut registry);
        sweep(&mut registry, &conf);

        let mut updated = cand("a", "/bin/a", "/etc/finix.conf");
        updated.args = vec!["-v".into()];
        mark(&mut registry);
        let report = sweep(&mut registry, &conf_of(vec![updated]));

        assert_eq!(report.changed.len(), 1);
        let svc = registry.get(&report.changed[0]).unwrap();
        assert!(svc.changed);
        assert_eq!(svc.conf.args, vec!["-v"]);
    }

    #[test]
    fn vanished_stanza_marks_removal() {
        let mut registry = Registry::new();
        mark(&mut registry);
        let report = sweep(
            &mut registry,
            &conf_of(vec![
                cand("a", "/bin/a", "/etc/finix.conf"),
                cand("b", "/bin/b", "/etc/finix.conf"),
            ]),
        );
        assert_eq!(report.added.len(), 2);

        mark(&mut registry);
        let report = sweep(
            &mut registry,
            &conf_of(vec![cand("a", "/bin/a", "/etc/finix.conf")]),
        );
        assert_eq!(report.removed.len(), 1);
        let gone = registry.get(&report.removed[0]).unwrap();
        assert!(gone.removal);
        assert_eq!(gone.name(), "b");
    }

    #[test]
    fn stanza_moved_between_files_keeps_record() {
        let mut registry = Registry::new();
        mark(&mut registry);
        let report = sweep(
            &mut registry,
            &conf_of(vec![cand("a", "/bin/a", "/etc/finix.conf")]),
        );
        let original = report.added[0].clone();

        mark(&mut registry);
        let report = sweep(
            &mut registry,
            &conf_of(vec![cand("a", "/bin/a", "/etc/finix.d/a.conf")]),
        );
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());
        // Origin change is an attribute change, not a new record.
        assert_eq!(report.changed, vec![original]);
    }

    #[test]
    fn instances_are_distinct_records() {
        let mut registry = Registry::new();
        let mut one = cand("w", "/bin/w", "/etc/finix.conf");
        one.instance = "1".into();
        let mut two = cand("w", "/bin/w", "/etc/finix.conf");
        two.instance = "2".into();

        mark(&mut registry);
        let report = sweep(&mut registry, &conf_of(vec![one, two]));
        assert_eq!(report.added.len(), 2);
        assert_ne!(report.added[0].instance, report.added[1].instance);
    }
}
