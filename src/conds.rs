//! Tri-state condition facts that gate service readiness.
//!
//! A condition is a named boolean fact such as `svc/ntpd`, `pid/sshd`, or
//! `net/eth0/up`. Facts have three states: OFF, FLUX, and ON. FLUX marks a
//! fact as known-stale during a reload so that only an affirmative re-assert
//! turns it back ON; this is what prevents stop/start storms while the
//! reconciler runs.
//!
//! Each ON fact is mirrored as a zero-byte file under `<run-dir>/cond/` for
//! external observers (they may inotify-watch the directory). The in-memory
//! map is authoritative; persistence failures are logged and ignored.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use strum_macros::Display;
use tracing::{debug, warn};

use crate::error::CondError;
use crate::registry::SvcKey;

/// State of one condition fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CondState {
    /// Fact is not asserted.
    #[default]
    Off,
    /// Fact was ON before a reload and has not been re-asserted yet.
    Flux,
    /// Fact is asserted.
    On,
}

/// In-memory condition store with on-disk mirror.
#[derive(Debug)]
pub struct Conds {
    dir: PathBuf,
    facts: HashMap<String, CondState>,
    subscribers: HashMap<String, Vec<SvcKey>>,
}

impl Conds {
    /// Creates the store rooted at `dir`, wiping stale facts from a previous
    /// boot. The directory itself is left in place for watchers.
    pub fn new(dir: PathBuf) -> Result<Self, CondError> {
        if dir.exists() {
            let _ = fs::remove_dir_all(&dir);
        }
        fs::create_dir_all(&dir).map_err(|source| CondError::Persist {
            path: dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            dir,
            facts: HashMap::new(),
            subscribers: HashMap::new(),
        })
    }

    /// Current state of `cond`; unknown facts are OFF.
    pub fn get(&self, cond: &str) -> CondState {
        self.facts.get(cond).copied().unwrap_or_default()
    }

    /// Asserts `cond`. Returns `true` if the observable value changed
    /// (OFF→ON or FLUX→ON).
    pub fn set(&mut self, cond: &str) -> bool {
        let prev = self.facts.insert(cond.to_string(), CondState::On);
        self.persist(cond, true);
        prev != Some(CondState::On)
    }

    /// Clears `cond`. Returns `true` if it was ON or FLUX before.
    pub fn clear(&mut self, cond: &str) -> bool {
        let prev = self.facts.remove(cond);
        self.persist(cond, false);
        matches!(prev, Some(CondState::On) | Some(CondState::Flux))
    }

    /// Demotes every ON fact matching `prefix` to FLUX. The on-disk file is
    /// kept; external observers keep seeing the fact until it settles OFF.
    pub fn mark_flux(&mut self, prefix: &str) {
        for (path, state) in self.facts.iter_mut() {
            if *state == CondState::On && path.starts_with(prefix) {
                *state = CondState::Flux;
                debug!("condition {path} -> flux");
            }
        }
    }

    /// Re-asserts `cond` after a `mark_flux`, turning FLUX (or OFF) into ON.
    pub fn reassert(&mut self, cond: &str) -> bool {
        self.set(cond)
    }

    /// Settles every fact still in FLUX to OFF and returns their paths.
    /// The reconciler calls this after the sweep so that all facts are ON or
    /// OFF before any converge-phase state transition.
    pub fn settle_flux(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .facts
            .iter()
            .filter(|(_, state)| **state == CondState::Flux)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &stale {
            self.facts.remove(path);
            self.persist(path, false);
            debug!("condition {path} -> off (not re-asserted)");
        }
        stale
    }

    /// Registers `key` as a subscriber of `cond`. Duplicate registrations
    /// are collapsed.
    pub fn subscribe(&mut self, cond: &str, key: SvcKey) {
        let subs = self.subscribers.entry(cond.to_string()).or_default();
        if !subs.contains(&key) {
            subs.push(key);
        }
    }

    /// Drops every subscription held by `key`; called before a record is
    /// re-registered or deleted.
    pub fn unsubscribe(&mut self, key: &SvcKey) {
        for subs in self.subscribers.values_mut() {
            subs.retain(|k| k != key);
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
    }

    /// Records subscribed to `cond`, in registration order.
    pub fn subscribers(&self, cond: &str) -> &[SvcKey] {
        self.subscribers.get(cond).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether every condition in `conds` is ON. An empty conjunction is
    /// satisfied by definition.
    pub fn all_on(&self, conds: &[String]) -> bool {
        conds.iter().all(|c| self.get(c) == CondState::On)
    }

    /// Whether any condition in `conds` is OFF (FLUX does not count; a
    /// running service is not stopped over a merely-stale fact).
    pub fn any_off(&self, conds: &[String]) -> bool {
        conds.iter().any(|c| self.get(c) == CondState::Off)
    }

    fn persist(&self, cond: &str, exists: bool) {
        let file = self.dir.join(cond);
        let result = if exists {
            file.parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::write(&file, b""))
        } else {
            match fs::remove_file(&file) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };

        if let Err(err) = result {
            warn!("failed to persist condition '{cond}': {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Conds) {
        let dir = tempdir().unwrap();
        let conds = Conds::new(dir.path().join("cond")).unwrap();
        (dir, conds)
    }

    #[test]
    fn set_then_clear_restores_pre_state() {
        let (_tmp, mut conds) = store();
        assert_eq!(conds.get("usr/ready"), CondState::Off);

        assert!(conds.set("usr/ready"));
        assert_eq!(conds.get("usr/ready"), CondState::On);

        assert!(conds.clear("usr/ready"));
        assert_eq!(conds.get("usr/ready"), CondState::Off);
    }

    #[test]
    fn on_facts_exist_as_files() {
        let (tmp, mut conds) = store();
        conds.set("svc/ntpd");
        let file = tmp.path().join("cond/svc/ntpd");
        assert!(file.exists());
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 0);

        conds.clear("svc/ntpd");
        assert!(!file.exists());
    }

    #[test]
    fn flux_keeps_file_until_settle() {
        let (tmp, mut conds) = store();
        conds.set("svc/a");
        conds.set("svc/b");

        conds.mark_flux("svc/");
        assert_eq!(conds.get("svc/a"), CondState::Flux);
        assert!(tmp.path().join("cond/svc/a").exists());

        conds.reassert("svc/a");
        let settled = conds.settle_flux();
        assert_eq!(settled, vec!["svc/b".to_string()]);
        assert_eq!(conds.get("svc/a"), CondState::On);
        assert_eq!(conds.get("svc/b"), CondState::Off);
        assert!(!tmp.path().join("cond/svc/b").exists());
    }

    #[test]
    fn empty_conjunction_is_satisfied() {
        let (_tmp, conds) = store();
        assert!(conds.all_on(&[]));
        assert!(!conds.any_off(&[]));
    }

    #[test]
    fn subscriptions_collapse_and_unsubscribe() {
        let (_tmp, mut conds) = store();
        let key = SvcKey::new(1, "");
        conds.subscribe("net/eth0/up", key.clone());
        conds.subscribe("net/eth0/up", key.clone());
        assert_eq!(conds.subscribers("net/eth0/up").len(), 1);

        conds.unsubscribe(&key);
        assert!(conds.subscribers("net/eth0/up").is_empty());
    }
}
