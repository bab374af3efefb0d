//! Keyed collection of service records.
//!
//! The registry owns every record. External indexes (pid map, basename,
//! origin file) resolve to keys, never to references, so nothing dangles
//! across a reconcile.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use crate::service::Service;

/// Identity of a service record: monotonically assigned job id plus an
/// optional instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SvcKey {
    /// Job id, assigned at insert and never reused within a boot.
    pub job: u32,
    /// Instance id; empty for the default instance.
    pub instance: String,
}

impl SvcKey {
    /// Builds a key.
    pub fn new(job: u32, instance: &str) -> Self {
        Self {
            job,
            instance: instance.to_string(),
        }
    }
}

impl fmt::Display for SvcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}", self.job)
        } else {
            write!(f, "{}:{}", self.job, self.instance)
        }
    }
}

/// Owner of all service records.
#[derive(Debug, Default)]
pub struct Registry {
    records: BTreeMap<SvcKey, Service>,
    pids: HashMap<i32, SvcKey>,
    next_job: u32,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record built from a parsed candidate, assigning the next
    /// job id.
    pub fn insert(&mut self, conf: crate::config::SvcConf) -> SvcKey {
        self.next_job += 1;
        let key = SvcKey::new(self.next_job, &conf.instance);
        let svc = Service::new(key.clone(), conf);
        self.records.insert(key.clone(), svc);
        key
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolves a key to its record.
    pub fn get(&self, key: &SvcKey) -> Option<&Service> {
        self.records.get(key)
    }

    /// Resolves a key to its record, mutably.
    pub fn get_mut(&mut self, key: &SvcKey) -> Option<&mut Service> {
        self.records.get_mut(key)
    }

    /// All keys in job order (declaration order, since job ids are assigned
    /// monotonically at parse time).
    pub fn keys(&self) -> Vec<SvcKey> {
        self.records.keys().cloned().collect()
    }

    /// Iterates records in job order.
    pub fn iter(&self) -> impl Iterator<Item = (&SvcKey, &Service)> {
        self.records.iter()
    }

    /// Iterates records mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SvcKey, &mut Service)> {
        self.records.iter_mut()
    }

    /// Find by live process id.
    pub fn by_pid(&self, pid: i32) -> Option<SvcKey> {
        self.pids.get(&pid).cloned()
    }

    /// Records the pid index entry for a key.
    pub fn map_pid(&mut self, pid: i32, key: SvcKey) {
        if pid > 0 {
            self.pids.insert(pid, key);
        }
    }

    /// Clears the pid index entry.
    pub fn unmap_pid(&mut self, pid: i32) {
        self.pids.remove(&pid);
    }

    /// Find by registration name, with an optional instance filter.
    pub fn by_name(&self, name: &str, instance: Option<&str>) -> Vec<SvcKey> {
        self.records
            .iter()
            .filter(|(key, svc)| {
                svc.conf.name == name
                    && instance.is_none_or(|inst| key.instance == inst)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Find by the basename a pidfile event refers to.
    pub fn by_pidfile_basename(&self, basename: &str) -> Option<SvcKey> {
        self.records
            .iter()
            .find(|(_, svc)| {
                svc.pidfile_basename()
                    .is_some_and(|name| name == basename)
            })
            .map(|(key, _)| key.clone())
    }

    /// Every record originating from `origin`.
    pub fn by_origin(&self, origin: &Path) -> Vec<SvcKey> {
        self.records
            .iter()
            .filter(|(_, svc)| svc.conf.origin == origin)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Sets the dynamic mark on every record originating from `origin`.
    pub fn mark_dirty(&mut self, origin: &Path) {
        for svc in self.records.values_mut() {
            if svc.conf.origin == origin {
                svc.dirty = true;
            }
        }
    }

    /// Removes a record, dropping its pid index entry.
    pub fn remove(&mut self, key: &SvcKey) -> Option<Service> {
        let svc = self.records.remove(key)?;
        self.pids.retain(|_, k| k != key);
        Some(svc)
    }

    /// Parses a `name`, `name:instance`, `job`, or `job:instance` selector
    /// into matching keys.
    pub fn select(&self, selector: &str) -> Vec<SvcKey> {
        let (head, instance) = match selector.split_once(':') {
            Some((h, i)) => (h, Some(i)),
            None => (selector, None),
        };

        if let Ok(job) = head.parse::<u32>() {
            return self
                .records
                .keys()
                .filter(|key| {
                    key.job == job && instance.is_none_or(|inst| key.instance == inst)
                })
                .cloned()
                .collect();
        }
        self.by_name(head, instance)
    }
}
