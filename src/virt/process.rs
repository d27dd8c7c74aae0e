//! Virtual process registry.
//!
//! One record per `(package, user)` key describing a virtualized running
//! instance. A record goes through two states:
//!
//! - **pending**: created by [`ProcessRegistry::start`], no handle yet
//! - **alive**: [`ProcessRegistry::mark_alive`] attached the real process handle
//!
//! `start` is an atomic check-then-insert: while a record (pending or alive)
//! exists for a key, every other `start` attaches to it instead of creating a
//! second one, so two concurrent launches can never produce two live handles.
//! Each record carries a `launch_id` generation so a slow launcher cannot
//! resurrect a record that was killed while it was spawning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::virt::identity::VirtualIdentity;
use crate::virt::launcher::{ProcessHandle, ProcessLauncher};
use crate::virt::package::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey {
    pub package_id: String,
    pub user_id: u32,
}

impl ProcessKey {
    pub fn new(package_id: impl Into<String>, user_id: u32) -> Self {
        Self {
            package_id: package_id.into(),
            user_id,
        }
    }
}

/// One virtualized process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualProcessRecord {
    pub package_id: String,
    pub user_id: u32,
    pub launch_id: u64,
    pub process_handle: Option<ProcessHandle>,
    pub alive: bool,
    pub started_at: u64,
}

impl VirtualProcessRecord {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.package_id.clone(), self.user_id)
    }

    pub fn identity(&self) -> VirtualIdentity {
        VirtualIdentity::new(self.package_id.clone(), self.user_id)
    }
}

/// What [`ProcessRegistry::start`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh pending record; the caller must start the real process.
    Created(VirtualProcessRecord),
    /// A record already existed and was returned unchanged.
    Attached(VirtualProcessRecord),
}

impl StartOutcome {
    pub fn record(&self) -> &VirtualProcessRecord {
        match self {
            Self::Created(record) | Self::Attached(record) => record,
        }
    }

    pub fn into_record(self) -> VirtualProcessRecord {
        match self {
            Self::Created(record) | Self::Attached(record) => record,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Concurrent map of virtual process records.
pub struct ProcessRegistry {
    records: DashMap<ProcessKey, VirtualProcessRecord>,
    next_launch_id: AtomicU64,
    launcher: Arc<dyn ProcessLauncher>,
}

impl ProcessRegistry {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            records: DashMap::new(),
            next_launch_id: AtomicU64::new(1),
            launcher,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    /// Returns the existing record for the key, or inserts a pending one.
    pub fn start(&self, package_id: &str, user_id: u32) -> StartOutcome {
        match self.records.entry(ProcessKey::new(package_id, user_id)) {
            Entry::Occupied(existing) => StartOutcome::Attached(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let record = VirtualProcessRecord {
                    package_id: package_id.to_string(),
                    user_id,
                    launch_id: self.next_launch_id.fetch_add(1, Ordering::Relaxed),
                    process_handle: None,
                    alive: false,
                    started_at: now_millis(),
                };
                vacant.insert(record.clone());
                StartOutcome::Created(record)
            }
        }
    }

    /// Attaches `handle` to the pending record created with `launch_id`.
    ///
    /// Returns `false` if that record no longer exists (killed or replaced).
    pub fn mark_alive(&self, key: &ProcessKey, launch_id: u64, handle: ProcessHandle) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) if record.launch_id == launch_id => {
                record.process_handle = Some(handle);
                record.alive = true;
                true
            }
            _ => false,
        }
    }

    /// Drops the pending record created with `launch_id` after a failed launch.
    pub fn abandon(&self, key: &ProcessKey, launch_id: u64) -> bool {
        self.records
            .remove_if(key, |_, record| record.launch_id == launch_id && !record.alive)
            .is_some()
    }

    /// Removes the record and terminates its process.
    ///
    /// Termination failures are logged and swallowed; the record is removed
    /// regardless. Returns `true` if a record existed.
    pub fn kill(&self, package_id: &str, user_id: u32) -> bool {
        let Some((key, record)) = self.records.remove(&ProcessKey::new(package_id, user_id)) else {
            return false;
        };

        if let Some(handle) = record.process_handle {
            match self.launcher.terminate(&handle) {
                Ok(()) => tracing::info!("Killed {}:{} (pid {})", key.package_id, key.user_id, handle.pid),
                Err(e) => tracing::debug!(
                    "Terminating pid {} for {}:{} failed, record dropped anyway: {:#}",
                    handle.pid,
                    key.package_id,
                    key.user_id,
                    e
                ),
            }
        }
        true
    }

    pub fn is_running(&self, package_id: &str, user_id: u32) -> bool {
        self.records
            .get(&ProcessKey::new(package_id, user_id))
            .is_some_and(|record| record.alive)
    }

    pub fn get(&self, package_id: &str, user_id: u32) -> Option<VirtualProcessRecord> {
        self.records
            .get(&ProcessKey::new(package_id, user_id))
            .map(|record| record.clone())
    }

    /// User ids that have a record (pending or alive) for `package_id`.
    pub fn users_of(&self, package_id: &str) -> Vec<u32> {
        let mut users: Vec<u32> = self
            .records
            .iter()
            .filter(|entry| entry.key().package_id == package_id)
            .map(|entry| entry.key().user_id)
            .collect();
        users.sort_unstable();
        users
    }

    /// All records, ordered by key.
    pub fn snapshot(&self) -> Vec<VirtualProcessRecord> {
        let mut records: Vec<VirtualProcessRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }

    /// Identity of the live virtual process running as `pid`.
    pub fn identity_of_pid(&self, pid: u32) -> Option<VirtualIdentity> {
        self.records
            .iter()
            .find(|entry| entry.alive && entry.process_handle.is_some_and(|h| h.pid == pid))
            .map(|entry| entry.identity())
    }

    /// Drops records whose process has exited. Returns the reaped keys.
    pub fn reap(&self) -> Vec<ProcessKey> {
        let live: Vec<(ProcessKey, u64, ProcessHandle)> = self
            .records
            .iter()
            .filter_map(|entry| {
                let handle = entry.process_handle?;
                entry
                    .alive
                    .then(|| (entry.key().clone(), entry.launch_id, handle))
            })
            .collect();

        let mut reaped = Vec::new();
        for (key, launch_id, handle) in live {
            if self.launcher.is_alive(&handle) {
                continue;
            }
            if self
                .records
                .remove_if(&key, |_, record| record.launch_id == launch_id)
                .is_some()
            {
                tracing::info!("{}:{} exited (pid {})", key.package_id, key.user_id, handle.pid);
                reaped.push(key);
            }
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
