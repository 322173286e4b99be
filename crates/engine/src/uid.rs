//! Uid mapping service
//!
//! Tracks installed packages per uid and the isolated-to-host uid mapping.
//! Process-wide: the processor holds one instance and passes it to
//! managers; all operations are internally locked so callers never hold
//! engine locks around it.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tally_config::ConfigKey;

use crate::report::UidSnapshotEntry;

/// Well-known principals resolvable without an installed package
const WELL_KNOWN_UIDS: &[(&str, i32)] = &[
    ("root", 0),
    ("system", 1000),
    ("tally", crate::atoms::ENGINE_UID),
];

#[derive(Debug, Default)]
struct UidMapState {
    /// isolated uid -> host uid
    isolated: HashMap<i32, i32>,
    /// package name -> uids it runs as
    packages: HashMap<String, HashSet<i32>>,
    /// (uid, package) -> version
    versions: HashMap<(i32, String), i64>,
    /// configs tracking uid-map deltas for their reports
    tracked_configs: HashSet<ConfigKey>,
}

/// The uid lookup service
#[derive(Debug, Default)]
pub struct UidMap {
    state: RwLock<UidMapState>,
}

impl UidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a well-known principal name
    pub fn well_known_uid(package: &str) -> Option<i32> {
        WELL_KNOWN_UIDS
            .iter()
            .find(|(name, _)| *name == package)
            .map(|(_, uid)| *uid)
    }

    pub fn assign_isolated_uid(&self, isolated_uid: i32, host_uid: i32) {
        self.state.write().isolated.insert(isolated_uid, host_uid);
    }

    pub fn remove_isolated_uid(&self, isolated_uid: i32) {
        self.state.write().isolated.remove(&isolated_uid);
    }

    /// The host uid for an isolated uid, or the uid itself
    pub fn host_uid_or_self(&self, uid: i32) -> i32 {
        self.state.read().isolated.get(&uid).copied().unwrap_or(uid)
    }

    pub fn add_app(&self, uid: i32, package: &str, version: i64) {
        let mut state = self.state.write();
        state.packages.entry(package.to_string()).or_default().insert(uid);
        state.versions.insert((uid, package.to_string()), version);
    }

    pub fn remove_app(&self, uid: i32, package: &str) {
        let mut state = self.state.write();
        if let Some(uids) = state.packages.get_mut(package) {
            uids.remove(&uid);
            if uids.is_empty() {
                state.packages.remove(package);
            }
        }
        state.versions.remove(&(uid, package.to_string()));
    }

    /// Every uid a package runs as
    pub fn package_uids(&self, package: &str) -> HashSet<i32> {
        self.state
            .read()
            .packages
            .get(package)
            .cloned()
            .unwrap_or_default()
    }

    pub fn on_config_updated(&self, key: ConfigKey) {
        self.state.write().tracked_configs.insert(key);
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        self.state.write().tracked_configs.remove(&key);
    }

    pub fn is_tracking(&self, key: &ConfigKey) -> bool {
        self.state.read().tracked_configs.contains(key)
    }

    /// Installed-package entries for report snapshots
    pub fn snapshot_entries(&self) -> Vec<UidSnapshotEntry> {
        let state = self.state.read();
        let mut entries: Vec<UidSnapshotEntry> = state
            .versions
            .iter()
            .map(|((uid, package), version)| UidSnapshotEntry {
                uid: *uid,
                package: package.clone(),
                version: *version,
            })
            .collect();
        entries.sort_by(|a, b| (a.uid, &a.package).cmp(&(b.uid, &b.package)));
        entries
    }
}
