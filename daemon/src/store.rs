//! The current configuration snapshot and the diff against its predecessor.

use alloc::{collections::BTreeMap, sync::Arc};

use tokio::sync::watch;

use crate::model::{AccountSpec, GroupSpec, MountSpec, NodeConfig};

/// Added, changed and removed entries of one keyed domain.
///
/// `added` and `changed` carry the new values, `removed` the old ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDiff<V> {
    pub added: BTreeMap<String, V>,
    pub changed: BTreeMap<String, V>,
    pub removed: BTreeMap<String, V>,
}

impl<V> Default for DomainDiff<V> {
    fn default() -> Self {
        Self {
            added: BTreeMap::new(),
            changed: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }
}

impl<V: Clone + PartialEq> DomainDiff<V> {
    /// Classify every key of `prev` and `next`.
    #[must_use]
    pub fn between(prev: &BTreeMap<String, V>, next: &BTreeMap<String, V>) -> Self {
        let mut diff = Self::default();
        for (key, value) in next {
            match prev.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(old) if old != value => {
                    diff.changed.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for (key, value) in prev {
            if !next.contains_key(key) {
                diff.removed.insert(key.clone(), value.clone());
            }
        }
        diff
    }
}

impl<V> DomainDiff<V> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Added and changed entries, i.e. everything that needs applying.
    pub fn upserts(&self) -> impl Iterator<Item = (&String, &V)> {
        self.added.iter().chain(self.changed.iter())
    }
}

/// Structural difference between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub accounts: DomainDiff<AccountSpec>,
    pub groups: DomainDiff<GroupSpec>,
    pub mounts: DomainDiff<MountSpec>,
    pub root_keys_changed: bool,
    pub hostname_changed: bool,
}

impl SnapshotDiff {
    #[must_use]
    pub fn between(prev: &NodeConfig, next: &NodeConfig) -> Self {
        Self {
            from_version: prev.version,
            to_version: next.version,
            accounts: DomainDiff::between(&prev.accounts, &next.accounts),
            groups: DomainDiff::between(&prev.groups, &next.groups),
            mounts: DomainDiff::between(&prev.mounts, &next.mounts),
            root_keys_changed: prev.root_keys != next.root_keys,
            hostname_changed: prev.hostname != next.hostname,
        }
    }
}

/// Holder of the current [`NodeConfig`].
///
/// Snapshots are swapped as a whole; a reader holding an `Arc` keeps seeing
/// the snapshot it got.
#[derive(Debug)]
pub struct ConfigStore {
    tx: watch::Sender<Arc<NodeConfig>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(NodeConfig::empty()));
        Self { tx }
    }

    #[must_use]
    pub fn current(&self) -> Arc<NodeConfig> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<NodeConfig>> {
        self.tx.subscribe()
    }

    /// Install `next` unless its content equals the current snapshot.
    ///
    /// Returns the installed snapshot with its assigned version and the diff
    /// against the previous one, or `None` if nothing changed.
    pub fn replace(&self, mut next: NodeConfig) -> Option<(Arc<NodeConfig>, Arc<SnapshotDiff>)> {
        let mut installed = None;
        self.tx.send_if_modified(|current| {
            if current.version > 0 && current.content_id == next.content_id {
                return false;
            }
            next.version = current.version + 1;
            let diff = Arc::new(SnapshotDiff::between(current, &next));
            let snapshot = Arc::new(next);
            *current = Arc::clone(&snapshot);
            installed = Some((snapshot, diff));
            true
        });
        installed
    }
}
