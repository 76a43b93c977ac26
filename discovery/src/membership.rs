use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{BackendHandle, BackendRecord};

/// Membership change, broadcast after the table has been updated.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(BackendRecord),
    Left(String),
}

/// Client-local mirror of live backend registrations.
///
/// One writer (the synchronizer) takes the exclusive lock for each mutation;
/// selectors and enumerations take the shared lock. A handle is fully built
/// before it is inserted, so readers never see a partial entry.
#[derive(Debug, Default)]
pub struct MembershipTable {
    backends: RwLock<HashMap<String, Arc<BackendHandle>>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `handle`'s instance id.
    ///
    /// Returns the replaced handle, if any.
    pub fn insert(&self, handle: BackendHandle) -> Option<Arc<BackendHandle>> {
        let id = handle.instance_id().to_string();
        self.backends.write().insert(id, Arc::new(handle))
    }

    /// Remove an entry. Removing an unknown id is a no-op.
    pub fn remove(&self, instance_id: &str) -> Option<Arc<BackendHandle>> {
        self.backends.write().remove(instance_id)
    }

    /// Make the table hold exactly `handles`, in one exclusive section.
    ///
    /// Returns the records that were added or changed and the ids that were
    /// dropped.
    pub fn reconcile(&self, handles: Vec<BackendHandle>) -> (Vec<BackendRecord>, Vec<String>) {
        let mut backends = self.backends.write();

        let keep: HashSet<String> = handles
            .iter()
            .map(|h| h.instance_id().to_string())
            .collect();
        let mut left: Vec<String> = backends
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        left.sort();
        for id in &left {
            backends.remove(id);
        }

        let mut joined = Vec::new();
        for handle in handles {
            let unchanged = backends
                .get(handle.instance_id())
                .is_some_and(|existing| existing.record() == handle.record());
            if !unchanged {
                joined.push(handle.record().clone());
                backends.insert(handle.instance_id().to_string(), Arc::new(handle));
            }
        }

        (joined, left)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<BackendHandle>> {
        self.backends.read().get(instance_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Consistent copy of every handle.
    pub fn snapshot(&self) -> Vec<Arc<BackendHandle>> {
        self.backends.read().values().cloned().collect()
    }

    /// Records sorted by instance id.
    pub fn records(&self) -> Vec<BackendRecord> {
        let mut records: Vec<BackendRecord> = self
            .backends
            .read()
            .values()
            .map(|h| h.record().clone())
            .collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        records
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<BackendHandle>>> {
        self.backends.read()
    }
}
