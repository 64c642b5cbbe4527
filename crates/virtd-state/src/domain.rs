//! Domain collection.
//!
//! The driver treats the collection of managed domains as a self-locking
//! collaborator with a narrow surface; domain lifecycle itself (start,
//! stop, migrate) is handled elsewhere. Entries are shared handles, so a
//! caller holding an `Arc<DomainHandle>` keeps it valid even after the
//! domain leaves the table.

use crate::{relock_read, relock_write};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Immutable identity of one managed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    /// Unique domain name.
    pub name: String,
    /// Stable UUID.
    pub uuid: Uuid,
    /// Runtime id assigned at start, unique for the process lifetime.
    pub runtime_id: u64,
}

impl DomainHandle {
    /// Creates a handle with a fresh UUID.
    #[must_use]
    pub fn new(name: impl Into<String>, runtime_id: u64) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            runtime_id,
        }
    }
}

/// Self-locking collection of domains, keyed by name.
#[derive(Debug, Default)]
pub struct DomainTable {
    domains: RwLock<HashMap<String, Arc<DomainHandle>>>,
}

impl DomainTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a domain. Returns the shared handle, or `None` when the
    /// name is already taken.
    pub fn add(&self, handle: DomainHandle) -> Option<Arc<DomainHandle>> {
        let mut domains = relock_write(&self.domains);
        if domains.contains_key(&handle.name) {
            return None;
        }
        let handle = Arc::new(handle);
        domains.insert(handle.name.clone(), Arc::clone(&handle));
        Some(handle)
    }

    /// Looks a domain up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<DomainHandle>> {
        relock_read(&self.domains).get(name).cloned()
    }

    /// Removes a domain, returning its handle if it was present.
    pub fn remove(&self, name: &str) -> Option<Arc<DomainHandle>> {
        relock_write(&self.domains).remove(name)
    }

    /// Number of domains in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        relock_read(&self.domains).len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        relock_read(&self.domains).is_empty()
    }

    /// Names of all domains, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        relock_read(&self.domains).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_names() {
        let table = DomainTable::new();
        assert!(table.add(DomainHandle::new("vm1", 1)).is_some());
        assert!(table.add(DomainHandle::new("vm1", 2)).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("vm1").unwrap().runtime_id, 1);
    }

    #[test]
    fn handles_outlive_removal() {
        let table = DomainTable::new();
        let handle = table.add(DomainHandle::new("vm1", 1)).unwrap();
        let removed = table.remove("vm1").unwrap();
        assert!(table.is_empty());
        assert_eq!(handle, removed);
        assert_eq!(handle.name, "vm1");
    }
}
