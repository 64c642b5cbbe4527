//! Shared-disk usage tracking.
//!
//! Before handing a disk that may be attached to several domains to the
//! hypervisor, the attach path records the (disk, domain) pair here; the
//! detach path removes it. Policy checks ask the tracker who else holds a
//! disk before permitting a conflicting attach. The tracker is
//! self-synchronizing and callable without any external lock.

use crate::error::SharedDiskError;
use crate::relock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Normalized identity of a disk shared between domains.
///
/// Built by lexical canonicalization only: `.` and empty components drop,
/// `..` pops, separators collapse. No filesystem access happens, so key
/// construction is a pure function; callers that need symlink identity
/// resolve the path before building the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskKey(PathBuf);

impl DiskKey {
    /// Canonicalizes `path` into a stable comparison key.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut out = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        Self(out)
    }

    /// The canonical path backing this key.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for DiskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug)]
struct SharedDiskEntry {
    /// Domains currently attached, in attach order.
    domains: Vec<String>,
    /// Net attach count; the entry is dropped when it reaches zero.
    refs: usize,
}

/// Tracks which domains currently use each shared disk.
#[derive(Debug, Default)]
pub struct SharedDiskTracker {
    entries: Mutex<HashMap<DiskKey, SharedDiskEntry>>,
}

impl SharedDiskTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `domain` attached the disk behind `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SharedDiskError::AlreadyAttached`] when this exact pair is
    /// already recorded; membership and counts are left untouched so a
    /// caller may treat the duplicate as success.
    pub fn add(&self, key: &DiskKey, domain: &str) -> Result<(), SharedDiskError> {
        let mut entries = relock(&self.entries);
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(disk = %key, "tracking new shared disk");
            SharedDiskEntry {
                domains: Vec::new(),
                refs: 0,
            }
        });

        if entry.domains.iter().any(|d| d == domain) {
            return Err(SharedDiskError::AlreadyAttached {
                key: key.to_string(),
                domain: domain.to_string(),
            });
        }

        entry.domains.push(domain.to_string());
        entry.refs += 1;
        Ok(())
    }

    /// Records that `domain` detached the disk behind `key`. The entry is
    /// deleted entirely once its count returns to zero.
    ///
    /// # Errors
    ///
    /// Returns [`SharedDiskError::NotAttached`] when the pair is absent.
    pub fn remove(&self, key: &DiskKey, domain: &str) -> Result<(), SharedDiskError> {
        let mut entries = relock(&self.entries);
        let not_attached = || SharedDiskError::NotAttached {
            key: key.to_string(),
            domain: domain.to_string(),
        };

        let entry = entries.get_mut(key).ok_or_else(not_attached)?;
        let index = entry
            .domains
            .iter()
            .position(|d| d == domain)
            .ok_or_else(not_attached)?;

        entry.domains.remove(index);
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
            tracing::debug!(disk = %key, "shared disk no longer in use");
        }
        Ok(())
    }

    /// Returns the membership index of `domain` on `key`, if attached.
    #[must_use]
    pub fn contains(&self, key: &DiskKey, domain: &str) -> Option<usize> {
        relock(&self.entries)
            .get(key)?
            .domains
            .iter()
            .position(|d| d == domain)
    }

    /// Domains attached to `key`, in attach order.
    #[must_use]
    pub fn holders(&self, key: &DiskKey) -> Vec<String> {
        relock(&self.entries)
            .get(key)
            .map(|e| e.domains.clone())
            .unwrap_or_default()
    }

    /// Drops every membership `domain` holds, returning the affected keys.
    /// Used by connection-close cleanup when a domain goes away without
    /// orderly detaches.
    pub fn detach_all(&self, domain: &str) -> Vec<DiskKey> {
        let mut entries = relock(&self.entries);
        let mut affected = Vec::new();

        entries.retain(|key, entry| {
            let Some(index) = entry.domains.iter().position(|d| d == domain) else {
                return true;
            };
            entry.domains.remove(index);
            entry.refs -= 1;
            affected.push(key.clone());
            entry.refs > 0
        });

        affected
    }

    /// Number of disks currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        relock(&self.entries).len()
    }

    /// Whether no disk is currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        relock(&self.entries).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization_is_lexical() {
        assert_eq!(DiskKey::new("/dev/sdb"), DiskKey::new("/dev//sdb"));
        assert_eq!(DiskKey::new("/dev/./sdb"), DiskKey::new("/dev/sdb"));
        assert_eq!(DiskKey::new("/dev/disk/../sdb"), DiskKey::new("/dev/sdb"));
        assert_ne!(DiskKey::new("/dev/sdb"), DiskKey::new("/dev/sdc"));
    }

    #[test]
    fn double_add_reports_already_attached() {
        let tracker = SharedDiskTracker::new();
        let key = DiskKey::new("/dev/sdb");

        tracker.add(&key, "vm1").unwrap();
        let err = tracker.add(&key, "vm1").unwrap_err();
        assert!(matches!(err, SharedDiskError::AlreadyAttached { .. }));

        // The duplicate must not change membership.
        assert_eq!(tracker.holders(&key), vec!["vm1".to_string()]);
        tracker.remove(&key, "vm1").unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn attach_detach_lifecycle_across_two_domains() {
        let tracker = SharedDiskTracker::new();
        let key = DiskKey::new("/dev/sdb");

        tracker.add(&key, "vm1").unwrap();
        tracker.add(&key, "vm2").unwrap();
        assert_eq!(tracker.contains(&key, "vm1"), Some(0));
        assert_eq!(tracker.contains(&key, "vm2"), Some(1));

        tracker.remove(&key, "vm1").unwrap();
        assert_eq!(tracker.contains(&key, "vm1"), None);
        assert_eq!(tracker.holders(&key), vec!["vm2".to_string()]);

        tracker.remove(&key, "vm2").unwrap();
        assert_eq!(tracker.contains(&key, "vm2"), None);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn remove_unknown_pair_fails() {
        let tracker = SharedDiskTracker::new();
        let key = DiskKey::new("/dev/sdb");

        assert!(matches!(
            tracker.remove(&key, "vm1"),
            Err(SharedDiskError::NotAttached { .. })
        ));

        tracker.add(&key, "vm1").unwrap();
        assert!(matches!(
            tracker.remove(&key, "vm2"),
            Err(SharedDiskError::NotAttached { .. })
        ));
    }

    #[test]
    fn detach_all_clears_every_membership() {
        let tracker = SharedDiskTracker::new();
        let sdb = DiskKey::new("/dev/sdb");
        let sdc = DiskKey::new("/dev/sdc");

        tracker.add(&sdb, "vm1").unwrap();
        tracker.add(&sdb, "vm2").unwrap();
        tracker.add(&sdc, "vm1").unwrap();

        let mut affected = tracker.detach_all("vm1");
        affected.sort();
        assert_eq!(affected, vec![sdb.clone(), sdc.clone()]);

        assert_eq!(tracker.contains(&sdb, "vm2"), Some(0));
        assert_eq!(tracker.contains(&sdc, "vm1"), None);
        assert_eq!(tracker.len(), 1);
    }
}
