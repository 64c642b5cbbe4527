//! Migration port allocation.
//!
//! Self-locking allocator over the configured remote migration port range.
//! Ports are tagged with an owner (the domain they were allocated for) so
//! abandoned migrations can be cleaned up in one call.

use crate::relock;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Self-locking allocator for a contiguous port range.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    /// Port → owner.
    taken: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    /// Creates an allocator over `min..=max`.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            taken: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the lowest free port in the range for `owner`. Returns
    /// `None` when the range is exhausted.
    pub fn acquire(&self, owner: &str) -> Option<u16> {
        let mut taken = relock(&self.taken);
        let port = (self.min..=self.max).find(|p| !taken.contains_key(p))?;
        taken.insert(port, owner.to_string());
        debug!(port, owner, "migration port reserved");
        Some(port)
    }

    /// Releases one port held by `owner`. Returns `false` when the port
    /// is free or held by someone else.
    pub fn release(&self, owner: &str, port: u16) -> bool {
        let mut taken = relock(&self.taken);
        match taken.get(&port) {
            Some(holder) if holder == owner => {
                taken.remove(&port);
                debug!(port, owner, "migration port released");
                true
            }
            _ => false,
        }
    }

    /// Releases every port held by `owner`, returning how many there were.
    pub fn release_owner(&self, owner: &str) -> usize {
        let mut taken = relock(&self.taken);
        let before = taken.len();
        taken.retain(|_, holder| holder != owner);
        let released = before - taken.len();
        if released > 0 {
            debug!(owner, released, "migration ports reclaimed");
        }
        released
    }

    /// Number of ports currently reserved.
    #[must_use]
    pub fn in_use(&self) -> usize {
        relock(&self.taken).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_lowest_free_port() {
        let ports = PortAllocator::new(49152, 49155);
        assert_eq!(ports.acquire("vm1"), Some(49152));
        assert_eq!(ports.acquire("vm1"), Some(49153));
        assert_eq!(ports.acquire("vm2"), Some(49154));

        assert!(ports.release("vm1", 49152));
        assert_eq!(ports.acquire("vm2"), Some(49152));
    }

    #[test]
    fn exhausted_range_returns_none() {
        let ports = PortAllocator::new(49152, 49153);
        assert!(ports.acquire("vm1").is_some());
        assert!(ports.acquire("vm1").is_some());
        assert_eq!(ports.acquire("vm1"), None);
    }

    #[test]
    fn release_checks_ownership() {
        let ports = PortAllocator::new(49152, 49155);
        let port = ports.acquire("vm1").unwrap();
        assert!(!ports.release("vm2", port));
        assert!(ports.release("vm1", port));
        assert!(!ports.release("vm1", port));
    }

    #[test]
    fn release_owner_reclaims_everything() {
        let ports = PortAllocator::new(49152, 49155);
        ports.acquire("vm1").unwrap();
        ports.acquire("vm2").unwrap();
        ports.acquire("vm1").unwrap();

        assert_eq!(ports.release_owner("vm1"), 2);
        assert_eq!(ports.release_owner("vm1"), 0);
        assert_eq!(ports.in_use(), 1);
    }
}
