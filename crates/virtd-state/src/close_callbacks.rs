//! Close-callback registry.
//!
//! Subsystems that must clean up after a domain when a client connection
//! goes away register a [`CloseAction`] against the (domain, connection)
//! pair. When the connection terminates, [`CloseCallbacks::run_all`] drains
//! the matching entries and dispatches each action against the driver.
//!
//! Actions are named variants rather than function pointers, so
//! [`CloseCallbacks::unset`]'s "only remove what you registered" contract
//! is an ordinary equality check. Dispatch happens strictly after the
//! registry lock is released; an action can touch the domain table, the
//! shared-disk tracker, or any other driver state, but it is never given a
//! way back into this registry while iteration is in progress.

use crate::driver::DriverState;
use crate::error::CallbackError;
use crate::relock;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Identity of one client connection to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw connection number.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw connection number.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Cleanup action to run for a domain when its owning connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseAction {
    /// Tear the transient domain down entirely.
    DestroyTransient,
    /// Roll back an unfinished incoming migration, releasing the
    /// migration ports the domain holds.
    AbortMigration,
    /// Drop the shared-disk memberships recorded for the domain.
    ReleaseSharedDisks,
}

/// Outcome of dispatching a single close action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseResult {
    /// The domain survived the action.
    DomainKept,
    /// The action removed the domain from the driver.
    DomainRemoved,
    /// The domain was already gone when the action ran.
    DomainMissing,
}

#[derive(Debug)]
struct CloseEntry {
    conn: ConnectionId,
    action: CloseAction,
}

/// Registry of pending close actions, keyed by domain name.
///
/// Self-synchronizing; callers never take an external lock.
#[derive(Debug, Default)]
pub struct CloseCallbacks {
    entries: Mutex<HashMap<String, CloseEntry>>,
}

impl CloseCallbacks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` for `domain` on behalf of `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::AlreadySet`] if any action is already
    /// registered for the domain; callbacks never silently stack.
    pub fn set(
        &self,
        domain: &str,
        conn: ConnectionId,
        action: CloseAction,
    ) -> Result<(), CallbackError> {
        let mut entries = relock(&self.entries);
        if entries.contains_key(domain) {
            return Err(CallbackError::AlreadySet(domain.to_string()));
        }
        debug!(domain, %conn, ?action, "close callback registered");
        entries.insert(domain.to_string(), CloseEntry { conn, action });
        Ok(())
    }

    /// Removes the entry for `domain`, but only if the registered action
    /// equals `action` — a caller cannot unregister a callback it does not
    /// own.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::NotFound`] when no entry exists or the
    /// action does not match; a mismatch leaves the entry intact.
    pub fn unset(&self, domain: &str, action: &CloseAction) -> Result<(), CallbackError> {
        let mut entries = relock(&self.entries);
        match entries.get(domain) {
            Some(entry) if entry.action == *action => {
                entries.remove(domain);
                debug!(domain, "close callback unregistered");
                Ok(())
            }
            _ => Err(CallbackError::NotFound(domain.to_string())),
        }
    }

    /// Looks up the action registered for (`domain`, `conn`).
    #[must_use]
    pub fn get(&self, domain: &str, conn: ConnectionId) -> Option<CloseAction> {
        let entries = relock(&self.entries);
        let entry = entries.get(domain)?;
        (entry.conn == conn).then(|| entry.action.clone())
    }

    /// Number of entries currently registered for `conn`.
    #[must_use]
    pub fn pending(&self, conn: ConnectionId) -> usize {
        relock(&self.entries)
            .values()
            .filter(|e| e.conn == conn)
            .count()
    }

    /// Runs every action registered for `conn` and removes the entries.
    ///
    /// Entries are drained from the map while the registry lock is held,
    /// then dispatched one by one after it is released. Dispatch continues
    /// over every drained entry regardless of individual outcomes,
    /// including actions that report the domain already removed.
    pub fn run_all(&self, conn: ConnectionId, driver: &DriverState) {
        let drained: Vec<(String, CloseAction)> = {
            let mut entries = relock(&self.entries);
            let domains: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.conn == conn)
                .map(|(domain, _)| domain.clone())
                .collect();
            domains
                .into_iter()
                .filter_map(|domain| {
                    let entry = entries.remove(&domain)?;
                    Some((domain, entry.action))
                })
                .collect()
        };

        debug!(%conn, count = drained.len(), "running close callbacks");
        for (domain, action) in drained {
            let result = driver.run_close_action(&domain, action);
            debug!(domain, %conn, ?result, "close callback finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: ConnectionId = ConnectionId(7);

    #[test]
    fn set_then_get_roundtrips() {
        let callbacks = CloseCallbacks::new();
        callbacks
            .set("vm1", CONN, CloseAction::DestroyTransient)
            .unwrap();
        assert_eq!(
            callbacks.get("vm1", CONN),
            Some(CloseAction::DestroyTransient)
        );
        // A different connection sees nothing.
        assert_eq!(callbacks.get("vm1", ConnectionId::new(8)), None);
    }

    #[test]
    fn second_set_for_same_domain_fails() {
        let callbacks = CloseCallbacks::new();
        callbacks
            .set("vm1", CONN, CloseAction::DestroyTransient)
            .unwrap();
        assert_eq!(
            callbacks.set("vm1", CONN, CloseAction::AbortMigration),
            Err(CallbackError::AlreadySet("vm1".to_string()))
        );
        // The original registration survives.
        assert_eq!(
            callbacks.get("vm1", CONN),
            Some(CloseAction::DestroyTransient)
        );
    }

    #[test]
    fn unset_requires_matching_action() {
        let callbacks = CloseCallbacks::new();
        callbacks
            .set("vm1", CONN, CloseAction::AbortMigration)
            .unwrap();

        assert_eq!(
            callbacks.unset("vm1", &CloseAction::DestroyTransient),
            Err(CallbackError::NotFound("vm1".to_string()))
        );
        assert_eq!(
            callbacks.get("vm1", CONN),
            Some(CloseAction::AbortMigration)
        );

        callbacks
            .unset("vm1", &CloseAction::AbortMigration)
            .unwrap();
        assert_eq!(callbacks.get("vm1", CONN), None);
        assert_eq!(
            callbacks.unset("vm1", &CloseAction::AbortMigration),
            Err(CallbackError::NotFound("vm1".to_string()))
        );
    }
}
