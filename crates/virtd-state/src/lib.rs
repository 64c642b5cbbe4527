//! # virtd-state
//!
//! Driver state and resource-safety core for the virtd daemon.
//!
//! This crate holds the shared state every worker thread of the daemon
//! goes through:
//!
//! - Immutable, reference-counted configuration snapshots
//! - The per-process driver state with its lock hierarchy and counters
//! - Host-device (PCI/USB) assignment lists with structural lock ordering
//! - Shared-disk usage tracking for cross-domain disk-safety policy
//! - Close callbacks tied to a (domain, connection) pair
//!
//! ## Concurrency contract
//!
//! Locks here are held briefly and never across I/O. The driver lock
//! exists only to swap or clone the current configuration `Arc`. The
//! registries (domains, shared disks, close callbacks, ports) synchronize
//! internally. The one ordered pair of locks in the system — the active
//! and inactive PCI lists — can only be taken through
//! [`HostdevRegistry::lock_pci`], which fixes the order.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod close_callbacks;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod hostdev;
pub mod ports;
pub mod shared_disk;

pub use close_callbacks::{CloseAction, CloseCallbacks, CloseResult, ConnectionId};
pub use config::{DriverConfig, SeccompPolicy, SpiceConfig, VncConfig};
pub use domain::{DomainHandle, DomainTable};
pub use driver::{CapsCache, DriverState, LockManagerPlugin, SecurityManager};
pub use error::{CallbackError, ConfigError, SharedDiskError};
pub use hostdev::{HostdevRegistry, PciAddress, PciListsGuard, UsbAddress};
pub use ports::PortAllocator;
pub use shared_disk::{DiskKey, SharedDiskTracker};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Poisoning is cleared, not propagated: every guarded map is consistent
// between any two operations.

pub(crate) fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn relock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn relock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
