//! Driver-wide state.
//!
//! One [`DriverState`] exists per daemon process. It is built once at
//! startup and passed explicitly to every operation that needs it.
//!
//! Locking summary, field by field:
//! - the configuration slot sits behind its own mutex, held only long
//!   enough to clone the `Arc` — never while the snapshot is used;
//! - the vm-id and active counters are atomics, touched under no lock;
//! - the domain table, shared-disk tracker, close-callback registry and
//!   port allocator are self-locking and safe to call without any
//!   external lock;
//! - the host-device lists enforce their own acquisition order through
//!   [`HostdevRegistry::lock_pci`].
//!
//! No operation here blocks on I/O while holding a lock.

use crate::close_callbacks::{CloseAction, CloseCallbacks, CloseResult};
use crate::config::DriverConfig;
use crate::domain::DomainTable;
use crate::hostdev::HostdevRegistry;
use crate::ports::PortAllocator;
use crate::relock;
use crate::shared_disk::SharedDiskTracker;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Query-only view of the cached hypervisor capabilities.
pub trait CapsCache: Send + Sync {
    /// Whether the hypervisor binary supports a named capability.
    fn supports(&self, capability: &str) -> bool;
}

/// Security driver handle. Implementations synchronize internally.
pub trait SecurityManager: Send + Sync {
    /// Model name of the active security driver (e.g. "selinux", "none").
    fn model(&self) -> &str;
}

/// Lock manager plugin handle. Implementations synchronize internally.
pub trait LockManagerPlugin: Send + Sync {
    /// Name of the plugin (e.g. "lockd", "nop").
    fn name(&self) -> &str;
}

/// No-op collaborators used when nothing richer is wired in.
#[derive(Debug, Default)]
struct NullCollaborator;

impl CapsCache for NullCollaborator {
    fn supports(&self, _capability: &str) -> bool {
        false
    }
}

impl SecurityManager for NullCollaborator {
    fn model(&self) -> &str {
        "none"
    }
}

impl LockManagerPlugin for NullCollaborator {
    fn name(&self) -> &str {
        "nop"
    }
}

/// The per-process driver state singleton.
pub struct DriverState {
    /// Current configuration snapshot. Lock, clone the Arc, unlock.
    config: Mutex<Arc<DriverConfig>>,

    /// Next runtime id handed to a starting domain. Atomic increment
    /// only; never reused within the process lifetime.
    next_vm_id: AtomicU64,
    /// Count of running domains. Atomic inc/dec only, never adjusted
    /// under a lock.
    active: AtomicU32,

    domains: DomainTable,
    hostdevs: HostdevRegistry,
    shared_disks: SharedDiskTracker,
    close_callbacks: CloseCallbacks,
    remote_ports: PortAllocator,

    security: Arc<dyn SecurityManager>,
    caps: Arc<dyn CapsCache>,
    lock_manager: Arc<dyn LockManagerPlugin>,
}

impl DriverState {
    /// Creates the driver state around an initial configuration snapshot,
    /// with no-op collaborators.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        let null = Arc::new(NullCollaborator);
        Self::with_collaborators(
            config,
            Arc::clone(&null) as Arc<dyn SecurityManager>,
            Arc::clone(&null) as Arc<dyn CapsCache>,
            null as Arc<dyn LockManagerPlugin>,
        )
    }

    /// Creates the driver state with explicit collaborator handles.
    #[must_use]
    pub fn with_collaborators(
        config: DriverConfig,
        security: Arc<dyn SecurityManager>,
        caps: Arc<dyn CapsCache>,
        lock_manager: Arc<dyn LockManagerPlugin>,
    ) -> Self {
        let remote_ports = PortAllocator::new(config.remote_port_min, config.remote_port_max);
        info!(
            privileged = config.privileged,
            security = security.model(),
            lock_manager = lock_manager.name(),
            "driver state initialized"
        );
        Self {
            config: Mutex::new(Arc::new(config)),
            next_vm_id: AtomicU64::new(1),
            active: AtomicU32::new(0),
            domains: DomainTable::new(),
            hostdevs: HostdevRegistry::new(),
            shared_disks: SharedDiskTracker::new(),
            close_callbacks: CloseCallbacks::new(),
            remote_ports,
            security,
            caps,
            lock_manager,
        }
    }

    /// Takes a reference to the currently published configuration.
    ///
    /// The internal lock is held only for the Arc clone; callers may keep
    /// the returned snapshot for the full duration of a long operation
    /// without blocking reloads, and keep seeing the values that were
    /// current when they acquired it.
    #[must_use]
    pub fn config(&self) -> Arc<DriverConfig> {
        Arc::clone(&relock(&self.config))
    }

    /// Publishes a new configuration snapshot, replacing the current one.
    ///
    /// References already handed out stay valid; the old snapshot is
    /// dropped when its last holder releases it.
    pub fn publish(&self, config: DriverConfig) {
        info!(privileged = config.privileged, "publishing new configuration");
        let next = Arc::new(config);
        let mut current = relock(&self.config);
        *current = next;
    }

    /// Allocates the next domain runtime id. Ids are distinct and
    /// contiguous for the lifetime of the process.
    pub fn next_id(&self) -> u64 {
        self.next_vm_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Notes one more running domain.
    pub fn active_count_inc(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Notes one fewer running domain.
    pub fn active_count_dec(&self) {
        let prev = self.active.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "active count underflow");
    }

    /// Current number of running domains.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// The domain collection.
    #[must_use]
    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    /// The host-device lists.
    #[must_use]
    pub fn hostdevs(&self) -> &HostdevRegistry {
        &self.hostdevs
    }

    /// Locks both PCI host-device lists, active before inactive. The sole
    /// entry point for code paths that need the pair.
    pub fn lock_hostdevs(&self) -> crate::hostdev::PciListsGuard<'_> {
        self.hostdevs.lock_pci()
    }

    /// The shared-disk tracker.
    #[must_use]
    pub fn shared_disks(&self) -> &SharedDiskTracker {
        &self.shared_disks
    }

    /// The close-callback registry.
    #[must_use]
    pub fn close_callbacks(&self) -> &CloseCallbacks {
        &self.close_callbacks
    }

    /// The migration port allocator.
    #[must_use]
    pub fn remote_ports(&self) -> &PortAllocator {
        &self.remote_ports
    }

    /// The security manager handle.
    #[must_use]
    pub fn security(&self) -> &Arc<dyn SecurityManager> {
        &self.security
    }

    /// The capabilities cache handle.
    #[must_use]
    pub fn caps(&self) -> &Arc<dyn CapsCache> {
        &self.caps
    }

    /// The lock manager plugin handle.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<dyn LockManagerPlugin> {
        &self.lock_manager
    }

    /// Dispatches one close action against the driver.
    ///
    /// Called by [`CloseCallbacks::run_all`] after the registry lock has
    /// been released; actions operate freely on driver state but have no
    /// path back into the registry.
    pub(crate) fn run_close_action(&self, domain: &str, action: CloseAction) -> CloseResult {
        match action {
            CloseAction::DestroyTransient => {
                let Some(handle) = self.domains.remove(domain) else {
                    warn!(domain, "close action for unknown domain");
                    return CloseResult::DomainMissing;
                };
                self.active_count_dec();
                self.remote_ports.release_owner(domain);
                let disks = self.shared_disks.detach_all(domain);
                info!(
                    domain,
                    runtime_id = handle.runtime_id,
                    disks = disks.len(),
                    "transient domain destroyed on connection close"
                );
                CloseResult::DomainRemoved
            }
            CloseAction::AbortMigration => {
                if self.domains.get(domain).is_none() {
                    warn!(domain, "close action for unknown domain");
                    return CloseResult::DomainMissing;
                }
                let released = self.remote_ports.release_owner(domain);
                info!(domain, released, "incoming migration aborted");
                CloseResult::DomainKept
            }
            CloseAction::ReleaseSharedDisks => {
                if self.domains.get(domain).is_none() {
                    warn!(domain, "close action for unknown domain");
                    return CloseResult::DomainMissing;
                }
                let disks = self.shared_disks.detach_all(domain);
                debug!(domain, disks = disks.len(), "shared disks released");
                CloseResult::DomainKept
            }
        }
    }
}
