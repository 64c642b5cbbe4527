//! Host-device assignment lists.
//!
//! PCI devices assigned to a running domain live on the active list;
//! devices detached from the host and available for assignment live on the
//! inactive list. A device identity appears on at most one of the two.
//!
//! Lock order: whenever both PCI lists are needed, the active list must be
//! locked before the inactive list. The registry exposes no way to do it
//! the other way round — [`HostdevRegistry::lock_pci`] is the only entry
//! point that touches both, and its guard releases them in reverse order
//! on every exit path.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::relock;

/// PCI device address (domain:bus:slot.function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    /// PCI domain.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Slot number.
    pub slot: u8,
    /// Function number.
    pub function: u8,
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// USB device address (bus:device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbAddress {
    /// Bus number.
    pub bus: u16,
    /// Device number on the bus.
    pub device: u16,
}

impl std::fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.device)
    }
}

/// Active and inactive host-device lists.
#[derive(Debug, Default)]
pub struct HostdevRegistry {
    active_pci: Mutex<Vec<PciAddress>>,
    inactive_pci: Mutex<Vec<PciAddress>>,
    active_usb: Mutex<Vec<UsbAddress>>,
}

impl HostdevRegistry {
    /// Creates a registry with empty lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks both PCI lists, active before inactive, and returns a single
    /// guard over the pair. This is the only way to hold both lists.
    pub fn lock_pci(&self) -> PciListsGuard<'_> {
        let active = relock(&self.active_pci);
        let inactive = relock(&self.inactive_pci);
        PciListsGuard { inactive, active }
    }

    /// Whether a PCI device is currently assigned to a domain. Locks the
    /// active list only.
    #[must_use]
    pub fn pci_active(&self, addr: PciAddress) -> bool {
        relock(&self.active_pci).contains(&addr)
    }

    /// Marks a USB device as in use by a domain. Returns `false` when it
    /// is already claimed.
    pub fn claim_usb(&self, addr: UsbAddress) -> bool {
        let mut active = relock(&self.active_usb);
        if active.contains(&addr) {
            return false;
        }
        active.push(addr);
        true
    }

    /// Releases a USB device. Returns `false` when it was not claimed.
    pub fn release_usb(&self, addr: UsbAddress) -> bool {
        let mut active = relock(&self.active_usb);
        match active.iter().position(|a| *a == addr) {
            Some(index) => {
                active.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether a USB device is currently claimed.
    #[must_use]
    pub fn usb_active(&self, addr: UsbAddress) -> bool {
        relock(&self.active_usb).contains(&addr)
    }
}

/// Scoped guard over both PCI lists.
///
/// Mutations go through this guard so the at-most-one-list invariant holds
/// under a consistent view of both lists.
#[derive(Debug)]
pub struct PciListsGuard<'a> {
    // Field order is drop order: the inactive list unlocks first, the
    // reverse of acquisition.
    inactive: MutexGuard<'a, Vec<PciAddress>>,
    active: MutexGuard<'a, Vec<PciAddress>>,
}

impl PciListsGuard<'_> {
    /// Registers a device as detached from the host and available.
    /// Returns `false` if it is already on either list.
    pub fn add_inactive(&mut self, addr: PciAddress) -> bool {
        if self.active.contains(&addr) || self.inactive.contains(&addr) {
            return false;
        }
        self.inactive.push(addr);
        true
    }

    /// Moves a device from the inactive list to the active list, assigning
    /// it to a domain. Returns `false` when it is not available.
    pub fn activate(&mut self, addr: PciAddress) -> bool {
        let Some(index) = self.inactive.iter().position(|a| *a == addr) else {
            return false;
        };
        self.inactive.remove(index);
        self.active.push(addr);
        true
    }

    /// Moves a device from the active list back to the inactive list.
    /// Returns `false` when it is not assigned.
    pub fn deactivate(&mut self, addr: PciAddress) -> bool {
        let Some(index) = self.active.iter().position(|a| *a == addr) else {
            return false;
        };
        self.active.remove(index);
        self.inactive.push(addr);
        true
    }

    /// Removes a device from whichever list holds it, for hot-unplug from
    /// the host. Returns `false` when it is unknown.
    pub fn forget(&mut self, addr: PciAddress) -> bool {
        for list in [&mut self.active, &mut self.inactive] {
            if let Some(index) = list.iter().position(|a| *a == addr) {
                list.remove(index);
                return true;
            }
        }
        false
    }

    /// Devices currently assigned to domains.
    #[must_use]
    pub fn active(&self) -> &[PciAddress] {
        &self.active
    }

    /// Devices currently available for assignment.
    #[must_use]
    pub fn inactive(&self) -> &[PciAddress] {
        &self.inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(slot: u8) -> PciAddress {
        PciAddress {
            domain: 0,
            bus: 2,
            slot,
            function: 0,
        }
    }

    #[test]
    fn device_lives_on_at_most_one_list() {
        let registry = HostdevRegistry::new();
        let dev = addr(1);

        let mut guard = registry.lock_pci();
        assert!(guard.add_inactive(dev));
        assert!(!guard.add_inactive(dev));

        assert!(guard.activate(dev));
        assert_eq!(guard.active(), &[dev]);
        assert!(guard.inactive().is_empty());
        // Already active, cannot be activated or re-added.
        assert!(!guard.activate(dev));
        assert!(!guard.add_inactive(dev));

        assert!(guard.deactivate(dev));
        assert_eq!(guard.inactive(), &[dev]);
        assert!(guard.active().is_empty());
        assert!(!guard.deactivate(dev));
    }

    #[test]
    fn guard_releases_both_lists_on_drop() {
        let registry = HostdevRegistry::new();
        {
            let mut guard = registry.lock_pci();
            guard.add_inactive(addr(1));
            guard.activate(addr(1));
        }
        // Relocking after drop must not deadlock, and state persists.
        assert!(registry.pci_active(addr(1)));
        let guard = registry.lock_pci();
        assert_eq!(guard.active(), &[addr(1)]);
    }

    #[test]
    fn forget_removes_from_either_list() {
        let registry = HostdevRegistry::new();
        let mut guard = registry.lock_pci();

        guard.add_inactive(addr(1));
        guard.add_inactive(addr(2));
        guard.activate(addr(1));

        assert!(guard.forget(addr(1)));
        assert!(guard.forget(addr(2)));
        assert!(!guard.forget(addr(3)));
        assert!(guard.active().is_empty());
        assert!(guard.inactive().is_empty());
    }

    #[test]
    fn usb_claims_are_exclusive() {
        let registry = HostdevRegistry::new();
        let dev = UsbAddress { bus: 1, device: 4 };

        assert!(registry.claim_usb(dev));
        assert!(!registry.claim_usb(dev));
        assert!(registry.usb_active(dev));
        assert!(registry.release_usb(dev));
        assert!(!registry.release_usb(dev));
        assert!(!registry.usb_active(dev));
    }

    #[test]
    fn addresses_format_canonically() {
        let pci = PciAddress {
            domain: 0,
            bus: 0x1a,
            slot: 3,
            function: 1,
        };
        assert_eq!(pci.to_string(), "0000:1a:03.1");

        let usb = UsbAddress { bus: 2, device: 19 };
        assert_eq!(usb.to_string(), "002:019");
    }
}
