// SPDX-License-Identifier: AGPL-3.0-only

//! Port registry
//!
//! Flat map of every bridge port found by a class-code scan, keyed by
//! `(domain, secondary bus)`. Leaf candidates (display and accelerator
//! functions) are collected alongside.
//!
//! A single-function virtualised bridge is split into two views joined by a
//! synthetic bus so it looks like any other device with one upstream and
//! one downstream port:
//!
//! ```text
//!   before:  B  primary=P  secondary=S  subordinate=N
//!   after:   B_up    primary=P        secondary=X  subordinate=X
//!            B_down  primary=X        secondary=S  subordinate=N
//!   X = SYNTHETIC_BUS_BASE + n
//! ```

use crate::address::PciAddress;
use crate::error::Result;
use crate::family::FamilyTable;
use crate::platform::Platform;
use crate::port::Port;
use pexfab_regs::config;
use std::collections::BTreeMap;
use std::sync::Arc;

/// First bus number used for synthetic split buses (outside the 8-bit range)
pub const SYNTHETIC_BUS_BASE: u16 = 0x100;

/// Bridge ports by `(domain, secondary bus)`
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: BTreeMap<(u16, u16), Arc<Port>>,
    leaves: Vec<PciAddress>,
    next_synthetic: u16,
}

impl PortRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan every function the platform enumerates
    ///
    /// Functions that fail to scan are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error only if enumeration itself fails.
    pub fn scan(platform: &dyn Platform, families: &FamilyTable, leaf_classes: &[u8]) -> Result<Self> {
        let mut registry = Self::new();
        let mut virtual_ports = Vec::new();

        for addr in platform.enumerate()? {
            let class = match platform.config_read(addr, config::CLASS_REVISION) {
                Ok(raw) => config::class_code(raw),
                Err(e) => {
                    tracing::warn!("{addr}: skipped, class code unreadable: {e}");
                    continue;
                }
            };

            if class & config::CLASS_MASK_NO_PROG_IF == config::CLASS_PCI_BRIDGE {
                match Port::scan(platform, addr) {
                    Ok(port) if families.is_virtual(port.id()) => virtual_ports.push(port),
                    Ok(port) => {
                        registry.insert(port);
                    }
                    Err(e) => tracing::warn!("{addr}: bridge skipped: {e}"),
                }
            } else if leaf_classes.contains(&((class >> 16) as u8)) {
                registry.leaves.push(addr);
            }
        }

        // Split after every real port is known so the "has a parent" check
        // sees the whole bus
        for port in virtual_ports {
            registry.insert_virtual(port);
        }

        tracing::debug!(
            "registry: {} bridge ports, {} leaf candidates",
            registry.ports.len(),
            registry.leaves.len()
        );
        Ok(registry)
    }

    /// Record a port; a duplicate `(domain, secondary)` replaces the old entry
    pub fn insert(&mut self, port: Port) -> Arc<Port> {
        let key = (port.addr().domain, port.secondary());
        let port = Arc::new(port);
        if let Some(old) = self.ports.insert(key, Arc::clone(&port)) {
            tracing::warn!("bus {:02x} claimed by both {} and {}", key.1, old.addr(), port.addr());
        }
        port
    }

    /// Record a virtualised bridge, split when something sits above it
    pub fn insert_virtual(&mut self, port: Port) {
        let domain = port.addr().domain;
        if self.by_secondary(domain, port.primary()).is_none() {
            tracing::debug!("{}: virtual bridge on a root bus, not split", port.addr());
            self.insert(port);
            return;
        }

        let synthetic = SYNTHETIC_BUS_BASE + self.next_synthetic;
        self.next_synthetic += 1;

        let up = port.synthetic_view(port.primary(), synthetic, synthetic);
        let down = port.synthetic_view(synthetic, port.secondary(), port.subordinate());
        tracing::debug!("{}: split over synthetic bus {synthetic:#x}", port.addr());
        self.insert(up);
        self.insert(down);
    }

    /// Add a leaf candidate that class-code discovery would miss
    pub fn add_leaf(&mut self, addr: PciAddress) {
        if !self.leaves.contains(&addr) {
            self.leaves.push(addr);
        }
    }

    /// Port whose secondary bus is `bus`
    pub fn by_secondary(&self, domain: u16, bus: u16) -> Option<&Arc<Port>> {
        self.ports.get(&(domain, bus))
    }

    /// Ports sitting on `primary`, in address order
    pub fn siblings(&self, domain: u16, primary: u16) -> Vec<Arc<Port>> {
        let mut out: Vec<Arc<Port>> = self
            .ports
            .iter()
            .filter(|((d, _), p)| *d == domain && p.primary() == primary)
            .map(|(_, p)| Arc::clone(p))
            .collect();
        out.sort_by_key(|p| p.addr());
        out
    }

    /// Every registered port
    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.ports.values()
    }

    /// Leaf candidates, discovery order
    pub fn leaves(&self) -> &[PciAddress] {
        &self.leaves
    }

    /// Number of registered ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// No ports registered
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
