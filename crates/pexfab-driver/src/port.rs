// SPDX-License-Identifier: AGPL-3.0-only

//! Ports
//!
//! A [`Port`] is one PCI function acting as a connection point of a bridge
//! device (or the upstream end of a leaf). Identity and capability offsets
//! are fixed at scan time; the MMIO window, hardware counter attachment and
//! error state change at runtime and are interior-mutable so ports can be
//! shared with the collector thread.

use crate::access::MmioWindow;
use crate::address::{PciAddress, PciId};
use crate::aer::{AerLog, DEFAULT_CAPACITY};
use crate::capability::{self, CapabilityOffsets};
use crate::counters::Counter;
use crate::error::{PexError, Result};
use crate::hwcounter::HwCounterHelper;
use crate::platform::Platform;
use pexfab_regs::{config, express};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// One bridge or leaf function
pub struct Port {
    addr: PciAddress,
    id: PciId,
    class: u32,
    primary: u16,
    secondary: u16,
    subordinate: u16,
    caps: CapabilityOffsets,
    port_number: u8,
    synthetic: bool,
    located: AtomicBool,
    window: RwLock<Option<MmioWindow>>,
    hw_counters: RwLock<Option<Arc<HwCounterHelper>>>,
    errors: Mutex<AerLog>,
    sticky: [AtomicU64; 4],
}

impl Port {
    /// Read identity, bus numbers and capabilities of `addr`
    ///
    /// # Errors
    ///
    /// Returns error if the function does not respond or the reads fail.
    pub fn scan(platform: &dyn Platform, addr: PciAddress) -> Result<Self> {
        let id = PciId::from_dword(platform.config_read(addr, config::ID)?);
        if !id.is_present() {
            return Err(PexError::not_found(format!("{addr}: no function present")));
        }
        let class = config::class_code(platform.config_read(addr, config::CLASS_REVISION)?);
        let header = config::header_type(platform.config_read(addr, config::HEADER_DWORD)?);

        let (primary, secondary, subordinate) = if header == config::HEADER_TYPE_BRIDGE {
            config::bus_numbers(platform.config_read(addr, config::BUS_NUMBERS)?)
        } else {
            (addr.bus, 0, 0)
        };

        let caps = capability::scan(platform, addr)?;
        let port_number = if caps.has_express() {
            let link_cap = platform.config_read(addr, caps.express_reg(express::LINK_CAP))?;
            (link_cap >> express::link::CAP_PORT_NUMBER_LO) as u8
        } else {
            0
        };

        Ok(Self::from_parts(
            addr,
            id,
            class,
            (primary.into(), secondary.into(), subordinate.into()),
            caps,
            port_number,
            false,
        ))
    }

    fn from_parts(
        addr: PciAddress,
        id: PciId,
        class: u32,
        (primary, secondary, subordinate): (u16, u16, u16),
        caps: CapabilityOffsets,
        port_number: u8,
        synthetic: bool,
    ) -> Self {
        Self {
            addr,
            id,
            class,
            primary,
            secondary,
            subordinate,
            caps,
            port_number,
            synthetic,
            located: AtomicBool::new(false),
            window: RwLock::new(None),
            hw_counters: RwLock::new(None),
            errors: Mutex::new(AerLog::new(DEFAULT_CAPACITY)),
            sticky: Default::default(),
        }
    }

    /// Second view of the same function with different bus numbers
    ///
    /// Used to split a single-function virtual bridge into an upstream and
    /// a downstream side joined by a synthetic bus.
    pub fn synthetic_view(&self, primary: u16, secondary: u16, subordinate: u16) -> Self {
        Self::from_parts(
            self.addr,
            self.id,
            self.class,
            (primary, secondary, subordinate),
            self.caps,
            self.port_number,
            true,
        )
    }

    /// Function address
    pub const fn addr(&self) -> PciAddress {
        self.addr
    }

    /// Vendor:device id
    pub const fn id(&self) -> PciId {
        self.id
    }

    /// 24-bit class code
    pub const fn class(&self) -> u32 {
        self.class
    }

    /// Bus this port sits on
    pub const fn primary(&self) -> u16 {
        self.primary
    }

    /// Bus directly below this port (0 for leaves)
    pub const fn secondary(&self) -> u16 {
        self.secondary
    }

    /// Highest bus below this port
    pub const fn subordinate(&self) -> u16 {
        self.subordinate
    }

    /// `bus` lies in this port's secondary..=subordinate range
    pub const fn contains_bus(&self, bus: u16) -> bool {
        self.secondary != 0 && bus >= self.secondary && bus <= self.subordinate
    }

    /// Capability offsets
    pub const fn caps(&self) -> &CapabilityOffsets {
        &self.caps
    }

    /// Port number from Link Capabilities
    pub const fn port_number(&self) -> u8 {
        self.port_number
    }

    /// One half of a split virtual bridge
    pub const fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Claimed by a topology (collector drains only located ports)
    pub fn is_located(&self) -> bool {
        self.located.load(Ordering::Acquire)
    }

    pub(crate) fn set_located(&self) {
        self.located.store(true, Ordering::Release);
    }

    /// Current MMIO window
    pub fn window(&self) -> Option<MmioWindow> {
        self.window.read().ok().and_then(|w| w.clone())
    }

    /// Install or remove the MMIO window
    pub fn set_window(&self, window: Option<MmioWindow>) {
        match self.window.write() {
            Ok(mut w) => *w = window,
            Err(poisoned) => *poisoned.into_inner() = window,
        }
    }

    /// Attached hardware counter helper
    pub fn hw_counters(&self) -> Option<Arc<HwCounterHelper>> {
        self.hw_counters.read().ok().and_then(|h| h.clone())
    }

    pub(crate) fn set_hw_counters(&self, helper: Option<Arc<HwCounterHelper>>) {
        match self.hw_counters.write() {
            Ok(mut h) => *h = helper,
            Err(poisoned) => *poisoned.into_inner() = helper,
        }
    }

    /// Lock the port's error state (sticky counter updates and AER log)
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a previous holder panicked.
    pub fn lock_errors(&self) -> Result<MutexGuard<'_, AerLog>> {
        self.errors
            .lock()
            .map_err(|_| PexError::invalid_state(format!("{}: error state poisoned", self.addr)))
    }

    /// Add to a basic sticky counter
    pub(crate) fn add_sticky(&self, counter: Counter, n: u64) {
        if let Some(slot) = self.sticky.get(counter.index()) {
            slot.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Take and zero the basic sticky counters
    pub(crate) fn take_sticky(&self) -> [u64; 4] {
        let mut out = [0; 4];
        for (o, s) in out.iter_mut().zip(&self.sticky) {
            *o = s.swap(0, Ordering::AcqRel);
        }
        out
    }

    /// Current basic sticky counters without consuming them
    pub fn peek_sticky(&self) -> [u64; 4] {
        let mut out = [0; 4];
        for (o, s) in out.iter_mut().zip(&self.sticky) {
            *o = s.load(Ordering::Acquire);
        }
        out
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("subordinate", &self.subordinate)
            .field("synthetic", &self.synthetic)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.addr, self.id)?;
        if self.secondary != 0 {
            write!(f, " bus {:02x}..{:02x}", self.secondary, self.subordinate)?;
        }
        if self.synthetic {
            f.write_str(" (split)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::port_type;

    #[test]
    fn scan_reads_bus_numbers_and_port_number() {
        let addr = PciAddress::new(0, 2, 3, 0);
        let sim = SimPlatform::new().with(
            SimFunction::bridge(addr, PciId::new(0x10B5, 0x8747), port_type::DOWNSTREAM, 2, 3, 7)
                .with_link_cap(3, 16, 0b11, 9),
        );
        let port = Port::scan(&sim, addr).unwrap();
        assert_eq!((port.primary(), port.secondary(), port.subordinate()), (2, 3, 7));
        assert_eq!(port.port_number(), 9);
        assert!(port.contains_bus(5));
        assert!(!port.contains_bus(8));
    }

    #[test]
    fn leaf_sits_on_its_own_bus() {
        let addr = PciAddress::new(0, 4, 0, 0);
        let sim = SimPlatform::new().with(SimFunction::endpoint(addr, PciId::new(0x10DE, 0x2204), 0x03_0000));
        let port = Port::scan(&sim, addr).unwrap();
        assert_eq!(port.primary(), 4);
        assert!(!port.contains_bus(4));
    }

    #[test]
    fn sticky_counters_are_taken() {
        let addr = PciAddress::new(0, 4, 0, 0);
        let sim = SimPlatform::new().with(SimFunction::endpoint(addr, PciId::new(0x10DE, 0x2204), 0x03_0000));
        let port = Port::scan(&sim, addr).unwrap();
        port.add_sticky(Counter::UnsupportedRequest, 2);
        assert_eq!(port.take_sticky(), [0, 0, 0, 2]);
        assert_eq!(port.peek_sticky(), [0; 4]);
    }

    #[test]
    fn missing_function_is_not_found() {
        let sim = SimPlatform::new();
        assert!(matches!(
            Port::scan(&sim, PciAddress::new(0, 9, 0, 0)),
            Err(PexError::NotFound { .. })
        ));
    }
}
