// SPDX-License-Identifier: AGPL-3.0-only

//! Register accessor
//!
//! Every register touch on a [`Port`] goes through here: MMIO when the
//! port has a mapped window, otherwise a platform configuration cycle.

use crate::error::{PexError, Result};
use crate::platform::{Mmio, Platform};
use crate::port::Port;
use std::sync::Arc;

/// A port's slice of a mapped BAR
#[derive(Debug, Clone)]
pub struct MmioWindow {
    region: Arc<dyn Mmio>,
    base: usize,
}

impl MmioWindow {
    /// Window starting `base` bytes into `region`
    pub fn new(region: Arc<dyn Mmio>, base: usize) -> Self {
        Self { region, base }
    }

    /// Underlying region
    pub fn region(&self) -> &Arc<dyn Mmio> {
        &self.region
    }

    /// Offset of this window within the region
    pub const fn base(&self) -> usize {
        self.base
    }
}

/// Register reads and writes for ports
#[derive(Debug, Clone)]
pub struct RegisterAccess {
    platform: Arc<dyn Platform>,
}

impl RegisterAccess {
    /// Accessor over `platform`
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Platform used for config cycles and control calls
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns the platform or MMIO failure with the port address attached.
    pub fn read(&self, port: &Port, offset: u16) -> Result<u32> {
        match port.window() {
            Some(w) => w
                .region
                .read_u32(w.base + usize::from(offset))
                .map_err(|e| mmio_error(port, offset, &e)),
            None => self.platform.config_read(port.addr(), offset),
        }
    }

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns the platform or MMIO failure with the port address attached.
    pub fn write(&self, port: &Port, offset: u16, value: u32) -> Result<()> {
        match port.window() {
            Some(w) => w
                .region
                .write_u32(w.base + usize::from(offset), value)
                .map_err(|e| mmio_error(port, offset, &e)),
            None => self.platform.config_write(port.addr(), offset, value),
        }
    }

    /// Read-modify-write: clear `clear`, then set `set`
    ///
    /// `preserve_mask` bits are zeroed in the written value so RW1C status
    /// in the same dword is not acknowledged by accident.
    ///
    /// # Errors
    ///
    /// Returns the first failing access.
    pub fn modify(&self, port: &Port, offset: u16, clear: u32, set: u32, preserve_mask: u32) -> Result<u32> {
        let old = self.read(port, offset)?;
        let new = ((old & !clear) | set) & !preserve_mask;
        if new != old & !preserve_mask {
            self.write(port, offset, new)?;
        }
        Ok(new)
    }
}

fn mmio_error(port: &Port, offset: u16, e: &PexError) -> PexError {
    PexError::register_access(port.addr(), offset, format!("mmio: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{PciAddress, PciId};
    use crate::platform::{SimFunction, SimMmio, SimPlatform};
    use crate::port::Port;
    use pexfab_regs::express::port_type;

    #[test]
    fn window_takes_precedence_over_config_cycles() {
        let addr = PciAddress::new(0, 3, 0, 0);
        let sim = Arc::new(SimPlatform::new().with(SimFunction::bridge(
            addr,
            PciId::new(0x10DE, 0x05B8),
            port_type::DOWNSTREAM,
            2,
            3,
            3,
        )));
        let access = RegisterAccess::new(sim.clone());
        let port = Port::scan(sim.as_ref(), addr).unwrap();

        assert_eq!(access.read(&port, 0).unwrap(), 0x05B8_10DE);

        let bar = Arc::new(SimMmio::new(0x2000));
        bar.poke(0x1000, 0xCAFE_F00D);
        port.set_window(Some(MmioWindow::new(bar.clone(), 0x1000)));
        assert_eq!(access.read(&port, 0).unwrap(), 0xCAFE_F00D);

        access.write(&port, 0x10, 7).unwrap();
        assert_eq!(bar.peek(0x1010), 7);
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn modify_skips_identical_writes() {
        let addr = PciAddress::new(0, 3, 0, 0);
        let sim = Arc::new(SimPlatform::new().with(SimFunction::bridge(
            addr,
            PciId::new(0x10B5, 0x8747),
            port_type::DOWNSTREAM,
            2,
            3,
            3,
        )));
        let access = RegisterAccess::new(sim.clone());
        let port = Port::scan(sim.as_ref(), addr).unwrap();
        access.modify(&port, 0x3C, 0, 0, 0).unwrap();
        assert!(sim.writes().is_empty());
        access.modify(&port, 0x3C, 0, 1, 0).unwrap();
        assert_eq!(sim.writes_to(addr, 0x3C), vec![1]);
    }
}
