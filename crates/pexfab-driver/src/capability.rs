// SPDX-License-Identifier: AGPL-3.0-only

//! Capability scanner
//!
//! Offset 0 is never a legal capability location, so a zero offset doubles
//! as "not present".

use crate::address::PciAddress;
use crate::error::Result;
use crate::platform::Platform;
use pexfab_regs::{config, express, ext};

/// Cached capability offsets of one port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityOffsets {
    /// PCI Express capability
    pub express: u16,
    /// Advanced Error Reporting
    pub aer: u16,
    /// L1 PM Substates
    pub l1ss: u16,
    /// Downstream Port Containment (downstream-facing ports only)
    pub dpc: u16,
    /// Device/port type from the PCI Express capability
    pub port_type: u32,
}

impl CapabilityOffsets {
    /// PCI Express capability present
    pub const fn has_express(&self) -> bool {
        self.express != 0
    }

    /// AER present
    pub const fn has_aer(&self) -> bool {
        self.aer != 0
    }

    /// L1SS present
    pub const fn has_l1ss(&self) -> bool {
        self.l1ss != 0
    }

    /// DPC present
    pub const fn has_dpc(&self) -> bool {
        self.dpc != 0
    }

    /// Absolute offset of a register inside the PCI Express capability
    pub const fn express_reg(&self, reg: u16) -> u16 {
        self.express + reg
    }
}

/// Walk the standard and extended capability lists of `addr`
///
/// # Errors
///
/// Fails if the standard list cannot be read. An unreadable extended space
/// (unprivileged sysfs access) is reported as no extended capabilities.
pub fn scan(platform: &dyn Platform, addr: PciAddress) -> Result<CapabilityOffsets> {
    let mut caps = CapabilityOffsets::default();

    let status = platform.config_read(addr, config::COMMAND_STATUS)?;
    if status & config::STATUS_CAP_LIST == 0 {
        return Ok(caps);
    }

    let mut ptr = (platform.config_read(addr, config::CAP_PTR)? & 0xFC) as u16;
    for _ in 0..config::MAX_CAP_WALK {
        if ptr < 0x40 {
            break;
        }
        let header = platform.config_read(addr, ptr)?;
        if header & 0xFF == u32::from(config::cap_id::PCI_EXPRESS) {
            caps.express = ptr;
            caps.port_type = express::port_type::decode(header);
            break;
        }
        ptr = ((header >> 8) & 0xFC) as u16;
    }

    if !caps.has_express() {
        return Ok(caps);
    }

    let downstream = express::port_type::is_downstream_facing(caps.port_type);
    let mut offset = ext::FIRST;
    for _ in 0..ext::MAX_WALK {
        let header = match platform.config_read(addr, offset) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("{addr}: extended config space unreadable: {e}");
                break;
            }
        };
        if header == 0 || header == 0xFFFF_FFFF {
            break;
        }
        match ext::cap_id(header) {
            ext::id::AER => caps.aer = offset,
            ext::id::L1SS => caps.l1ss = offset,
            ext::id::DPC if downstream => caps.dpc = offset,
            _ => {}
        }
        let next = ext::next(header);
        if next < ext::FIRST {
            break;
        }
        offset = next;
    }

    tracing::debug!(
        "{addr}: caps express={:#x} aer={:#x} l1ss={:#x} dpc={:#x}",
        caps.express,
        caps.aer,
        caps.l1ss,
        caps.dpc
    );
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PciId;
    use crate::platform::sim::{SIM_AER_CAP, SIM_DPC_CAP, SIM_L1SS_CAP, SIM_PCIE_CAP};
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::port_type;

    const ID: PciId = PciId::new(0x10B5, 0x8747);

    #[test]
    fn finds_all_capabilities_on_downstream_port() {
        let addr = PciAddress::new(0, 2, 1, 0);
        let sim = SimPlatform::new().with(
            SimFunction::bridge(addr, ID, port_type::DOWNSTREAM, 1, 2, 2)
                .with_aer(false)
                .with_l1ss(0xF)
                .with_dpc(),
        );
        let caps = scan(&sim, addr).unwrap();
        assert_eq!(caps.express, SIM_PCIE_CAP);
        assert_eq!(caps.aer, SIM_AER_CAP);
        assert_eq!(caps.l1ss, SIM_L1SS_CAP);
        assert_eq!(caps.dpc, SIM_DPC_CAP);
    }

    #[test]
    fn dpc_ignored_on_upstream_port() {
        let addr = PciAddress::new(0, 1, 0, 0);
        let sim = SimPlatform::new()
            .with(SimFunction::bridge(addr, ID, port_type::UPSTREAM, 0, 1, 2).with_dpc());
        let caps = scan(&sim, addr).unwrap();
        assert!(!caps.has_dpc());
        assert!(!caps.has_aer());
    }

    #[test]
    fn missing_capabilities_are_zero() {
        let addr = PciAddress::new(0, 1, 0, 0);
        let sim = SimPlatform::new()
            .with(SimFunction::bridge(addr, ID, port_type::UPSTREAM, 0, 1, 2).without_express());
        assert_eq!(scan(&sim, addr).unwrap(), CapabilityOffsets::default());
    }

    #[test]
    fn l1ss_found_after_null_first_header() {
        let addr = PciAddress::new(0, 1, 0, 0);
        let sim = SimPlatform::new()
            .with(SimFunction::bridge(addr, ID, port_type::UPSTREAM, 0, 1, 2).with_l1ss(0xF));
        assert_eq!(scan(&sim, addr).unwrap().l1ss, SIM_L1SS_CAP);
    }
}
