// SPDX-License-Identifier: AGPL-3.0-only

//! PCI function addresses and vendor:device identifiers

use crate::error::PexError;
use std::fmt;
use std::str::FromStr;

/// Domain / bus / device / function address of one PCI function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// PCI segment (domain)
    pub domain: u16,
    /// Bus number
    pub bus: u8,
    /// Device number (0-31)
    pub device: u8,
    /// Function number (0-7)
    pub function: u8,
}

impl PciAddress {
    /// Create an address
    #[must_use]
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PexError;

    /// Parse `dddd:bb:dd.f` (sysfs form) or `bb:dd.f` (lspci form, domain 0)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PexError::invalid_value("PCI address", s);

        let (head, function) = s.trim().rsplit_once('.').ok_or_else(bad)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [domain, bus, device] => (*domain, *bus, *device),
            [bus, device] => ("0", *bus, *device),
            _ => return Err(bad()),
        };

        let domain = u16::from_str_radix(domain, 16).map_err(|_| bad())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| bad())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| bad())?;
        let function = function.parse::<u8>().map_err(|_| bad())?;

        if device > 31 || function > 7 {
            return Err(bad());
        }

        Ok(Self::new(domain, bus, device, function))
    }
}

/// Vendor:device identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PciId {
    /// Vendor ID
    pub vendor: u16,
    /// Device ID
    pub device: u16,
}

impl PciId {
    /// Create an identifier
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }

    /// Decode from configuration dword 0
    #[must_use]
    pub const fn from_dword(dword: u32) -> Self {
        Self {
            vendor: (dword & 0xFFFF) as u16,
            device: (dword >> 16) as u16,
        }
    }

    /// An all-ones vendor means no function responded
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.vendor != 0xFFFF && self.vendor != 0
    }
}

impl From<(u16, u16)> for PciId {
    fn from((vendor, device): (u16, u16)) -> Self {
        Self::new(vendor, device)
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sysfs_and_lspci_forms() {
        let a: PciAddress = "0000:a1:00.0".parse().unwrap();
        assert_eq!(a, PciAddress::new(0, 0xa1, 0, 0));
        let b: PciAddress = "02:1f.7".parse().unwrap();
        assert_eq!(b, PciAddress::new(0, 2, 0x1f, 7));
        assert_eq!(a.to_string(), "0000:a1:00.0");
    }

    #[test]
    fn rejects_out_of_range_device() {
        assert!("0000:00:20.0".parse::<PciAddress>().is_err());
        assert!("0000:00:00.8".parse::<PciAddress>().is_err());
        assert!("garbage".parse::<PciAddress>().is_err());
    }

    #[test]
    fn id_from_dword() {
        let id = PciId::from_dword(0x05B8_10DE);
        assert_eq!(id, PciId::new(0x10DE, 0x05B8));
        assert!(id.is_present());
        assert!(!PciId::from_dword(0xFFFF_FFFF).is_present());
    }
}
