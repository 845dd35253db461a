// SPDX-License-Identifier: AGPL-3.0-only

//! Link parameter types: speed, ASPM, L1 substates, DPC

use pexfab_regs::{dpc, express, field, l1ss};
use std::fmt;

/// PCIe link speed
///
/// Closed set decoded from the 4-bit speed encodings of LinkCap, LinkSta
/// and LinkCtl2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkSpeed {
    /// 2.5 GT/s (Gen1)
    Gen1,
    /// 5.0 GT/s (Gen2)
    Gen2,
    /// 8.0 GT/s (Gen3)
    Gen3,
    /// 16.0 GT/s (Gen4)
    Gen4,
    /// 32.0 GT/s (Gen5)
    Gen5,
}

impl LinkSpeed {
    /// All speeds, slowest first
    pub const ALL: [Self; 5] = [Self::Gen1, Self::Gen2, Self::Gen3, Self::Gen4, Self::Gen5];

    /// Decode a link speed code; `None` for reserved encodings
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            express::speed::GEN1 => Some(Self::Gen1),
            express::speed::GEN2 => Some(Self::Gen2),
            express::speed::GEN3 => Some(Self::Gen3),
            express::speed::GEN4 => Some(Self::Gen4),
            express::speed::GEN5 => Some(Self::Gen5),
            _ => None,
        }
    }

    /// Register encoding
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Gen1 => express::speed::GEN1,
            Self::Gen2 => express::speed::GEN2,
            Self::Gen3 => express::speed::GEN3,
            Self::Gen4 => express::speed::GEN4,
            Self::Gen5 => express::speed::GEN5,
        }
    }

    /// Transfer rate in megatransfers per second
    #[must_use]
    pub const fn mega_transfers(self) -> u32 {
        match self {
            Self::Gen1 => 2_500,
            Self::Gen2 => 5_000,
            Self::Gen3 => 8_000,
            Self::Gen4 => 16_000,
            Self::Gen5 => 32_000,
        }
    }

    /// Parse sysfs `current_link_speed` text such as "8.0 GT/s PCIe"
    pub fn from_sysfs(s: &str) -> Option<Self> {
        let rate = s.split_whitespace().next()?;
        match rate {
            "2.5" => Some(Self::Gen1),
            "5" | "5.0" => Some(Self::Gen2),
            "8" | "8.0" => Some(Self::Gen3),
            "16" | "16.0" => Some(Self::Gen4),
            "32" | "32.0" => Some(Self::Gen5),
            _ => None,
        }
    }
}

impl fmt::Display for LinkSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mt = self.mega_transfers();
        write!(f, "{}.{} GT/s", mt / 1000, (mt % 1000) / 100)
    }
}

/// ASPM enable state of one link end (LinkCtl bits 1:0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Aspm {
    /// Both L0s and L1 disabled
    #[default]
    Disabled,
    /// L0s only
    L0s,
    /// L1 only
    L1,
    /// L0s and L1
    L0sL1,
}

impl Aspm {
    /// Decode the two ASPM control bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & express::link::CTL_ASPM_MASK {
            0 => Self::Disabled,
            1 => Self::L0s,
            2 => Self::L1,
            _ => Self::L0sL1,
        }
    }

    /// Build from individual enables
    #[must_use]
    pub const fn from_flags(l0s: bool, l1: bool) -> Self {
        Self::from_bits((l0s as u32) | ((l1 as u32) << 1))
    }

    /// ASPM control bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::L0s => 1,
            Self::L1 => 2,
            Self::L0sL1 => 3,
        }
    }

    /// L0s enabled
    #[must_use]
    pub const fn l0s(self) -> bool {
        self.bits() & express::link::CTL_ASPM_L0S != 0
    }

    /// L1 enabled
    #[must_use]
    pub const fn l1(self) -> bool {
        self.bits() & express::link::CTL_ASPM_L1 != 0
    }

    /// States present in both
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self::from_bits(self.bits() & other.bits())
    }
}

impl fmt::Display for Aspm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::L0s => "L0s",
            Self::L1 => "L1",
            Self::L0sL1 => "L0s+L1",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Aspm {
    type Err = crate::error::PexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "disabled" | "none" => Ok(Self::Disabled),
            "l0s" => Ok(Self::L0s),
            "l1" => Ok(Self::L1),
            "l0s+l1" | "l0sl1" | "all" => Ok(Self::L0sL1),
            other => Err(crate::error::PexError::invalid_value("ASPM state", other)),
        }
    }
}

/// L1 PM substate enables of one link end (L1SS control 1 bits 3:0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct L1ssState(u32);

impl L1ssState {
    /// Nothing enabled
    pub const NONE: Self = Self(0);
    /// ASPM L1.1
    pub const ASPM_L1_1: Self = Self(l1ss::ASPM_L1_1);
    /// ASPM L1.2
    pub const ASPM_L1_2: Self = Self(l1ss::ASPM_L1_2);
    /// PCI-PM L1.1
    pub const PCIPM_L1_1: Self = Self(l1ss::PCIPM_L1_1);
    /// PCI-PM L1.2
    pub const PCIPM_L1_2: Self = Self(l1ss::PCIPM_L1_2);
    /// Both ASPM substates
    pub const ASPM_ALL: Self = Self(l1ss::ASPM_MASK);

    /// From raw control bits (other fields masked off)
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & l1ss::ENABLE_MASK)
    }

    /// Raw control bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// ASPM substate bits only
    #[must_use]
    pub const fn aspm(self) -> Self {
        Self(self.0 & l1ss::ASPM_MASK)
    }

    /// PCI-PM substate bits only
    #[must_use]
    pub const fn pcipm(self) -> Self {
        Self(self.0 & l1ss::PCIPM_MASK)
    }

    /// Any L1.2 enable (ASPM or PCI-PM)
    #[must_use]
    pub const fn has_l1_2(self) -> bool {
        self.0 & l1ss::L1_2_MASK != 0
    }

    /// Union
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Bits set in both
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Bits of `self` not in `other`
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// All bits of `other` are set in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Nothing enabled
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for L1ssState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (l1ss::ASPM_L1_1, "ASPM-L1.1"),
            (l1ss::ASPM_L1_2, "ASPM-L1.2"),
            (l1ss::PCIPM_L1_1, "PCIPM-L1.1"),
            (l1ss::PCIPM_L1_2, "PCIPM-L1.2"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join("+"))
    }
}

/// Decoded Link Capabilities of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCapInfo {
    /// Maximum link speed; `None` for a reserved encoding
    pub max_speed: Option<LinkSpeed>,
    /// Maximum link width (lanes)
    pub max_width: u8,
    /// ASPM states the port supports
    pub aspm: Aspm,
    /// Reports data link layer link active
    pub dll_active_reporting: bool,
}

impl LinkCapInfo {
    /// Decode a Link Capabilities register value
    #[must_use]
    pub const fn decode(link_cap: u32) -> Self {
        Self {
            max_speed: LinkSpeed::from_code(field(
                link_cap,
                express::link::CAP_SPEED_LO,
                express::link::CAP_SPEED_BITS,
            )),
            max_width: field(link_cap, express::link::CAP_WIDTH_LO, express::link::CAP_WIDTH_BITS) as u8,
            aspm: Aspm::from_bits(link_cap >> 10),
            dll_active_reporting: link_cap & express::link::CAP_DLL_ACTIVE_REPORTING != 0,
        }
    }
}

/// Decoded Link Status: current speed and negotiated width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    /// Current link speed
    pub speed: Option<LinkSpeed>,
    /// Negotiated width (lanes)
    pub width: u8,
    /// Link training in progress
    pub training: bool,
    /// Data link layer active
    pub dll_active: bool,
}

impl LinkStatus {
    /// Decode the LinkCtl/LinkSta dword
    #[must_use]
    pub const fn decode(ctl_sta: u32) -> Self {
        Self {
            speed: LinkSpeed::from_code(field(ctl_sta, express::link::STA_SPEED_LO, 4)),
            width: field(ctl_sta, express::link::STA_WIDTH_LO, 6) as u8,
            training: ctl_sta & express::link::STA_TRAINING != 0,
            dll_active: ctl_sta & express::link::STA_DLL_ACTIVE != 0,
        }
    }
}

/// DPC trigger mode of a downstream port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DpcMode {
    /// Containment disabled
    #[default]
    Off,
    /// Trigger on ERR_FATAL
    Fatal,
    /// Trigger on ERR_NONFATAL or ERR_FATAL
    NonFatal,
}

impl DpcMode {
    /// Decode the trigger enable field
    #[must_use]
    pub const fn from_trigger(bits: u32) -> Self {
        match bits {
            dpc::trigger::FATAL => Self::Fatal,
            dpc::trigger::NON_FATAL => Self::NonFatal,
            _ => Self::Off,
        }
    }

    /// Trigger enable field encoding
    #[must_use]
    pub const fn trigger(self) -> u32 {
        match self {
            Self::Off => dpc::trigger::DISABLED,
            Self::Fatal => dpc::trigger::FATAL,
            Self::NonFatal => dpc::trigger::NON_FATAL,
        }
    }

    /// Bit used in a [`DpcMask`]
    const fn mask_bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for DpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Fatal => "fatal",
            Self::NonFatal => "non-fatal",
        })
    }
}

impl std::str::FromStr for DpcMode {
    type Err = crate::error::PexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "disabled" => Ok(Self::Off),
            "fatal" => Ok(Self::Fatal),
            "non-fatal" | "nonfatal" => Ok(Self::NonFatal),
            other => Err(crate::error::PexError::invalid_value("DPC mode", other)),
        }
    }
}

/// Set of DPC modes a port supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DpcMask(u8);

impl DpcMask {
    /// No DPC capability
    pub const NONE: Self = Self(0);
    /// Every mode
    pub const ALL: Self = Self(0b111);

    /// Mask contains `mode`
    #[must_use]
    pub const fn allows(self, mode: DpcMode) -> bool {
        self.0 & mode.mask_bit() != 0
    }

    /// DPC is implemented at all
    #[must_use]
    pub const fn is_supported(self) -> bool {
        self.0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_code_three_is_eight_gts() {
        assert_eq!(LinkSpeed::from_code(3), Some(LinkSpeed::Gen3));
        assert_eq!(LinkSpeed::Gen3.to_string(), "8.0 GT/s");
        assert_eq!(LinkSpeed::Gen1.to_string(), "2.5 GT/s");
        assert_eq!(LinkSpeed::from_code(0), None);
        assert_eq!(LinkSpeed::from_code(7), None);
    }

    #[test]
    fn sysfs_speed_strings() {
        assert_eq!(LinkSpeed::from_sysfs("8.0 GT/s PCIe"), Some(LinkSpeed::Gen3));
        assert_eq!(LinkSpeed::from_sysfs("2.5 GT/s"), Some(LinkSpeed::Gen1));
        assert_eq!(LinkSpeed::from_sysfs("Unknown"), None);
    }

    #[test]
    fn aspm_intersection() {
        assert_eq!(Aspm::L0sL1.intersect(Aspm::L1), Aspm::L1);
        assert_eq!(Aspm::L0s.intersect(Aspm::L1), Aspm::Disabled);
        assert_eq!(Aspm::from_flags(true, true), Aspm::L0sL1);
        assert_eq!("l1".parse::<Aspm>().unwrap(), Aspm::L1);
    }

    #[test]
    fn l1ss_set_operations() {
        let s = L1ssState::ASPM_L1_1.union(L1ssState::PCIPM_L1_2);
        assert!(s.has_l1_2());
        assert_eq!(s.aspm(), L1ssState::ASPM_L1_1);
        assert_eq!(s.pcipm(), L1ssState::PCIPM_L1_2);
        assert_eq!(s.to_string(), "ASPM-L1.1+PCIPM-L1.2");
        assert!(L1ssState::from_bits(0xFFFF_FFFF).contains(L1ssState::ASPM_ALL));
    }

    #[test]
    fn link_cap_decode() {
        // Gen3 x16, L0s+L1, DLL active reporting
        let info = LinkCapInfo::decode(0x0010_0C03 | (16 << 4));
        assert_eq!(info.max_speed, Some(LinkSpeed::Gen3));
        assert_eq!(info.max_width, 16);
        assert_eq!(info.aspm, Aspm::L0sL1);
        assert!(info.dll_active_reporting);
    }

    #[test]
    fn dpc_mask() {
        assert!(DpcMask::ALL.allows(DpcMode::NonFatal));
        assert!(!DpcMask::NONE.is_supported());
        assert_eq!(DpcMode::from_trigger(2), DpcMode::NonFatal);
    }
}
