// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge family classification
//!
//! A closed set of families selects the error status register, the MMIO
//! window mapped at `initialize()`, the ASPM capability overrides and the
//! hardware counter layout. The id tables start from [`pexfab_regs::ids`]
//! and can be extended per manager.

use crate::address::PciId;
use crate::capability::CapabilityOffsets;
use pexfab_regs::{express, ids, vendor};
use std::fmt;

/// Generation of a PLX / Broadcom switch, which fixes its counter layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlxGeneration {
    /// PEX87xx
    Gen3,
    /// PEX88xxx
    Gen4,
}

/// Hardware family of a bridge device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Root complex / chipset root ports
    Root,
    /// BR03 PCIe-to-PCIe bridge
    Br03,
    /// BR04 switch
    Br04,
    /// PLX / Broadcom PEX switch
    Plx(PlxGeneration),
    /// Virtualised PCIe-to-PCI bridge (single function)
    Virtual,
    /// Anything else
    Generic,
}

/// Receiver error register layout of a counter-capable family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterLayout {
    /// Receiver error register offset within a port slice
    pub receiver_errors: usize,
    /// Count field low bit
    pub count_lo: u32,
    /// Count field width
    pub count_bits: u32,
    /// Value written to reset the receiver error count
    pub reset_value: u32,
    /// Bad TLP counter offset
    pub bad_tlp: usize,
    /// Bad DLLP counter offset
    pub bad_dllp: usize,
    /// Per-port slice stride in BAR0
    pub port_stride: usize,
}

/// MMIO window a family maps during `initialize()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSource {
    /// Nothing to map
    None,
    /// BAR0 of the upstream port, used by the counter helper
    UpstreamBar0 {
        /// Bytes to map
        size: usize,
    },
    /// Hidden BAR0 located by a control call; each port gets a slice
    ControlBar0 {
        /// Bytes to map
        size: usize,
        /// Per-port slice stride
        stride: usize,
    },
}

/// Forced ASPM capability bits; `None` keeps the Link Capability value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AspmOverride {
    /// L0s allowed
    pub l0s: Option<bool>,
    /// L1 allowed
    pub l1: Option<bool>,
}

impl Family {
    /// Display name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Br03 => "br03",
            Self::Br04 => "br04",
            Self::Plx(PlxGeneration::Gen3) => "plx-gen3",
            Self::Plx(PlxGeneration::Gen4) => "plx-gen4",
            Self::Virtual => "virtual",
            Self::Generic => "generic",
        }
    }

    /// Register holding the DevCtl/DevSta-style error bits
    ///
    /// `None` when the port has no PCI Express capability and the family
    /// has no vendor mirror.
    pub const fn error_status_offset(self, caps: &CapabilityOffsets) -> Option<u16> {
        match self {
            Self::Br03 => Some(vendor::br03::ERROR_CTL_STA),
            Self::Br04 => Some(vendor::br04::ERROR_CTL_STA),
            _ if caps.has_express() => Some(caps.express_reg(express::DEVICE_CTL_STA)),
            _ => None,
        }
    }

    /// Hardware counter layout for families that have incrementing counters
    pub const fn counter_layout(self) -> Option<CounterLayout> {
        match self {
            Self::Plx(generation) => {
                let (receiver_errors, count_lo, count_bits, reset_value) = match generation {
                    PlxGeneration::Gen3 => (
                        vendor::plx::gen3::RECEIVER_ERRORS,
                        vendor::plx::gen3::COUNT_LO,
                        vendor::plx::gen3::COUNT_BITS,
                        vendor::plx::gen3::RESET_VALUE,
                    ),
                    PlxGeneration::Gen4 => (
                        vendor::plx::gen4::RECEIVER_ERRORS,
                        vendor::plx::gen4::COUNT_LO,
                        vendor::plx::gen4::COUNT_BITS,
                        vendor::plx::gen4::RESET_VALUE,
                    ),
                };
                Some(CounterLayout {
                    receiver_errors,
                    count_lo,
                    count_bits,
                    reset_value,
                    bad_tlp: vendor::plx::BAD_TLP_COUNT,
                    bad_dllp: vendor::plx::BAD_DLLP_COUNT,
                    port_stride: vendor::plx::PORT_STRIDE,
                })
            }
            _ => None,
        }
    }

    /// Window mapped by `initialize()`
    pub const fn window_source(self) -> WindowSource {
        match self {
            Self::Plx(_) => WindowSource::UpstreamBar0 {
                size: vendor::plx::BAR0_SIZE,
            },
            Self::Br04 => WindowSource::ControlBar0 {
                size: vendor::br04::BAR0_SIZE,
                stride: vendor::br04::PORT_STRIDE,
            },
            _ => WindowSource::None,
        }
    }

    /// Upstream link speed goes through the out-of-band control call
    pub const fn upstream_speed_via_control(self) -> bool {
        matches!(self, Self::Br04)
    }

    /// Enabling L1 at 8 or 16 GT/s is allowed but logged as a warning
    pub const fn warns_l1_at_high_speed(self) -> bool {
        matches!(self, Self::Plx(_))
    }

    /// ASPM capability overrides for this family and id
    pub fn aspm_override(self, id: PciId, table: &FamilyTable) -> AspmOverride {
        match self {
            Self::Br03 => AspmOverride {
                l0s: Some(true),
                l1: Some(false),
            },
            // L0s errata on the whole PEX line
            Self::Plx(_) => AspmOverride {
                l0s: Some(false),
                l1: None,
            },
            Self::Root if table.root_l0s_quirk.contains(&id) => AspmOverride {
                l0s: Some(false),
                l1: Some(true),
            },
            _ => AspmOverride::default(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Vendor:device tables used for classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyTable {
    /// BR03 ids
    pub br03: Vec<PciId>,
    /// BR04 ids
    pub br04: Vec<PciId>,
    /// PLX Gen3 ids
    pub plx_gen3: Vec<PciId>,
    /// PLX Gen4 ids
    pub plx_gen4: Vec<PciId>,
    /// Virtualised bridge ids
    pub virtual_bridge: Vec<PciId>,
    /// Root ports with unreliable L0s
    pub root_l0s_quirk: Vec<PciId>,
    /// Hot-plug ports that do not reliably raise command completed
    pub no_command_completed: Vec<PciId>,
}

fn table(ids: &[(u16, u16)]) -> Vec<PciId> {
    ids.iter().copied().map(PciId::from).collect()
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self {
            br03: table(ids::BR03),
            br04: table(ids::BR04),
            plx_gen3: table(ids::PLX_GEN3),
            plx_gen4: table(ids::PLX_GEN4),
            virtual_bridge: table(ids::VIRTUAL_BRIDGE),
            root_l0s_quirk: table(ids::ROOT_L0S_QUIRK),
            no_command_completed: table(ids::NO_COMMAND_COMPLETED),
        }
    }
}

impl FamilyTable {
    /// Classify a device by the id of its upstream port
    ///
    /// Devices without an upstream port are always [`Family::Root`].
    pub fn classify(&self, upstream: Option<PciId>) -> Family {
        let Some(id) = upstream else {
            return Family::Root;
        };
        if self.br03.contains(&id) {
            Family::Br03
        } else if self.br04.contains(&id) {
            Family::Br04
        } else if self.plx_gen3.contains(&id) {
            Family::Plx(PlxGeneration::Gen3)
        } else if self.plx_gen4.contains(&id) {
            Family::Plx(PlxGeneration::Gen4)
        } else if self.virtual_bridge.contains(&id) {
            Family::Virtual
        } else {
            Family::Generic
        }
    }

    /// Id belongs to the virtualised bridge family
    pub fn is_virtual(&self, id: PciId) -> bool {
        self.virtual_bridge.contains(&id)
    }

    /// Command completed polling is unreliable on this port
    pub fn skips_command_completed(&self, id: PciId) -> bool {
        self.no_command_completed.contains(&id)
    }

    /// Add an id to a family's table
    pub fn add(&mut self, family: Family, id: PciId) {
        let list = match family {
            Family::Br03 => &mut self.br03,
            Family::Br04 => &mut self.br04,
            Family::Plx(PlxGeneration::Gen3) => &mut self.plx_gen3,
            Family::Plx(PlxGeneration::Gen4) => &mut self.plx_gen4,
            Family::Virtual => &mut self.virtual_bridge,
            Family::Root => &mut self.root_l0s_quirk,
            Family::Generic => return,
        };
        if !list.contains(&id) {
            list.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_ids() {
        let t = FamilyTable::default();
        assert_eq!(t.classify(None), Family::Root);
        assert_eq!(t.classify(Some(PciId::new(0x10DE, 0x01B3))), Family::Br03);
        assert_eq!(t.classify(Some(PciId::new(0x10DE, 0x05B8))), Family::Br04);
        assert_eq!(
            t.classify(Some(PciId::new(0x10B5, 0x8747))),
            Family::Plx(PlxGeneration::Gen3)
        );
        assert_eq!(
            t.classify(Some(PciId::new(0x1000, 0xC010))),
            Family::Plx(PlxGeneration::Gen4)
        );
        assert_eq!(t.classify(Some(PciId::new(0x1B36, 0x000E))), Family::Virtual);
        assert_eq!(t.classify(Some(PciId::new(0x1234, 0x5678))), Family::Generic);
    }

    #[test]
    fn table_is_extensible() {
        let mut t = FamilyTable::default();
        let id = PciId::new(0x10B5, 0x9797);
        t.add(Family::Plx(PlxGeneration::Gen3), id);
        assert_eq!(t.classify(Some(id)), Family::Plx(PlxGeneration::Gen3));
    }

    #[test]
    fn error_register_selection() {
        let caps = CapabilityOffsets {
            express: 0x40,
            ..CapabilityOffsets::default()
        };
        assert_eq!(Family::Br03.error_status_offset(&caps), Some(0x0E0));
        assert_eq!(Family::Br04.error_status_offset(&caps), Some(0x0F8));
        assert_eq!(Family::Generic.error_status_offset(&caps), Some(0x48));
        assert_eq!(
            Family::Generic.error_status_offset(&CapabilityOffsets::default()),
            None
        );
    }

    #[test]
    fn counter_layouts_differ_by_generation() {
        let g3 = Family::Plx(PlxGeneration::Gen3).counter_layout().unwrap();
        let g4 = Family::Plx(PlxGeneration::Gen4).counter_layout().unwrap();
        assert_ne!(g3.receiver_errors, g4.receiver_errors);
        assert_eq!(g4.count_bits, 16);
        assert!(Family::Br04.counter_layout().is_none());
    }

    #[test]
    fn overrides() {
        let t = FamilyTable::default();
        let o = Family::Br03.aspm_override(PciId::new(0x10DE, 0x01B3), &t);
        assert_eq!((o.l0s, o.l1), (Some(true), Some(false)));
        let o = Family::Root.aspm_override(PciId::new(0x8086, 0x1901), &t);
        assert_eq!((o.l0s, o.l1), (Some(false), Some(true)));
        let o = Family::Root.aspm_override(PciId::new(0x8086, 0x9999), &t);
        assert_eq!(o, AspmOverride::default());
    }
}
