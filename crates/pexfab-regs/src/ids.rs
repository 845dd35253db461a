// SPDX-License-Identifier: AGPL-3.0-only

//! Vendor:device tables used to classify bridge silicon.
//!
//! These are defaults. The driver copies them into its family table at
//! construction so a caller can extend them without touching global state.

/// NVIDIA vendor ID.
pub const NVIDIA: u16 = 0x10DE;
/// PLX Technology vendor ID (Gen3 PEX87xx switches).
pub const PLX: u16 = 0x10B5;
/// Broadcom / LSI vendor ID (Gen4 PEX88xxx switches).
pub const BROADCOM: u16 = 0x1000;
/// Red Hat / QEMU vendor ID.
pub const REDHAT_QEMU: u16 = 0x1B36;
/// Intel vendor ID.
pub const INTEL: u16 = 0x8086;
/// AMD vendor ID.
pub const AMD: u16 = 0x1022;

/// BR03 PCIe-to-PCIe bridge.
pub const BR03: &[(u16, u16)] = &[(NVIDIA, 0x01B3)];

/// BR04 PCIe switch (all sixteen SKUs).
pub const BR04: &[(u16, u16)] = &[
    (NVIDIA, 0x05B0),
    (NVIDIA, 0x05B1),
    (NVIDIA, 0x05B2),
    (NVIDIA, 0x05B3),
    (NVIDIA, 0x05B4),
    (NVIDIA, 0x05B5),
    (NVIDIA, 0x05B6),
    (NVIDIA, 0x05B7),
    (NVIDIA, 0x05B8),
    (NVIDIA, 0x05B9),
    (NVIDIA, 0x05BA),
    (NVIDIA, 0x05BB),
    (NVIDIA, 0x05BC),
    (NVIDIA, 0x05BD),
    (NVIDIA, 0x05BE),
    (NVIDIA, 0x05BF),
];

/// PLX PEX87xx Gen3 switches (receiver-error counter layout A).
pub const PLX_GEN3: &[(u16, u16)] = &[
    (PLX, 0x8724),
    (PLX, 0x8732),
    (PLX, 0x8747),
    (PLX, 0x8748),
    (PLX, 0x8749),
    (PLX, 0x8796),
];

/// Broadcom PEX88xxx Gen4 switches (receiver-error counter layout B).
pub const PLX_GEN4: &[(u16, u16)] = &[(BROADCOM, 0xC010), (BROADCOM, 0xC012)];

/// QEMU PCIe-to-PCI bridge: one function with no separate upstream port.
pub const VIRTUAL_BRIDGE: &[(u16, u16)] = &[(REDHAT_QEMU, 0x000E)];

/// Root ports whose ASPM L0s is unreliable while L1 is fine.
pub const ROOT_L0S_QUIRK: &[(u16, u16)] = &[
    (INTEL, 0x1901),
    (INTEL, 0x1905),
    (INTEL, 0x1909),
    (AMD, 0x1453),
];

/// Hot-plug ports whose command completed status is not reliably raised.
pub const NO_COMMAND_COMPLETED: &[(u16, u16)] = &[
    (INTEL, 0x0400),
    (INTEL, 0x0401),
    (INTEL, 0x0402),
    (INTEL, 0x0C00),
];

/// Pack a vendor:device pair the way the ID dword stores it.
#[must_use]
pub const fn pack(vendor: u16, device: u16) -> u32 {
    ((device as u32) << 16) | vendor as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_do_not_overlap() {
        for id in PLX_GEN3.iter().chain(PLX_GEN4) {
            assert!(!BR04.contains(id));
            assert!(!VIRTUAL_BRIDGE.contains(id));
        }
    }

    #[test]
    fn pack_matches_config_layout() {
        assert_eq!(pack(NVIDIA, 0x01B3), 0x01B3_10DE);
    }
}
