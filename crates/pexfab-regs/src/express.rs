// SPDX-License-Identifier: AGPL-3.0-only

//! PCI Express capability structure (capability id 0x10).
//!
//! Offsets are relative to the capability base found in the standard list.
//! Registers are described in their 32-bit dword view: a 16-bit control
//! register in bits 15:0 and its status register in bits 31:16.

/// Capabilities register (31:16) / capability header (15:0).
pub const CAP: u16 = 0x00;
/// Device capabilities.
pub const DEVICE_CAP: u16 = 0x04;
/// Device control (15:0) / device status (31:16).
pub const DEVICE_CTL_STA: u16 = 0x08;
/// Link capabilities.
pub const LINK_CAP: u16 = 0x0C;
/// Link control (15:0) / link status (31:16).
pub const LINK_CTL_STA: u16 = 0x10;
/// Slot capabilities.
pub const SLOT_CAP: u16 = 0x14;
/// Slot control (15:0) / slot status (31:16).
pub const SLOT_CTL_STA: u16 = 0x18;
/// Link capabilities 2.
pub const LINK_CAP2: u16 = 0x2C;
/// Link control 2 (15:0) / link status 2 (31:16).
pub const LINK_CTL2_STA2: u16 = 0x30;

/// Device/port type field of the capabilities register (bits 23:20 of dword 0).
pub mod port_type {
    /// PCI Express endpoint.
    pub const ENDPOINT: u32 = 0x0;
    /// Legacy endpoint.
    pub const LEGACY_ENDPOINT: u32 = 0x1;
    /// Root port of a root complex.
    pub const ROOT_PORT: u32 = 0x4;
    /// Upstream port of a switch.
    pub const UPSTREAM: u32 = 0x5;
    /// Downstream port of a switch.
    pub const DOWNSTREAM: u32 = 0x6;
    /// PCI Express to PCI/PCI-X bridge.
    pub const PCIE_TO_PCI: u32 = 0x7;
    /// PCI/PCI-X to PCI Express bridge.
    pub const PCI_TO_PCIE: u32 = 0x8;

    /// Decode the port type from capability dword 0.
    #[must_use]
    pub const fn decode(cap_dword: u32) -> u32 {
        (cap_dword >> 20) & 0xF
    }

    /// Ports that face away from the root complex.
    #[must_use]
    pub const fn is_downstream_facing(kind: u32) -> bool {
        matches!(kind, ROOT_PORT | DOWNSTREAM | PCIE_TO_PCI)
    }
}

/// Device control / status bits.
pub mod device {
    /// Correctable error reporting enable.
    pub const CTL_CORRECTABLE_EN: u32 = 1 << 0;
    /// Non-fatal error reporting enable.
    pub const CTL_NON_FATAL_EN: u32 = 1 << 1;
    /// Fatal error reporting enable.
    pub const CTL_FATAL_EN: u32 = 1 << 2;
    /// Unsupported request reporting enable.
    pub const CTL_UNSUPPORTED_EN: u32 = 1 << 3;

    /// Status bit offset of the dword view.
    pub const STATUS_SHIFT: u32 = 16;
    /// Correctable error detected (status bit 0).
    pub const STA_CORRECTABLE: u32 = 1 << 0;
    /// Non-fatal error detected (status bit 1).
    pub const STA_NON_FATAL: u32 = 1 << 1;
    /// Fatal error detected (status bit 2).
    pub const STA_FATAL: u32 = 1 << 2;
    /// Unsupported request detected (status bit 3).
    pub const STA_UNSUPPORTED: u32 = 1 << 3;
    /// All four RW1C error-detected bits.
    pub const STA_ERRORS: u32 = 0xF;
}

/// Link capabilities / control / status bits.
pub mod link {
    /// Max link speed code (LinkCap bits 3:0).
    pub const CAP_SPEED_LO: u32 = 0;
    /// Width of the max link speed field.
    pub const CAP_SPEED_BITS: u32 = 4;
    /// Max link width (LinkCap bits 9:4).
    pub const CAP_WIDTH_LO: u32 = 4;
    /// Width of the max link width field.
    pub const CAP_WIDTH_BITS: u32 = 6;
    /// ASPM support L0s (LinkCap bit 10).
    pub const CAP_ASPM_L0S: u32 = 1 << 10;
    /// ASPM support L1 (LinkCap bit 11).
    pub const CAP_ASPM_L1: u32 = 1 << 11;
    /// Data link layer link active reporting capable.
    pub const CAP_DLL_ACTIVE_REPORTING: u32 = 1 << 20;
    /// Port number (LinkCap bits 31:24).
    pub const CAP_PORT_NUMBER_LO: u32 = 24;

    /// ASPM control (LinkCtl bits 1:0).
    pub const CTL_ASPM_MASK: u32 = 0b11;
    /// ASPM L0s enable.
    pub const CTL_ASPM_L0S: u32 = 1 << 0;
    /// ASPM L1 enable.
    pub const CTL_ASPM_L1: u32 = 1 << 1;
    /// Link disable.
    pub const CTL_LINK_DISABLE: u32 = 1 << 4;
    /// Retrain link (reads as zero).
    pub const CTL_RETRAIN: u32 = 1 << 5;

    /// Current link speed (LinkSta bits 3:0, dword bits 19:16).
    pub const STA_SPEED_LO: u32 = 16;
    /// Negotiated link width (LinkSta bits 9:4, dword bits 25:20).
    pub const STA_WIDTH_LO: u32 = 20;
    /// Link training in progress (LinkSta bit 11).
    pub const STA_TRAINING: u32 = 1 << (16 + 11);
    /// Data link layer link active (LinkSta bit 13).
    pub const STA_DLL_ACTIVE: u32 = 1 << (16 + 13);
    /// RW1C status bits of LinkSta (bandwidth management / autonomous bw).
    pub const STA_RW1C: u32 = (1 << (16 + 14)) | (1 << (16 + 15));

    /// Target link speed (LinkCtl2 bits 3:0).
    pub const CTL2_TARGET_SPEED_LO: u32 = 0;

    /// Supported link speeds vector (LinkCap2 bits 7:1).
    pub const CAP2_SPEEDS_LO: u32 = 1;
    /// Width of the supported link speeds vector.
    pub const CAP2_SPEEDS_BITS: u32 = 7;
}

/// Link speed encodings shared by LinkCap, LinkSta and LinkCtl2.
pub mod speed {
    /// 2.5 GT/s.
    pub const GEN1: u32 = 1;
    /// 5.0 GT/s.
    pub const GEN2: u32 = 2;
    /// 8.0 GT/s.
    pub const GEN3: u32 = 3;
    /// 16.0 GT/s.
    pub const GEN4: u32 = 4;
    /// 32.0 GT/s.
    pub const GEN5: u32 = 5;
}

/// Slot capabilities / control / status bits.
pub mod slot {
    /// Hot-plug capable (SlotCap bit 6).
    pub const CAP_HOTPLUG: u32 = 1 << 6;
    /// No command completed support (SlotCap bit 18).
    pub const CAP_NO_COMMAND_COMPLETED: u32 = 1 << 18;

    /// Attention button pressed enable.
    pub const CTL_ATTN_BUTTON_EN: u32 = 1 << 0;
    /// Power fault detected enable.
    pub const CTL_POWER_FAULT_EN: u32 = 1 << 1;
    /// MRL sensor changed enable.
    pub const CTL_MRL_EN: u32 = 1 << 2;
    /// Presence detect changed enable.
    pub const CTL_PRESENCE_EN: u32 = 1 << 3;
    /// Command completed interrupt enable.
    pub const CTL_COMMAND_COMPLETED_EN: u32 = 1 << 4;
    /// Hot-plug interrupt enable.
    pub const CTL_HOTPLUG_INT_EN: u32 = 1 << 5;
    /// Data link layer state changed enable.
    pub const CTL_DLL_CHANGED_EN: u32 = 1 << 12;
    /// Enable bits armed for hot-plug event reporting.
    pub const CTL_HOTPLUG_EVENTS: u32 =
        CTL_PRESENCE_EN | CTL_HOTPLUG_INT_EN | CTL_DLL_CHANGED_EN;

    /// Attention button pressed (dword bit 16).
    pub const STA_ATTN_BUTTON: u32 = 1 << 16;
    /// Power fault detected.
    pub const STA_POWER_FAULT: u32 = 1 << 17;
    /// MRL sensor changed.
    pub const STA_MRL_CHANGED: u32 = 1 << 18;
    /// Presence detect changed.
    pub const STA_PRESENCE_CHANGED: u32 = 1 << 19;
    /// Command completed.
    pub const STA_COMMAND_COMPLETED: u32 = 1 << 20;
    /// Data link layer state changed.
    pub const STA_DLL_CHANGED: u32 = 1 << 24;
    /// Pending event bits cleared before arming hot-plug interrupts.
    pub const STA_PENDING_EVENTS: u32 = STA_ATTN_BUTTON
        | STA_POWER_FAULT
        | STA_MRL_CHANGED
        | STA_PRESENCE_CHANGED
        | STA_COMMAND_COMPLETED
        | STA_DLL_CHANGED;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_type_classification() {
        assert_eq!(port_type::decode(0x0042_0010), port_type::ROOT_PORT);
        assert!(port_type::is_downstream_facing(port_type::DOWNSTREAM));
        assert!(!port_type::is_downstream_facing(port_type::UPSTREAM));
    }

    #[test]
    fn link_status_bits_sit_in_upper_half() {
        assert_eq!(link::STA_TRAINING, 0x0800_0000);
        assert_eq!(link::STA_DLL_ACTIVE, 0x2000_0000);
    }
}
