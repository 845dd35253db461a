// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration space header.
//!
//! ```text
//! Offset  Type-1 (bridge) header, dword view
//! ──────  ─────────────────────────────────────────────────────────────
//!  0x00   Device ID        | Vendor ID
//!  0x04   Status           | Command
//!  0x08   Class code (24)                            | Revision ID
//!  0x0C   BIST | Header type | Latency timer | Cache line size
//!  0x10   BAR0
//!  0x14   BAR1
//!  0x18   Sec. latency | Subordinate bus | Secondary bus | Primary bus
//!  0x34   Capabilities pointer (low byte)
//!  0x3C   Bridge control   | Interrupt pin | Interrupt line
//! ```

// ── Header offsets ───────────────────────────────────────────────────────────

/// Vendor ID (bits 15:0) / Device ID (bits 31:16).
pub const ID: u16 = 0x00;
/// Command (bits 15:0) / Status (bits 31:16).
pub const COMMAND_STATUS: u16 = 0x04;
/// Revision (bits 7:0) / Class code (bits 31:8).
pub const CLASS_REVISION: u16 = 0x08;
/// Header type lives in bits 23:16 of this dword.
pub const HEADER_DWORD: u16 = 0x0C;
/// Base address register 0.
pub const BAR0: u16 = 0x10;
/// Base address register 1 (upper half of a 64-bit BAR0).
pub const BAR1: u16 = 0x14;
/// Primary / secondary / subordinate bus numbers (type-1 only).
pub const BUS_NUMBERS: u16 = 0x18;
/// Capabilities pointer.
pub const CAP_PTR: u16 = 0x34;
/// Interrupt line/pin (15:0) and bridge control (31:16).
pub const BRIDGE_CONTROL: u16 = 0x3C;

/// Size of the legacy configuration header region.
pub const LEGACY_SIZE: u16 = 0x100;
/// Size of the PCI Express extended configuration space.
pub const EXTENDED_SIZE: u16 = 0x1000;

// ── Command / status bits (dword view) ───────────────────────────────────────

/// Memory space enable.
pub const CMD_MEMORY: u32 = 1 << 1;
/// Bus master enable.
pub const CMD_BUS_MASTER: u32 = 1 << 2;
/// Capabilities list present (Status bit 4).
pub const STATUS_CAP_LIST: u32 = 1 << (16 + 4);

// ── Header type ──────────────────────────────────────────────────────────────

/// Header layout field mask (bit 7 is the multi-function flag).
pub const HEADER_TYPE_MASK: u32 = 0x7F;
/// Type-0 endpoint header.
pub const HEADER_TYPE_NORMAL: u32 = 0;
/// Type-1 PCI-to-PCI bridge header.
pub const HEADER_TYPE_BRIDGE: u32 = 1;

// ── Class codes (24-bit: base << 16 | sub << 8 | prog-if) ────────────────────

/// PCI-to-PCI bridge, base class 0x06 subclass 0x04.
pub const CLASS_PCI_BRIDGE: u32 = 0x06_0400;
/// Mask used to compare class codes while ignoring the programming interface.
pub const CLASS_MASK_NO_PROG_IF: u32 = 0xFF_FF00;
/// Display controller base class.
pub const BASE_CLASS_DISPLAY: u8 = 0x03;
/// Processing accelerator base class.
pub const BASE_CLASS_ACCELERATOR: u8 = 0x12;

// ── Bridge control (dword view, bits 31:16) ──────────────────────────────────

/// Secondary bus reset.
pub const BRIDGE_CTL_BUS_RESET: u32 = 1 << (16 + 6);

// ── BAR decode ───────────────────────────────────────────────────────────────

/// I/O space indicator.
pub const BAR_IO: u32 = 1 << 0;
/// Memory BAR type field (bits 2:1); `0b10` is 64-bit.
pub const BAR_TYPE_64: u32 = 0b10 << 1;
/// Memory BAR address mask.
pub const BAR_MEM_MASK: u32 = !0xF;

/// Standard capability ids (first byte of each capability header).
pub mod cap_id {
    /// Power management.
    pub const POWER_MANAGEMENT: u8 = 0x01;
    /// MSI.
    pub const MSI: u8 = 0x05;
    /// PCI Express.
    pub const PCI_EXPRESS: u8 = 0x10;
}

/// Maximum capability list walk length.
///
/// 48 capability headers fit in the 192 bytes after the legacy header; any
/// list longer than that is a loop.
pub const MAX_CAP_WALK: usize = 48;

/// Decode `(primary, secondary, subordinate)` from the bus-number dword.
#[must_use]
pub const fn bus_numbers(dword: u32) -> (u8, u8, u8) {
    (
        (dword & 0xFF) as u8,
        ((dword >> 8) & 0xFF) as u8,
        ((dword >> 16) & 0xFF) as u8,
    )
}

/// Decode the 24-bit class code from the class/revision dword.
#[must_use]
pub const fn class_code(dword: u32) -> u32 {
    dword >> 8
}

/// Decode the header layout type from the header dword.
#[must_use]
pub const fn header_type(dword: u32) -> u32 {
    (dword >> 16) & HEADER_TYPE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bus_numbers() {
        assert_eq!(bus_numbers(0x0005_0100), (0, 1, 5));
        assert_eq!(bus_numbers(0x0003_0201), (1, 2, 3));
    }

    #[test]
    fn decodes_class_and_header() {
        assert_eq!(class_code(0x0604_0001), CLASS_PCI_BRIDGE);
        assert_eq!(header_type(0x0081_0000), HEADER_TYPE_BRIDGE);
    }
}
