// SPDX-License-Identifier: AGPL-3.0-only

//! Downstream Port Containment extended capability (id 0x001D).
//!
//! ```text
//! +0x04  DPC capability (15:0) | DPC control (31:16)
//! +0x08  DPC status (15:0)     | DPC error source id (31:16)
//! ```

/// DPC capability / control dword.
pub const CAP_CTL: u16 = 0x04;
/// DPC status / error source id dword.
pub const STATUS: u16 = 0x08;

/// DPC trigger enable field (control bits 1:0, dword bits 17:16).
pub const CTL_TRIGGER_LO: u32 = 16;
/// Width of the DPC trigger enable field.
pub const CTL_TRIGGER_BITS: u32 = 2;

/// Trigger encodings.
pub mod trigger {
    /// DPC disabled.
    pub const DISABLED: u32 = 0b00;
    /// Trigger on ERR_FATAL.
    pub const FATAL: u32 = 0b01;
    /// Trigger on ERR_NONFATAL or ERR_FATAL.
    pub const NON_FATAL: u32 = 0b10;
}

/// RP extensions for DPC (capability bit 5).
pub const CAP_RP_EXTENSIONS: u32 = 1 << 5;
/// DPC software triggering supported (capability bit 7).
pub const CAP_SOFTWARE_TRIGGER: u32 = 1 << 7;

/// DPC trigger status (status bit 0, RW1CS).
pub const STATUS_TRIGGERED: u32 = 1 << 0;
