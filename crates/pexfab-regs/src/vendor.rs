// SPDX-License-Identifier: AGPL-3.0-only

//! Vendor-defined register layouts of the managed bridge families.
//!
//! Offsets are relative to a port's configuration space (or to the port's
//! slice of the chip's BAR0 window, which mirrors it).

/// BR03 bridge.
pub mod br03 {
    /// Error control/status mirror: control in bits 15:0, the four
    /// error-detected flags in bits 19:16, same as DevCtl/DevSta.
    pub const ERROR_CTL_STA: u16 = 0x0E0;
}

/// BR04 switch.
pub mod br04 {
    /// Error control/status mirror, DevCtl/DevSta bit layout.
    pub const ERROR_CTL_STA: u16 = 0x0F8;
    /// Per-port stride inside BAR0; each slice mirrors that port's config space.
    pub const PORT_STRIDE: usize = 0x1000;
    /// BAR0 window size (upstream port plus up to four downstream ports).
    pub const BAR0_SIZE: usize = 5 * PORT_STRIDE;
}

/// PLX / Broadcom PEX switches.
pub mod plx {
    /// Per-port stride inside the BAR0 station window.
    pub const PORT_STRIDE: usize = 0x1000;
    /// BAR0 window size mapped for counter access (up to 96 ports).
    pub const BAR0_SIZE: usize = 96 * PORT_STRIDE;

    /// Bad TLP counter, 32-bit, not self-clearing; write zero to reset.
    pub const BAD_TLP_COUNT: usize = 0x1E8;
    /// Bad DLLP counter, 32-bit, not self-clearing; write zero to reset.
    pub const BAD_DLLP_COUNT: usize = 0x1EC;

    /// Gen3 (PEX87xx) receiver error register.
    pub mod gen3 {
        /// Register offset within a port slice.
        pub const RECEIVER_ERRORS: usize = 0xBF0;
        /// Count field low bit.
        pub const COUNT_LO: u32 = 0;
        /// Count field width.
        pub const COUNT_BITS: u32 = 8;
        /// Reset: write zero to the whole register.
        pub const RESET_VALUE: u32 = 0;
    }

    /// Gen4 (PEX88xxx) receiver error register.
    pub mod gen4 {
        /// Register offset within a port slice.
        pub const RECEIVER_ERRORS: usize = 0xB5C;
        /// Count field low bit.
        pub const COUNT_LO: u32 = 16;
        /// Count field width.
        pub const COUNT_BITS: u32 = 16;
        /// Reset: write one to the self-clearing reset bit.
        pub const RESET_VALUE: u32 = 1 << 0;
    }
}
