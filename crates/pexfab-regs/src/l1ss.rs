// SPDX-License-Identifier: AGPL-3.0-only

//! L1 PM Substates extended capability (id 0x001E).
//!
//! ```text
//! +0x04  L1 PM substates capabilities
//!        [0] PCI-PM L1.2   [1] PCI-PM L1.1   [2] ASPM L1.2   [3] ASPM L1.1
//!        [4] L1 PM substates supported
//!        [15:8] port common mode restore time
//!        [17:16] port T_POWER_ON scale   [23:19] port T_POWER_ON value
//! +0x08  L1 PM substates control 1
//!        [0] PCI-PM L1.2 en  [1] PCI-PM L1.1 en  [2] ASPM L1.2 en  [3] ASPM L1.1 en
//!        [15:8] common mode restore time (downstream ports only)
//!        [25:16] LTR_L1.2_THRESHOLD value   [31:29] LTR_L1.2_THRESHOLD scale
//! +0x0C  L1 PM substates control 2
//!        [1:0] T_POWER_ON scale   [7:3] T_POWER_ON value
//! ```

/// L1 PM substates capabilities.
pub const CAPS: u16 = 0x04;
/// L1 PM substates control 1.
pub const CTL1: u16 = 0x08;
/// L1 PM substates control 2.
pub const CTL2: u16 = 0x0C;

/// PCI-PM L1.2 (capability / enable).
pub const PCIPM_L1_2: u32 = 1 << 0;
/// PCI-PM L1.1 (capability / enable).
pub const PCIPM_L1_1: u32 = 1 << 1;
/// ASPM L1.2 (capability / enable).
pub const ASPM_L1_2: u32 = 1 << 2;
/// ASPM L1.1 (capability / enable).
pub const ASPM_L1_1: u32 = 1 << 3;
/// L1 PM substates supported (capability only).
pub const CAP_SUBSTATES: u32 = 1 << 4;

/// All ASPM substate enables.
pub const ASPM_MASK: u32 = ASPM_L1_1 | ASPM_L1_2;
/// All PCI-PM substate enables.
pub const PCIPM_MASK: u32 = PCIPM_L1_1 | PCIPM_L1_2;
/// Every L1.2 enable, ASPM and PCI-PM.
pub const L1_2_MASK: u32 = ASPM_L1_2 | PCIPM_L1_2;
/// Every substate enable bit of control 1.
pub const ENABLE_MASK: u32 = ASPM_MASK | PCIPM_MASK;

/// Common mode restore time field of control 1.
pub const CTL1_CM_RESTORE_LO: u32 = 8;
/// Width of the common mode restore time field.
pub const CTL1_CM_RESTORE_BITS: u32 = 8;
/// LTR L1.2 threshold value field of control 1.
pub const CTL1_THRESHOLD_VALUE_LO: u32 = 16;
/// Width of the LTR L1.2 threshold value field.
pub const CTL1_THRESHOLD_VALUE_BITS: u32 = 10;
/// LTR L1.2 threshold scale field of control 1.
pub const CTL1_THRESHOLD_SCALE_LO: u32 = 29;
/// Width of the LTR L1.2 threshold scale field.
pub const CTL1_THRESHOLD_SCALE_BITS: u32 = 3;

/// T_POWER_ON scale field of control 2.
pub const CTL2_POWER_ON_SCALE_LO: u32 = 0;
/// Width of the T_POWER_ON scale field.
pub const CTL2_POWER_ON_SCALE_BITS: u32 = 2;
/// T_POWER_ON value field of control 2.
pub const CTL2_POWER_ON_VALUE_LO: u32 = 3;
/// Width of the T_POWER_ON value field.
pub const CTL2_POWER_ON_VALUE_BITS: u32 = 5;

/// Defaults programmed when L1.2 is enabled with unprogrammed thresholds.
pub mod defaults {
    /// LTR_L1.2_THRESHOLD value (x 1024 ns scale below = ~163 us).
    pub const THRESHOLD_VALUE: u32 = 0xA0;
    /// LTR_L1.2_THRESHOLD scale (2 = 1024 ns).
    pub const THRESHOLD_SCALE: u32 = 2;
    /// Common mode restore time in microseconds (downstream ports only).
    pub const CM_RESTORE_US: u32 = 0x3C;
    /// T_POWER_ON value.
    pub const POWER_ON_VALUE: u32 = 5;
    /// T_POWER_ON scale (1 = 10 us).
    pub const POWER_ON_SCALE: u32 = 1;
}
