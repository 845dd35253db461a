// SPDX-License-Identifier: AGPL-3.0-only

//! Extended capability list (configuration space 0x100..0xFFF).
//!
//! ```text
//! 31          20 19    16 15                 0
//! ┌─────────────┬────────┬───────────────────┐
//! │ next offset │ version│  capability id    │
//! └─────────────┴────────┴───────────────────┘
//! ```

/// Offset of the first extended capability header.
pub const FIRST: u16 = 0x100;

/// Maximum extended capability walk length.
///
/// Each header is at least 4 bytes in 3840 bytes of extended space.
pub const MAX_WALK: usize = 960;

/// Extended capability ids.
pub mod id {
    /// Advanced Error Reporting.
    pub const AER: u16 = 0x0001;
    /// Downstream Port Containment.
    pub const DPC: u16 = 0x001D;
    /// L1 PM Substates.
    pub const L1SS: u16 = 0x001E;
}

/// Capability id of an extended header.
#[must_use]
pub const fn cap_id(header: u32) -> u16 {
    (header & 0xFFFF) as u16
}

/// Next capability offset of an extended header (dword aligned).
#[must_use]
pub const fn next(header: u32) -> u16 {
    ((header >> 20) & 0xFFC) as u16
}

/// Build an extended capability header; used by simulated config spaces.
#[must_use]
pub const fn header(id: u16, version: u8, next: u16) -> u32 {
    (id as u32) | ((version as u32 & 0xF) << 16) | ((next as u32) << 20)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_fields() {
        let h = header(id::L1SS, 1, 0x160);
        assert_eq!(cap_id(h), id::L1SS);
        assert_eq!(next(h), 0x160);
    }
}
