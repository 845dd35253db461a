// SPDX-License-Identifier: AGPL-3.0-only

//! Register model for PCI Express bridge / switch fabrics.
//!
//! This crate has **no dependencies** and **no hardware access**; it is a
//! pure model of configuration space: header offsets, capability layouts and
//! the vendor:device tables used to classify bridge silicon.
//!
//! Everything under [`config`], [`express`], [`aer`], [`l1ss`] and [`dpc`]
//! follows the PCI Express Base Specification bit-for-bit. [`vendor`] holds
//! the vendor-defined register layouts of the bridge families we manage.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | Type-0/type-1 header offsets, class codes, capability list |
//! | [`express`] | PCI Express capability: device, link, slot registers |
//! | [`ext`] | Extended capability header decode and ids |
//! | [`aer`] | Advanced Error Reporting layout and status bits |
//! | [`l1ss`] | L1 PM Substates capability / control layout |
//! | [`dpc`] | Downstream Port Containment layout |
//! | [`ids`] | Bridge family vendor:device tables |
//! | [`vendor`] | Vendor-specific error status and counter registers |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aer;
pub mod config;
pub mod dpc;
pub mod express;
pub mod ext;
pub mod ids;
pub mod l1ss;
pub mod vendor;

/// Extract a bit field `[lo, lo + width)` from a 32-bit register value.
#[must_use]
pub const fn field(value: u32, lo: u32, width: u32) -> u32 {
    (value >> lo) & ((1 << width) - 1)
}

/// Replace the bit field `[lo, lo + width)` of `value` with `field`.
#[must_use]
pub const fn with_field(value: u32, lo: u32, width: u32, field: u32) -> u32 {
    let mask = ((1 << width) - 1) << lo;
    (value & !mask) | ((field << lo) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extracts_and_replaces() {
        assert_eq!(field(0x00AB_CD00, 8, 8), 0xCD);
        assert_eq!(with_field(0xFFFF_FFFF, 4, 4, 0), 0xFFFF_FF0F);
        assert_eq!(with_field(0, 29, 3, 0b101), 0xA000_0000);
    }
}
