// SPDX-License-Identifier: AGPL-3.0-only

//! Platform primitives consumed by the fabric manager
//!
//! Two platforms available:
//! - **Sysfs**: Linux `/sys/bus/pci/devices/*/config` and `resourceN` (real hardware)
//! - **Sim**: in-memory configuration space with write recording (CI, tests)
//!
//! The manager only ever talks to a [`Platform`]; nothing above this module
//! knows which one it is driving.

pub mod mmap;
pub mod sim;
pub mod sysfs;

pub use sim::{RecordedWrite, SimFunction, SimMmio, SimPlatform};
pub use sysfs::SysfsPlatform;

use crate::address::PciAddress;
use crate::error::{PexError, Result};
use crate::link::{Aspm, LinkSpeed};
use std::fmt::Debug;
use std::sync::Arc;

/// A mapped MMIO region
///
/// Offsets are byte offsets from the start of the region. Accesses are
/// 32-bit and bounds-checked by the implementation.
pub trait Mmio: Debug + Send + Sync {
    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is outside the region.
    fn read_u32(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is outside the region.
    fn write_u32(&self, offset: usize, value: u32) -> Result<()>;

    /// Region size in bytes
    fn size(&self) -> usize;
}

/// Privileged out-of-band requests
///
/// Used only where raw register access is insufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlRequest {
    /// Physical address of a bridge's hidden BAR0
    Bar0Address {
        /// Upstream port of the bridge
        addr: PciAddress,
    },
    /// Current upstream link speed as seen by the host
    GetUpstreamSpeed {
        /// Upstream port of the bridge
        addr: PciAddress,
    },
    /// Change the upstream link speed with host-side coordination
    SetUpstreamSpeed {
        /// Upstream port of the bridge
        addr: PciAddress,
        /// Requested speed
        speed: LinkSpeed,
    },
    /// Acquire the chipset handle and report its ASPM capability
    ChipsetAspm {
        /// Root port
        addr: PciAddress,
    },
}

/// Responses to [`ControlRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    /// Request completed with no payload
    Done,
    /// Physical address
    Address(u64),
    /// Link speed
    Speed(LinkSpeed),
    /// ASPM capability mask
    Aspm(Aspm),
}

/// Platform access primitives
///
/// Config-space accesses are 32-bit and dword aligned.
pub trait Platform: Debug + Send + Sync {
    /// Every PCI function visible on the system
    ///
    /// # Errors
    ///
    /// Returns error if the bus cannot be enumerated.
    fn enumerate(&self) -> Result<Vec<PciAddress>>;

    /// Configuration-space read
    ///
    /// # Errors
    ///
    /// Returns error if the platform call fails.
    fn config_read(&self, addr: PciAddress, offset: u16) -> Result<u32>;

    /// Configuration-space write
    ///
    /// # Errors
    ///
    /// Returns error if the platform call fails.
    fn config_write(&self, addr: PciAddress, offset: u16, value: u32) -> Result<()>;

    /// Map a function's BAR
    ///
    /// # Errors
    ///
    /// Returns error if the BAR does not exist or cannot be mapped.
    fn map_bar(&self, addr: PciAddress, bar: u8) -> Result<Arc<dyn Mmio>>;

    /// Map a physical address range
    ///
    /// # Errors
    ///
    /// Returns error if the range cannot be mapped.
    fn map_physical(&self, base: u64, size: usize) -> Result<Arc<dyn Mmio>> {
        let _ = size;
        Err(PexError::unsupported(format!(
            "physical mapping of {base:#x} on this platform"
        )))
    }

    /// Privileged out-of-band control call
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` by default.
    fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
        Err(PexError::unsupported(format!("control call {request:?}")))
    }
}
