// SPDX-License-Identifier: AGPL-3.0-only

//! Pure Rust fabric manager for PCIe bridge hierarchies.
//!
//! Discovers root ports, switches and virtual bridges from configuration
//! space, links them into a tree above each accelerator, and manages link
//! power (ASPM, L1 substates), speed, containment (DPC) and error
//! accounting along the path from a leaf to its root.
//!
//! # Platform hierarchy
//!
//! ```text
//! Production:
//!   SysfsPlatform: /sys/bus/pci/devices/*/config + resourceN mmap
//!
//! Development / CI:
//!   SimPlatform:   in-memory config space, write log, scripted control calls
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use pexfab_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::linux(ManagerConfig::from_env()?);
//! let topology = manager.find_devices()?;
//! manager.initialize_all()?;
//!
//! for leaf in topology.leaves() {
//!     for hop in manager.chain_error_counts(leaf.id(), ErrorSource::Combined)? {
//!         println!("{} port {}: {}", hop.device, hop.port, hop.counts);
//!     }
//! }
//! manager.shutdown_all()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Families
//!
//! | Family | Counters | Extra window |
//! |--------|----------|--------------|
//! | Root | flags only | none |
//! | BR03 | flags only | none |
//! | BR04 | flags, via the vendor status mirror | control-call BAR0 |
//! | PLX Gen3/Gen4 | per-port MMIO | upstream BAR0 |
//! | Virtual | flags only | none |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod access;
pub mod address;
pub mod aer;
pub mod capability;
pub mod collector;
pub mod counters;
pub mod device;
mod error;
pub mod error_counts;
pub mod family;
pub mod hwcounter;
pub mod l1ss;
pub mod link;
mod manager;
pub mod platform;
pub mod port;
pub mod registry;
pub mod session;
pub mod settings;
pub mod topology;

pub use access::RegisterAccess;
pub use address::{PciAddress, PciId};
pub use aer::{AerEntry, AerLog, OverflowPolicy};
pub use collector::{Collector, CollectorPause};
pub use counters::{Counter, CounterMask, ErrorCounters, ErrorSource};
pub use device::{BridgeDevice, Child, DeviceState, PortSelect};
pub use error::{PexError, Result, StickyError};
pub use family::{Family, FamilyTable, PlxGeneration};
pub use l1ss::L1ssRequest;
pub use link::{Aspm, DpcMode, L1ssState, LinkSpeed, LinkStatus};
pub use manager::{HopCounts, Manager};
pub use platform::{Platform, SimPlatform, SysfsPlatform};
pub use port::Port;
pub use session::{PerfState, RestoreOptions, SaveMask, Session, SessionId};
pub use settings::{ManagerConfig, Settings};
pub use topology::{DeviceId, LeafDevice, LeafId, Topology};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Aspm, DeviceId, DpcMode, ErrorCounters, ErrorSource, L1ssRequest, L1ssState, LeafId,
        LinkSpeed, Manager, ManagerConfig, PciAddress, PexError, PortSelect, RestoreOptions,
        Result, SaveMask, SessionId, Topology,
    };
}
