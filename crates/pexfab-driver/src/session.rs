// SPDX-License-Identifier: AGPL-3.0-only

//! Saved link settings
//!
//! A session is the per-hop state of every link between a leaf and its
//! root, captured nearest hop first and replayed in the same order.

use crate::link::{Aspm, DpcMode, L1ssState, LinkSpeed};
use crate::topology::DeviceId;
use std::fmt;
use std::ops::BitOr;

/// Identifier returned by `save_setting`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Parameters to capture or replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SaveMask(u8);

impl SaveMask {
    /// Nothing
    pub const NONE: Self = Self(0);
    /// Link target speed
    pub const SPEED: Self = Self(1 << 0);
    /// ASPM L0s/L1 enables on both ends
    pub const ASPM: Self = Self(1 << 1);
    /// L1 PM substate enables on both ends
    pub const L1SS: Self = Self(1 << 2);
    /// Negotiated width (compared on restore, never written)
    pub const WIDTH: Self = Self(1 << 3);
    /// DPC trigger mode
    pub const DPC: Self = Self(1 << 4);
    /// Everything
    pub const ALL: Self = Self(0x1F);

    /// Every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Nothing selected
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SaveMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::str::FromStr for SaveMask {
    type Err = crate::error::PexError;

    /// Comma-separated names, e.g. `speed,aspm`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            mask = mask
                | match part.to_ascii_lowercase().as_str() {
                    "speed" => Self::SPEED,
                    "aspm" => Self::ASPM,
                    "l1ss" => Self::L1SS,
                    "width" => Self::WIDTH,
                    "dpc" => Self::DPC,
                    "all" => Self::ALL,
                    other => {
                        return Err(crate::error::PexError::invalid_value("setting", other))
                    }
                };
        }
        Ok(mask)
    }
}

/// State of one link, captured at one hop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HopSetting {
    /// Device owning the parent-side port
    pub device: DeviceId,
    /// Downstream port index on that device
    pub port: usize,
    /// Device depth
    pub depth: u32,
    /// Current link speed
    pub speed: Option<LinkSpeed>,
    /// Negotiated width
    pub width: Option<u8>,
    /// ASPM on the parent-side port
    pub parent_aspm: Option<Aspm>,
    /// ASPM on the child-side port
    pub child_aspm: Option<Aspm>,
    /// L1SS on the parent-side port
    pub parent_l1ss: Option<L1ssState>,
    /// L1SS on the child-side port
    pub child_l1ss: Option<L1ssState>,
    /// DPC trigger mode of the parent-side port
    pub dpc: Option<DpcMode>,
}

/// A saved session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// What was captured
    pub mask: SaveMask,
    /// Hops, leaf side first
    pub hops: Vec<HopSetting>,
}

/// Performance state supplied by the caller for speed restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfState {
    /// The current state permits link speed changes
    pub speed_change_allowed: bool,
    /// Highest speed the state allows
    pub max_speed: LinkSpeed,
}

/// Restore behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreOptions {
    /// Performance state gate for speed restore; `None` means unrestricted
    pub perf: Option<PerfState>,
    /// Write ASPM as saved, ignoring the chipset capability mask
    pub force: bool,
}
