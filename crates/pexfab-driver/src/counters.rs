// SPDX-License-Identifier: AGPL-3.0-only

//! Error counter set
//!
//! Four basic counters mirror the DevSta error bits. The detailed counters
//! are filled only by sources that actually measure them; [`CounterMask`]s
//! tell a caller which slots mean anything for a given read.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Maximum lanes tracked per link
pub const MAX_LANES: usize = 16;

/// One error counter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Counter {
    /// Correctable errors
    Correctable = 0,
    /// Non-fatal uncorrectable errors
    NonFatal,
    /// Fatal uncorrectable errors
    Fatal,
    /// Unsupported requests
    UnsupportedRequest,
    /// Line errors
    Line,
    /// CRC errors
    Crc,
    /// NAKs sent
    NakSent,
    /// NAKs received
    NakReceived,
    /// Replays
    Replay,
    /// Receiver errors
    Receiver,
    /// Lane errors (sum of the per-lane array)
    Lane,
    /// Bad DLLPs
    BadDllp,
    /// Bad TLPs
    BadTlp,
    /// Replay number rollovers
    Rollover,
    /// 8b/10b decode errors
    Decode8b10b,
    /// 128b/130b sync header errors
    SyncHeader,
}

impl Counter {
    /// Number of counter slots
    pub const COUNT: usize = 16;

    /// The four counters backed by DevSta
    pub const BASIC: [Self; 4] = [
        Self::Correctable,
        Self::NonFatal,
        Self::Fatal,
        Self::UnsupportedRequest,
    ];

    /// Every counter, in slot order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Correctable,
        Self::NonFatal,
        Self::Fatal,
        Self::UnsupportedRequest,
        Self::Line,
        Self::Crc,
        Self::NakSent,
        Self::NakReceived,
        Self::Replay,
        Self::Receiver,
        Self::Lane,
        Self::BadDllp,
        Self::BadTlp,
        Self::Rollover,
        Self::Decode8b10b,
        Self::SyncHeader,
    ];

    /// Slot index
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Correctable => "correctable",
            Self::NonFatal => "non-fatal",
            Self::Fatal => "fatal",
            Self::UnsupportedRequest => "unsupported-request",
            Self::Line => "line",
            Self::Crc => "crc",
            Self::NakSent => "nak-sent",
            Self::NakReceived => "nak-received",
            Self::Replay => "replay",
            Self::Receiver => "receiver",
            Self::Lane => "lane",
            Self::BadDllp => "bad-dllp",
            Self::BadTlp => "bad-tlp",
            Self::Rollover => "rollover",
            Self::Decode8b10b => "8b10b",
            Self::SyncHeader => "sync-header",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of counter slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CounterMask(u32);

impl CounterMask {
    /// Empty mask
    pub const EMPTY: Self = Self(0);
    /// The four basic counters
    pub const BASIC: Self = Self(0b1111);

    /// Mask with one counter
    pub const fn of(counter: Counter) -> Self {
        Self(1 << counter as u32)
    }

    /// Add a counter
    #[must_use]
    pub const fn with(self, counter: Counter) -> Self {
        Self(self.0 | (1 << counter as u32))
    }

    /// Contains `counter`
    pub const fn contains(self, counter: Counter) -> bool {
        self.0 & (1 << counter as u32) != 0
    }

    /// Nothing set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Counters in this mask, in slot order
    pub fn iter(self) -> impl Iterator<Item = Counter> {
        Counter::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl BitOr for CounterMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CounterMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where a caller wants error counts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorSource {
    /// Sticky flags plus hardware counters where the family has them
    #[default]
    Combined,
    /// Hardware counter registers only
    HardwareOnly,
    /// Sticky DevSta flags only
    FlagOnly,
}

impl ErrorSource {
    /// Read the sticky flag path
    pub const fn uses_flags(self) -> bool {
        matches!(self, Self::Combined | Self::FlagOnly)
    }

    /// Read the hardware counter path
    pub const fn uses_hardware(self) -> bool {
        matches!(self, Self::Combined | Self::HardwareOnly)
    }
}

impl std::str::FromStr for ErrorSource {
    type Err = crate::error::PexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" | "all" => Ok(Self::Combined),
            "hw" | "hardware" => Ok(Self::HardwareOnly),
            "flags" | "flag" => Ok(Self::FlagOnly),
            other => Err(crate::error::PexError::invalid_value("error source", other)),
        }
    }
}

/// Error counts from one read of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorCounters {
    counts: [u64; Counter::COUNT],
    /// Per-lane error counts
    pub lanes: [u8; MAX_LANES],
    /// Slots populated by this read
    pub valid: CounterMask,
    /// Slots backed by a true incrementing hardware register
    pub hw: CounterMask,
    /// Slots a caller may compare against thresholds
    pub threshold: CounterMask,
}

impl ErrorCounters {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one slot
    pub const fn get(&self, counter: Counter) -> u64 {
        self.counts[counter as usize]
    }

    /// Add to one slot and mark it populated
    pub fn add(&mut self, counter: Counter, amount: u64) {
        let slot = &mut self.counts[counter.index()];
        *slot = slot.saturating_add(amount);
        self.valid |= CounterMask::of(counter);
    }

    /// Merge another read into this one
    pub fn merge(&mut self, other: &Self) {
        for c in other.valid.iter() {
            self.add(c, other.get(c));
        }
        for (mine, theirs) in self.lanes.iter_mut().zip(other.lanes) {
            *mine = mine.saturating_add(theirs);
        }
        self.hw |= other.hw;
        self.threshold |= other.threshold;
    }

    /// Sum of the four basic counters
    pub fn total_basic(&self) -> u64 {
        Counter::BASIC.iter().map(|c| self.get(*c)).sum()
    }

    /// Populated counters with a non-zero value
    pub fn nonzero(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        self.valid
            .iter()
            .map(|c| (c, self.get(c)))
            .filter(|(_, n)| *n != 0)
    }
}

impl fmt::Display for ErrorCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in self.valid.iter() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            let marker = if self.hw.contains(c) { "*" } else { "" };
            write!(f, "{c}{marker}={}", self.get(c))?;
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}
