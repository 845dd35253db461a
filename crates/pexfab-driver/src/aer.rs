// SPDX-License-Identifier: AGPL-3.0-only

//! AER snapshot log
//!
//! Each port keeps a bounded ring of AER capability snapshots taken when
//! the drain path finds an error. The ring lives under the port's error
//! mutex; this type itself does no locking.

use pexfab_regs::aer::BLOCK_DWORDS;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Default number of snapshots kept per port
pub const DEFAULT_CAPACITY: usize = 16;

/// What to do when a full log receives another entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Drop the oldest entry to make room
    #[default]
    DeleteOldest,
    /// Keep the log as is and drop the new entry
    IgnoreNew,
}

impl OverflowPolicy {
    pub(crate) const fn to_raw(self) -> u8 {
        match self {
            Self::DeleteOldest => 0,
            Self::IgnoreNew => 1,
        }
    }

    pub(crate) const fn from_raw(raw: u8) -> Self {
        if raw == 1 {
            Self::IgnoreNew
        } else {
            Self::DeleteOldest
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = crate::error::PexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete-oldest" | "oldest" => Ok(Self::DeleteOldest),
            "ignore-new" | "new" => Ok(Self::IgnoreNew),
            other => Err(crate::error::PexError::invalid_value("AER overflow policy", other)),
        }
    }
}

/// One captured AER block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AerEntry {
    /// DevSta error bits that triggered the capture
    pub status: u32,
    /// Raw AER capability dwords starting at the extended header
    pub block: [u32; BLOCK_DWORDS],
    /// Capture time
    pub captured_at: SystemTime,
}

impl AerEntry {
    /// Uncorrectable error status at capture time
    pub const fn uncorrectable(&self) -> u32 {
        self.block[1]
    }

    /// Correctable error status at capture time
    pub const fn correctable(&self) -> u32 {
        self.block[4]
    }
}

impl fmt::Display for AerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "devsta={:#x} ue={:#010x} ce={:#010x} hdr=[{:08x} {:08x} {:08x} {:08x}]",
            self.status,
            self.uncorrectable(),
            self.correctable(),
            self.block[7],
            self.block[8],
            self.block[9],
            self.block[10]
        )
    }
}

/// Capacity-bounded ring of [`AerEntry`]
#[derive(Debug, Clone)]
pub struct AerLog {
    entries: VecDeque<AerEntry>,
    capacity: usize,
    dropped: u64,
}

impl AerLog {
    /// Empty log holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Insert under `policy`; returns false if the entry was not stored
    pub fn push(&mut self, entry: AerEntry, policy: OverflowPolicy) -> bool {
        if self.capacity == 0 {
            self.dropped += 1;
            return false;
        }
        if self.entries.len() >= self.capacity {
            match policy {
                OverflowPolicy::IgnoreNew => {
                    self.dropped += 1;
                    return false;
                }
                OverflowPolicy::DeleteOldest => {
                    self.entries.pop_front();
                    self.dropped += 1;
                }
            }
        }
        self.entries.push_back(entry);
        true
    }

    /// Change the capacity, dropping the oldest entries if it shrinks
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
    }

    /// Entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &AerEntry> {
        self.entries.iter()
    }

    /// Copy of the entries, oldest first
    pub fn snapshot(&self) -> Vec<AerEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries lost to overflow since creation
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u32) -> AerEntry {
        AerEntry {
            status,
            block: [0; BLOCK_DWORDS],
            captured_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn delete_oldest_keeps_most_recent_in_order() {
        let n = 4;
        let mut log = AerLog::new(n);
        for i in 0..=n {
            assert!(log.push(entry(i as u32), OverflowPolicy::DeleteOldest));
        }
        let kept: Vec<u32> = log.entries().map(|e| e.status).collect();
        assert_eq!(kept, vec![1, 2, 3, 4]);
        assert_eq!(log.dropped(), 1);
    }

    #[test]
    fn ignore_new_keeps_first_entries() {
        let mut log = AerLog::new(2);
        log.push(entry(1), OverflowPolicy::IgnoreNew);
        log.push(entry(2), OverflowPolicy::IgnoreNew);
        assert!(!log.push(entry(3), OverflowPolicy::IgnoreNew));
        let kept: Vec<u32> = log.entries().map(|e| e.status).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn shrinking_capacity_trims_oldest() {
        let mut log = AerLog::new(3);
        for i in 0..3 {
            log.push(entry(i), OverflowPolicy::DeleteOldest);
        }
        log.set_capacity(1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].status, 2);
        assert!(log.len() <= log.capacity());
    }

    #[test]
    fn policy_parses() {
        assert_eq!("ignore-new".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::IgnoreNew);
        assert_eq!(OverflowPolicy::from_raw(OverflowPolicy::IgnoreNew.to_raw()), OverflowPolicy::IgnoreNew);
        let err = "newest".parse::<OverflowPolicy>().unwrap_err();
        assert!(matches!(err, crate::error::PexError::InvalidValue { .. }));
        assert_eq!(err.to_string(), "Invalid AER overflow policy 'newest'");
    }
}
