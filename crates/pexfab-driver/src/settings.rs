// SPDX-License-Identifier: AGPL-3.0-only

//! Manager configuration
//!
//! [`ManagerConfig`] is the construction-time view. The subset that may
//! change while the collector runs is copied into [`Settings`], a bag of
//! atomics shared by the manager, its devices and the collector thread.

use crate::aer::{OverflowPolicy, DEFAULT_CAPACITY};
use crate::error::{PexError, Result};
use crate::family::FamilyTable;
use crate::platform::sysfs::DEFAULT_SYSFS_ROOT;
use pexfab_regs::config::{BASE_CLASS_ACCELERATOR, BASE_CLASS_DISPLAY};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Default collector wake period
pub const DEFAULT_COLLECTOR_PERIOD: Duration = Duration::from_millis(1000);

/// Manager construction options
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Collector wake period
    pub collector_period: Duration,
    /// AER snapshots kept per port
    pub aer_capacity: usize,
    /// AER log overflow policy
    pub aer_policy: OverflowPolicy,
    /// Capture AER snapshots when the drain finds an error
    pub aer_capture: bool,
    /// Never read hardware counter registers
    pub skip_hw_counters: bool,
    /// Log every drained error at info level
    pub verbose: bool,
    /// Bridge family id tables
    pub families: FamilyTable,
    /// Base class codes treated as leaf devices during discovery
    pub leaf_classes: Vec<u8>,
    /// sysfs mount point for the Linux platform
    pub sysfs_root: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            collector_period: DEFAULT_COLLECTOR_PERIOD,
            aer_capacity: DEFAULT_CAPACITY,
            aer_policy: OverflowPolicy::DeleteOldest,
            aer_capture: true,
            skip_hw_counters: false,
            verbose: false,
            families: FamilyTable::default(),
            leaf_classes: vec![BASE_CLASS_DISPLAY, BASE_CLASS_ACCELERATOR],
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

impl ManagerConfig {
    /// Defaults overlaid with `PEXFAB_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid from an arbitrary key lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(ms) = lookup("PEXFAB_COLLECTOR_MS") {
            cfg.collector_period = Duration::from_millis(parse_num("PEXFAB_COLLECTOR_MS", &ms)?);
        }
        if let Some(cap) = lookup("PEXFAB_AER_CAPACITY") {
            cfg.aer_capacity = usize::try_from(parse_num("PEXFAB_AER_CAPACITY", &cap)?)
                .map_err(|_| bad_value("PEXFAB_AER_CAPACITY", &cap))?;
        }
        if let Some(policy) = lookup("PEXFAB_AER_POLICY") {
            cfg.aer_policy = policy
                .parse()
                .map_err(|_| bad_value("PEXFAB_AER_POLICY", &policy))?;
        }
        if let Some(v) = lookup("PEXFAB_AER_CAPTURE") {
            cfg.aer_capture = parse_bool("PEXFAB_AER_CAPTURE", &v)?;
        }
        if let Some(v) = lookup("PEXFAB_SKIP_HW_COUNTERS") {
            cfg.skip_hw_counters = parse_bool("PEXFAB_SKIP_HW_COUNTERS", &v)?;
        }
        if let Some(v) = lookup("PEXFAB_VERBOSE") {
            cfg.verbose = parse_bool("PEXFAB_VERBOSE", &v)?;
        }
        if let Some(root) = lookup("PEXFAB_SYSFS_ROOT") {
            cfg.sysfs_root = PathBuf::from(root);
        }

        Ok(cfg)
    }
}

fn bad_value(key: &'static str, value: &str) -> PexError {
    PexError::invalid_value(key, value)
}

fn parse_num(key: &'static str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| bad_value(key, value))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(bad_value(key, value)),
    }
}

/// Runtime-adjustable settings shared with the collector
#[derive(Debug)]
pub struct Settings {
    collector_period_ms: AtomicU64,
    aer_capacity: AtomicUsize,
    aer_policy: AtomicU8,
    aer_capture: AtomicBool,
    skip_hw_counters: AtomicBool,
    verbose: AtomicBool,
}

impl Settings {
    /// Snapshot the runtime subset of `cfg`
    pub fn from_config(cfg: &ManagerConfig) -> Self {
        Self {
            collector_period_ms: AtomicU64::new(
                u64::try_from(cfg.collector_period.as_millis()).unwrap_or(u64::MAX),
            ),
            aer_capacity: AtomicUsize::new(cfg.aer_capacity),
            aer_policy: AtomicU8::new(cfg.aer_policy.to_raw()),
            aer_capture: AtomicBool::new(cfg.aer_capture),
            skip_hw_counters: AtomicBool::new(cfg.skip_hw_counters),
            verbose: AtomicBool::new(cfg.verbose),
        }
    }

    /// Collector wake period
    pub fn collector_period(&self) -> Duration {
        Duration::from_millis(self.collector_period_ms.load(Ordering::Relaxed))
    }

    /// Set the collector wake period
    pub fn set_collector_period(&self, period: Duration) {
        let ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        self.collector_period_ms.store(ms, Ordering::Relaxed);
    }

    /// AER snapshots kept per port
    pub fn aer_capacity(&self) -> usize {
        self.aer_capacity.load(Ordering::Relaxed)
    }

    /// Set the AER capacity
    pub fn set_aer_capacity(&self, capacity: usize) {
        self.aer_capacity.store(capacity, Ordering::Relaxed);
    }

    /// AER overflow policy
    pub fn aer_policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_raw(self.aer_policy.load(Ordering::Relaxed))
    }

    /// Set the AER overflow policy
    pub fn set_aer_policy(&self, policy: OverflowPolicy) {
        self.aer_policy.store(policy.to_raw(), Ordering::Relaxed);
    }

    /// AER capture enabled
    pub fn aer_capture(&self) -> bool {
        self.aer_capture.load(Ordering::Relaxed)
    }

    /// Enable or disable AER capture
    pub fn set_aer_capture(&self, enable: bool) {
        self.aer_capture.store(enable, Ordering::Relaxed);
    }

    /// Hardware counters are skipped
    pub fn skip_hw_counters(&self) -> bool {
        self.skip_hw_counters.load(Ordering::Relaxed)
    }

    /// Skip or use hardware counters
    pub fn set_skip_hw_counters(&self, skip: bool) {
        self.skip_hw_counters.store(skip, Ordering::Relaxed);
    }

    /// Verbose drain logging
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Set verbose drain logging
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}
