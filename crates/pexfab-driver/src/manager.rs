// SPDX-License-Identifier: AGPL-3.0-only

//! Fabric manager
//!
//! Owns discovery, the device arena, the collector and saved sessions.
//! Leaf-to-root queries route through here.
//!
//! ```no_run
//! use pexfab_driver::prelude::*;
//!
//! let manager = Manager::linux(ManagerConfig::from_env()?);
//! let topology = manager.find_devices()?;
//! manager.initialize_all()?;
//! println!("{topology}");
//!
//! let leaf = topology.leaves()[0].id();
//! let session = manager.save_setting(leaf, SaveMask::ALL)?;
//! // ... power transition ...
//! manager.restore_setting(session, SaveMask::ALL, RestoreOptions::default())?;
//! # Ok::<(), pexfab_driver::PexError>(())
//! ```

use crate::access::RegisterAccess;
use crate::address::PciAddress;
use crate::aer::{AerEntry, OverflowPolicy};
use crate::collector::{Collector, CollectorPause, DrainTarget};
use crate::counters::{ErrorCounters, ErrorSource};
use crate::device::{read_l1ss, read_port_aspm, write_port_aspm, BridgeDevice, PortSelect};
use crate::error::{PexError, Result, StickyError};
use crate::error_counts::{read_counts, reset_counts};
use crate::family::{Family, FamilyTable};
use crate::l1ss::{self, L1ssRequest};
use crate::link::{Aspm, L1ssState, LinkCapInfo};
use crate::platform::{ControlRequest, ControlResponse, Platform, SysfsPlatform};
use crate::port::Port;
use crate::registry::PortRegistry;
use crate::session::{HopSetting, RestoreOptions, SaveMask, Session, SessionId};
use crate::settings::{ManagerConfig, Settings};
use crate::topology::{DeviceId, LeafId, Topology, TopologyBuilder};
use pexfab_regs::express;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Error counts of the parent-side port of one hop
#[derive(Debug, Clone)]
pub struct HopCounts {
    /// Device owning the port
    pub device: DeviceId,
    /// Downstream port index
    pub port: usize,
    /// Counts read
    pub counts: ErrorCounters,
}

/// PCIe bridge fabric manager
#[derive(Debug)]
pub struct Manager {
    access: RegisterAccess,
    settings: Arc<Settings>,
    families: Arc<FamilyTable>,
    leaf_classes: Vec<u8>,
    extra_leaves: Mutex<Vec<PciAddress>>,
    build: Mutex<()>,
    topology: OnceLock<Topology>,
    collector: Collector,
    sessions: Mutex<BTreeMap<SessionId, Session>>,
    next_session: AtomicU32,
}

impl Manager {
    /// Manager over an arbitrary platform
    pub fn new(platform: Arc<dyn Platform>, config: ManagerConfig) -> Self {
        Self {
            access: RegisterAccess::new(platform),
            settings: Arc::new(Settings::from_config(&config)),
            families: Arc::new(config.families),
            leaf_classes: config.leaf_classes,
            extra_leaves: Mutex::new(Vec::new()),
            build: Mutex::new(()),
            topology: OnceLock::new(),
            collector: Collector::new(),
            sessions: Mutex::new(BTreeMap::new()),
            next_session: AtomicU32::new(1),
        }
    }

    /// Manager over Linux sysfs at `config.sysfs_root`
    pub fn linux(config: ManagerConfig) -> Self {
        let platform = Arc::new(SysfsPlatform::with_root(config.sysfs_root.clone()));
        Self::new(platform, config)
    }

    /// Register accessor
    pub const fn access(&self) -> &RegisterAccess {
        &self.access
    }

    /// Runtime settings shared with devices and the collector
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Settings ─────────────────────────────────────────────────────────

    /// Change the collector period; takes effect after the next wake
    pub fn set_collector_period(&self, period: Duration) {
        self.settings.set_collector_period(period);
        self.collector.wake();
    }

    /// Resize every port's AER log
    pub fn set_aer_capacity(&self, capacity: usize) {
        self.settings.set_aer_capacity(capacity);
        let Some(topo) = self.topology.get() else {
            return;
        };
        for port in all_ports(topo) {
            if let Ok(mut log) = port.lock_errors() {
                log.set_capacity(capacity);
            }
        }
    }

    /// AER log overflow policy
    pub fn set_aer_policy(&self, policy: OverflowPolicy) {
        self.settings.set_aer_policy(policy);
    }

    /// Capture AER snapshots during drains
    pub fn set_aer_capture(&self, enable: bool) {
        self.settings.set_aer_capture(enable);
    }

    /// Ignore hardware counter registers
    pub fn set_skip_hw_counters(&self, skip: bool) {
        self.settings.set_skip_hw_counters(skip);
    }

    /// Log every drained error at info level
    pub fn set_verbose(&self, verbose: bool) {
        self.settings.set_verbose(verbose);
    }

    /// Add a family id at runtime, before discovery
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once devices have been discovered.
    pub fn add_family_id(&mut self, family: Family, id: crate::address::PciId) -> Result<()> {
        if self.topology.get().is_some() {
            return Err(PexError::invalid_state("family tables are fixed after discovery"));
        }
        Arc::make_mut(&mut self.families).add(family, id);
        Ok(())
    }

    // ── Discovery and lifecycle ─────────────────────────────────────────

    /// Add a leaf that class-code discovery would not find
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once devices have been discovered.
    pub fn register_leaf(&self, addr: PciAddress) -> Result<()> {
        if self.topology.get().is_some() {
            return Err(PexError::invalid_state(format!(
                "{addr}: leaves must be registered before find_devices()"
            )));
        }
        let mut leaves = self
            .extra_leaves
            .lock()
            .map_err(|_| PexError::invalid_state("leaf list poisoned"))?;
        if !leaves.contains(&addr) {
            leaves.push(addr);
        }
        Ok(())
    }

    /// Discover the fabric; later calls return the same topology
    ///
    /// # Errors
    ///
    /// Returns error if enumeration fails or bus ranges are inconsistent.
    pub fn find_devices(&self) -> Result<&Topology> {
        if let Some(topo) = self.topology.get() {
            return Ok(topo);
        }
        let _build = self
            .build
            .lock()
            .map_err(|_| PexError::invalid_state("discovery lock poisoned"))?;
        if let Some(topo) = self.topology.get() {
            return Ok(topo);
        }

        let platform = self.access.platform();
        let mut registry = PortRegistry::scan(platform.as_ref(), &self.families, &self.leaf_classes)?;
        if let Ok(extra) = self.extra_leaves.lock() {
            for addr in extra.iter() {
                registry.add_leaf(*addr);
            }
        }

        let topo = TopologyBuilder::new(
            &registry,
            self.access.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.families),
        )
        .build()?;
        Ok(self.topology.get_or_init(|| topo))
    }

    /// The discovered topology
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before [`Manager::find_devices`].
    pub fn topology(&self) -> Result<&Topology> {
        self.topology
            .get()
            .ok_or_else(|| PexError::invalid_state("find_devices() has not run"))
    }

    /// Device by id
    ///
    /// # Errors
    ///
    /// Returns error before discovery or for an unknown id.
    pub fn device(&self, id: DeviceId) -> Result<&BridgeDevice> {
        self.topology()?.device(id)
    }

    /// Initialize every device and start the collector
    ///
    /// Every device is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first device initialization or collector start error.
    pub fn initialize_all(&self) -> Result<()> {
        let topo = self.find_devices()?;
        let mut sticky = StickyError::new();
        for dev in topo.devices() {
            sticky.record("initialize", dev.initialize());
        }

        let mut targets = Vec::new();
        for dev in topo.devices() {
            for port in dev.ports() {
                targets.push(DrainTarget {
                    port: Arc::clone(port),
                    family: dev.family(),
                });
            }
        }
        for leaf in topo.leaves() {
            targets.push(DrainTarget {
                port: Arc::clone(leaf.port()),
                family: Family::Generic,
            });
        }
        sticky.record(
            "start collector",
            self.collector
                .start(targets, self.access.clone(), Arc::clone(&self.settings)),
        );
        sticky.finish()
    }

    /// Stop the collector and shut every device down
    ///
    /// # Errors
    ///
    /// Returns the first failure; every step is still attempted.
    pub fn shutdown_all(&self) -> Result<()> {
        let mut sticky = StickyError::new();
        sticky.record("stop collector", self.collector.stop());
        if let Some(topo) = self.topology.get() {
            for dev in topo.devices() {
                sticky.record("shutdown", dev.shutdown());
            }
        }
        sticky.finish()
    }

    /// Suspend collector passes while the lease is held
    pub fn pause_collector(&self) -> CollectorPause {
        self.collector.pause()
    }

    /// Run a collector pass now
    pub fn wake_collector(&self) {
        self.collector.wake();
    }

    /// The collector
    pub const fn collector(&self) -> &Collector {
        &self.collector
    }

    // ── Chain queries ────────────────────────────────────────────────────

    /// Leaf at `addr`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `addr` is not a discovered leaf.
    pub fn leaf_id(&self, addr: PciAddress) -> Result<LeafId> {
        self.topology()?
            .leaf_by_addr(addr)
            .map(|l| l.id())
            .ok_or_else(|| PexError::not_found(format!("{addr}: not a known leaf")))
    }

    /// Devices from a leaf up to its root, nearest first
    ///
    /// # Errors
    ///
    /// Returns error before discovery or for an unknown leaf.
    pub fn chain(&self, leaf: LeafId) -> Result<Vec<DeviceId>> {
        self.topology()?.chain(leaf)
    }

    /// Chain governing `domain:bus:device`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no device governs the bus.
    pub fn find_device(&self, domain: u16, bus: u8, device: u8) -> Result<Vec<DeviceId>> {
        self.find_devices()?.find_device(domain, bus, device)
    }

    /// `(device, downstream port)` of every hop from a leaf to the root
    fn hops(topo: &Topology, leaf: LeafId) -> Result<Vec<(DeviceId, usize)>> {
        let mut out = Vec::new();
        let mut cur = topo.leaf(leaf)?.parent();
        while let Some((dev, index)) = cur {
            out.push((dev, index));
            if out.len() > topo.devices().len() {
                return Err(PexError::topology(format!("parent cycle above {leaf}")));
            }
            cur = topo.device(dev)?.parent();
        }
        Ok(out)
    }

    // ── Error counters ───────────────────────────────────────────────────

    /// Error counts of one port
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port or a failed read.
    pub fn port_error_counts(&self, device: DeviceId, select: PortSelect, source: ErrorSource) -> Result<ErrorCounters> {
        let dev = self.device(device)?;
        read_counts(&self.access, dev.port(select)?, dev.family(), &self.settings, source)
    }

    /// Error counts of a leaf's own function
    ///
    /// # Errors
    ///
    /// Returns error for an unknown leaf or a failed read.
    pub fn leaf_error_counts(&self, leaf: LeafId, source: ErrorSource) -> Result<ErrorCounters> {
        let leaf = self.topology()?.leaf(leaf)?;
        read_counts(&self.access, leaf.port(), Family::Generic, &self.settings, source)
    }

    /// Error counts of the parent-side port at every hop above a leaf
    ///
    /// # Errors
    ///
    /// Returns the first failed read.
    pub fn chain_error_counts(&self, leaf: LeafId, source: ErrorSource) -> Result<Vec<HopCounts>> {
        let topo = self.topology()?;
        Self::hops(topo, leaf)?
            .into_iter()
            .map(|(device, port)| {
                let counts = self.port_error_counts(device, PortSelect::Downstream(port), source)?;
                Ok(HopCounts { device, port, counts })
            })
            .collect()
    }

    /// Discard pending counts on every port of a device
    ///
    /// # Errors
    ///
    /// Returns the first failure; every port is still attempted.
    pub fn reset_error_counts(&self, device: DeviceId) -> Result<()> {
        let dev = self.device(device)?;
        let mut sticky = StickyError::new();
        for port in dev.ports() {
            sticky.record("reset counts", reset_counts(&self.access, port, dev.family(), &self.settings));
        }
        sticky.finish()
    }

    /// AER snapshots of a port, oldest first
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port.
    pub fn aer_log(&self, device: DeviceId, select: PortSelect) -> Result<Vec<AerEntry>> {
        let dev = self.device(device)?;
        Ok(dev.port(select)?.lock_errors()?.snapshot())
    }

    /// Empty a port's AER log
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port.
    pub fn clear_aer_log(&self, device: DeviceId, select: PortSelect) -> Result<()> {
        let dev = self.device(device)?;
        dev.port(select)?.lock_errors()?.clear();
        Ok(())
    }

    // ── Link power ───────────────────────────────────────────────────────

    /// Set ASPM on both ends of the link below a downstream port
    ///
    /// The state is clamped to both ends' Link Capabilities unless forced.
    /// L1 is enabled on the parent side first and disabled on it last.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port or a failed access.
    pub fn set_link_aspm(&self, device: DeviceId, index: usize, state: Aspm, force: bool) -> Result<Aspm> {
        let topo = self.topology()?;
        let dev = topo.device(device)?;
        let (_, child) = topo.link(device, index)?;

        let mut effective = if force { state } else { state.intersect(dev.aspm_capability()?) };
        if let (Some(c), false) = (child, force) {
            effective = effective.intersect(self.child_aspm_support(c)?);
        }
        self.apply_link_aspm(dev, index, child, effective, effective, force)?;
        Ok(effective)
    }

    /// ASPM enables of both ends of the link below a downstream port
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port or a failed read.
    pub fn link_aspm(&self, device: DeviceId, index: usize) -> Result<(Aspm, Option<Aspm>)> {
        let (parent, child) = self.topology()?.link(device, index)?;
        let parent_state = read_port_aspm(&self.access, parent)?;
        let child_state = child
            .filter(|c| c.caps().has_express())
            .map(|c| read_port_aspm(&self.access, c))
            .transpose()?;
        Ok((parent_state, child_state))
    }

    fn child_aspm_support(&self, child: &Port) -> Result<Aspm> {
        if !child.caps().has_express() {
            return Ok(Aspm::Disabled);
        }
        let raw = self.access.read(child, child.caps().express_reg(express::LINK_CAP))?;
        Ok(LinkCapInfo::decode(raw).aspm)
    }

    fn apply_link_aspm(
        &self,
        dev: &BridgeDevice,
        index: usize,
        child: Option<&Arc<Port>>,
        parent_state: Aspm,
        child_state: Aspm,
        force: bool,
    ) -> Result<()> {
        let child = child.filter(|c| c.caps().has_express());
        if parent_state.l1() {
            dev.set_downstream_aspm(index, parent_state, force)?;
            if let Some(c) = child {
                write_port_aspm(&self.access, c, child_state)?;
            }
        } else {
            if let Some(c) = child {
                write_port_aspm(&self.access, c, child_state)?;
            }
            dev.set_downstream_aspm(index, parent_state, force)?;
        }
        Ok(())
    }

    /// L1SS enables of both ends of the link below a downstream port
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` if an end lacks L1 PM substates.
    pub fn link_l1ss(&self, device: DeviceId, index: usize) -> Result<(L1ssState, Option<L1ssState>)> {
        let (parent, child) = self.topology()?.link(device, index)?;
        let parent_state = read_l1ss(&self.access, parent)?;
        let child_state = child.map(|c| read_l1ss(&self.access, c)).transpose()?;
        Ok((parent_state, child_state))
    }

    /// Change L1 substates on the link below a downstream port
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is connected, plus any sequencer error.
    pub fn set_link_l1ss(&self, device: DeviceId, index: usize, request: L1ssRequest) -> Result<L1ssState> {
        let topo = self.topology()?;
        let (parent, child) = topo.link(device, index)?;
        let child = child.ok_or_else(|| {
            PexError::not_found(format!("{}: nothing connected below", parent.addr()))
        })?;
        let state = l1ss::apply(&self.access, parent, child, request)?;
        topo.device(device)?.note_l1ss_change();
        Ok(state)
    }

    // ── Save / restore ───────────────────────────────────────────────────

    /// Capture `what` at every hop from `leaf` up to, but excluding, its root
    ///
    /// The walk stops at the root device; the links below root ports are
    /// not saved. Hops without a PCI Express parent port are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first failed read; nothing is stored then.
    pub fn save_setting(&self, leaf: LeafId, what: SaveMask) -> Result<SessionId> {
        let topo = self.topology()?;
        let mut hops = Vec::new();
        for (device, index) in Self::hops(topo, leaf)? {
            if topo.device(device)?.is_root() {
                break;
            }
            if let Some(hop) = self.capture_hop(topo, device, index, what)? {
                hops.push(hop);
            }
        }

        let id = SessionId(self.next_session.fetch_add(1, Ordering::AcqRel));
        tracing::info!("Saved {} hops for {leaf} as {id}", hops.len());
        self.sessions
            .lock()
            .map_err(|_| PexError::invalid_state("session table poisoned"))?
            .insert(id, Session { mask: what, hops });
        Ok(id)
    }

    fn capture_hop(&self, topo: &Topology, device: DeviceId, index: usize, what: SaveMask) -> Result<Option<HopSetting>> {
        let dev = topo.device(device)?;
        let (parent, child) = topo.link(device, index)?;
        if !parent.caps().has_express() {
            tracing::debug!("{}: no PCI Express capability, hop skipped", parent.addr());
            return Ok(None);
        }

        let mut hop = HopSetting {
            device,
            port: index,
            depth: dev
                .depth()
                .ok_or_else(|| PexError::topology(format!("device {device} has no depth")))?,
            ..HopSetting::default()
        };
        let select = PortSelect::Downstream(index);

        if what.contains(SaveMask::SPEED) {
            hop.speed = dev.link_status(select)?.speed;
        }
        if what.contains(SaveMask::WIDTH) {
            hop.width = Some(dev.width(select)?);
        }
        if what.contains(SaveMask::ASPM) {
            hop.parent_aspm = Some(dev.downstream_aspm(index)?);
            hop.child_aspm = child
                .filter(|c| c.caps().has_express())
                .map(|c| read_port_aspm(&self.access, c))
                .transpose()?;
        }
        if what.contains(SaveMask::L1SS) {
            if let Some(c) = child.filter(|c| c.caps().has_l1ss() && parent.caps().has_l1ss()) {
                hop.parent_l1ss = Some(read_l1ss(&self.access, parent)?);
                hop.child_l1ss = Some(read_l1ss(&self.access, c)?);
            }
        }
        if what.contains(SaveMask::DPC) && parent.caps().has_dpc() {
            hop.dpc = Some(dev.dpc_mode(index)?);
        }
        Ok(Some(hop))
    }

    /// Saved session contents
    ///
    /// # Errors
    ///
    /// Returns `NoSession` for an unknown id.
    pub fn session(&self, id: SessionId) -> Result<Session> {
        self.sessions
            .lock()
            .map_err(|_| PexError::invalid_state("session table poisoned"))?
            .get(&id)
            .cloned()
            .ok_or(PexError::NoSession { id: id.0 })
    }

    /// Forget a saved session
    ///
    /// # Errors
    ///
    /// Returns `NoSession` for an unknown id.
    pub fn discard_setting(&self, id: SessionId) -> Result<()> {
        self.sessions
            .lock()
            .map_err(|_| PexError::invalid_state("session table poisoned"))?
            .remove(&id)
            .map(|_| ())
            .ok_or(PexError::NoSession { id: id.0 })
    }

    /// Replay `what` from a saved session, leaf side first
    ///
    /// Every hop and parameter is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns `NoSession` for an unknown id, otherwise the first failure.
    pub fn restore_setting(&self, id: SessionId, what: SaveMask, options: RestoreOptions) -> Result<()> {
        let session = self.session(id)?;
        let topo = self.topology()?;
        let chipset = match session.hops.last() {
            Some(top) => self.chipset_aspm(topo, top.device),
            None => Aspm::L0sL1,
        };

        let mut sticky = StickyError::new();
        for hop in &session.hops {
            self.restore_hop(topo, hop, what, options, chipset, &mut sticky);
        }
        if sticky.failures() > 0 {
            tracing::error!("{id}: {} restore steps failed", sticky.failures());
        }
        sticky.finish()
    }

    /// ASPM states the chipset reports for the root above `device`
    fn chipset_aspm(&self, topo: &Topology, device: DeviceId) -> Aspm {
        let root = topo
            .ancestors(device)
            .ok()
            .and_then(|chain| chain.last().copied())
            .and_then(|r| topo.device(r).ok())
            .and_then(|r| r.downstream_ports().first().map(|p| p.addr()));
        let Some(addr) = root else {
            return Aspm::L0sL1;
        };
        match self.access.platform().control(ControlRequest::ChipsetAspm { addr }) {
            Ok(ControlResponse::Aspm(mask)) => mask,
            Ok(other) => {
                tracing::debug!("{addr}: chipset ASPM query returned {other:?}");
                Aspm::L0sL1
            }
            Err(e) => {
                tracing::debug!("{addr}: chipset ASPM unavailable ({e}), using device capability");
                Aspm::L0sL1
            }
        }
    }

    fn restore_hop(
        &self,
        topo: &Topology,
        hop: &HopSetting,
        what: SaveMask,
        options: RestoreOptions,
        chipset: Aspm,
        sticky: &mut StickyError,
    ) {
        let Some(dev) = sticky.record("restore lookup", topo.device(hop.device)) else {
            return;
        };
        let Some((parent, child)) = sticky.record("restore lookup", topo.link(hop.device, hop.port)) else {
            return;
        };
        let index = hop.port;

        if let (true, Some(saved)) = (what.contains(SaveMask::SPEED), hop.speed) {
            match options.perf {
                Some(perf) if !perf.speed_change_allowed => {
                    tracing::debug!("{}: speed change not allowed in current state", parent.addr());
                }
                perf => {
                    let target = perf.map_or(saved, |p| saved.min(p.max_speed));
                    sticky.record("restore speed", restore_speed(dev, index, target));
                }
            }
        }

        if let (true, Some(saved)) = (what.contains(SaveMask::WIDTH), hop.width) {
            if let Some(now) = sticky.record("read width", dev.width(PortSelect::Downstream(index))) {
                if now != saved {
                    tracing::warn!("{}: link width x{now}, was x{saved}; width is not restorable", parent.addr());
                }
            }
        }

        if let (true, Some(saved)) = (what.contains(SaveMask::ASPM), hop.parent_aspm) {
            let (parent_state, child_state) = if options.force {
                (saved, hop.child_aspm.unwrap_or(saved))
            } else {
                (saved.intersect(chipset), hop.child_aspm.unwrap_or(saved).intersect(chipset))
            };
            sticky.record(
                "restore aspm",
                self.apply_link_aspm(dev, index, child, parent_state, child_state, options.force),
            );
        }

        if what.contains(SaveMask::L1SS) {
            if let (Some(saved), Some(c)) = (hop.child_l1ss, child) {
                let result = l1ss::apply(&self.access, parent, c, L1ssRequest::exact(saved));
                if sticky.record("restore l1ss", result).is_some() {
                    dev.note_l1ss_change();
                }
            }
        }

        if let (true, Some(mode)) = (what.contains(SaveMask::DPC), hop.dpc) {
            sticky.record("restore dpc", dev.set_dpc_mode(index, mode));
        }
    }
}

fn restore_speed(dev: &BridgeDevice, index: usize, target: crate::link::LinkSpeed) -> Result<()> {
    let now = dev.link_status(PortSelect::Downstream(index))?.speed;
    if now == Some(target) {
        return Ok(());
    }
    let target = target.min(dev.max_speed(index)?);
    dev.set_downstream_speed(index, target)
}

fn all_ports(topo: &Topology) -> impl Iterator<Item = &Arc<Port>> {
    topo.devices()
        .iter()
        .flat_map(|d| d.ports())
        .chain(topo.leaves().iter().map(|l| l.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PciId;
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::port_type;

    const RP: PciAddress = PciAddress::new(0, 0, 1, 0);
    const GPU: PciAddress = PciAddress::new(0, 1, 0, 0);

    fn single_link() -> (Arc<SimPlatform>, Manager) {
        let sim = Arc::new(
            SimPlatform::new()
                .with(
                    SimFunction::bridge(RP, PciId::new(0x1022, 0x1483), port_type::ROOT_PORT, 0, 1, 1)
                        .with_link_cap(3, 16, 0b11, 1)
                        .with_link_status(3, 16),
                )
                .with(SimFunction::endpoint(GPU, PciId::new(0x10DE, 0x2204), 0x03_0000).with_link_cap(3, 16, 0b11, 0)),
        );
        let manager = Manager::new(sim.clone(), ManagerConfig::default());
        (sim, manager)
    }

    #[test]
    fn find_devices_runs_once() {
        let (_sim, m) = single_link();
        let first: *const Topology = m.find_devices().unwrap();
        let second: *const Topology = m.find_devices().unwrap();
        assert_eq!(first, second);
        assert!(m.register_leaf(PciAddress::new(0, 5, 0, 0)).is_err());
    }

    #[test]
    fn topology_before_discovery_is_invalid_state() {
        let (_sim, m) = single_link();
        assert!(matches!(m.topology(), Err(PexError::InvalidState { .. })));
    }

    #[test]
    fn link_aspm_enables_parent_first() {
        let (sim, m) = single_link();
        m.find_devices().unwrap();
        let root = m.topology().unwrap().roots()[0];
        sim.clear_writes();
        assert_eq!(m.set_link_aspm(root, 0, Aspm::L1, false).unwrap(), Aspm::L1);
        let order: Vec<PciAddress> = sim.writes().iter().map(|w| w.addr).collect();
        assert_eq!(order, vec![RP, GPU]);

        sim.clear_writes();
        m.set_link_aspm(root, 0, Aspm::Disabled, false).unwrap();
        let order: Vec<PciAddress> = sim.writes().iter().map(|w| w.addr).collect();
        assert_eq!(order, vec![GPU, RP]);
    }

    #[test]
    fn missing_session() {
        let (_sim, m) = single_link();
        m.find_devices().unwrap();
        assert!(matches!(
            m.restore_setting(SessionId(99), SaveMask::ALL, RestoreOptions::default()),
            Err(PexError::NoSession { id: 99 })
        ));
        assert!(matches!(m.discard_setting(SessionId(99)), Err(PexError::NoSession { .. })));
    }

    #[test]
    fn registered_leaf_is_discovered() {
        let (sim, m) = single_link();
        let nic = PciAddress::new(0, 1, 0, 1);
        sim.add(SimFunction::endpoint(nic, PciId::new(0x15B3, 0x1017), 0x02_0000));
        m.register_leaf(nic).unwrap();
        m.find_devices().unwrap();
        let leaf = m.leaf_id(nic).unwrap();
        assert_eq!(m.chain(leaf).unwrap().len(), 1);
    }
}
