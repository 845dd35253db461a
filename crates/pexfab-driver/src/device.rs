// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge devices
//!
//! A [`BridgeDevice`] groups the ports of one physical bridge or switch:
//! one upstream port (none for the root) and its sibling downstream ports.
//! The family decides which MMIO window `initialize()` maps and how the
//! probed ASPM capability is adjusted.
//!
//! # State
//!
//! ```text
//! Unknown ──initialize()──► CapabilitiesProbed ──first ASPM/L1SS change──► Live
//! ```

use crate::access::{MmioWindow, RegisterAccess};
use crate::address::PciId;
use crate::error::{PexError, Result, StickyError};
use crate::family::{Family, FamilyTable, WindowSource};
use crate::hwcounter::HwCounterHelper;
use crate::link::{Aspm, DpcMask, DpcMode, L1ssState, LinkCapInfo, LinkSpeed, LinkStatus};
use crate::platform::{ControlRequest, ControlResponse};
use crate::port::Port;
use crate::settings::Settings;
use crate::topology::{DeviceId, LeafId};
use pexfab_regs::{config, dpc, express, l1ss, with_field};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Secondary bus reset assertion time
pub const BUS_RESET_HOLD: Duration = Duration::from_millis(1);
/// Wait after deasserting secondary bus reset before touching the link
pub const BUS_RESET_SETTLE: Duration = Duration::from_millis(100);
/// Link training poll timeout
pub const LINK_TRAINING_TIMEOUT: Duration = Duration::from_millis(200);
/// Hot-plug command completed poll timeout
pub const COMMAND_COMPLETED_TIMEOUT: Duration = Duration::from_millis(1000);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle of a device's ASPM/L1SS model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Not initialized
    Unknown,
    /// `initialize()` ran and capabilities are cached
    CapabilitiesProbed,
    /// Link power state has been changed by this process
    Live,
}

impl DeviceState {
    const fn to_raw(self) -> u8 {
        self as u8
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::CapabilitiesProbed,
            2 => Self::Live,
            _ => Self::Unknown,
        }
    }
}

/// Which port of a device an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSelect {
    /// The upstream port
    Upstream,
    /// Downstream port by index
    Downstream(usize),
}

/// What hangs below one downstream port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Child {
    /// Another bridge device
    Device(DeviceId),
    /// A leaf device
    Leaf(LeafId),
}

/// Capabilities read once from downstream port 0 plus per-port link caps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedCaps {
    /// ASPM states allowed after family overrides
    pub aspm: Aspm,
    /// L1 PM substates supported
    pub substates: bool,
    /// Substate enables the port supports
    pub l1ss: L1ssState,
    /// DPC modes supported
    pub dpc: DpcMask,
    /// Link capabilities of each downstream port
    pub links: Vec<LinkCapInfo>,
}

impl ProbedCaps {
    /// ASPM L1.1 allowed
    pub const fn l1_1(&self) -> bool {
        self.l1ss.contains(L1ssState::ASPM_L1_1)
    }

    /// ASPM L1.2 allowed
    pub const fn l1_2(&self) -> bool {
        self.l1ss.contains(L1ssState::ASPM_L1_2)
    }
}

#[derive(Debug, Default)]
struct InitState {
    initialized: bool,
    helper: Option<Arc<HwCounterHelper>>,
}

/// One bridge or switch in the fabric
#[derive(Debug)]
pub struct BridgeDevice {
    id: DeviceId,
    family: Family,
    upstream: Option<Arc<Port>>,
    downstream: Vec<Arc<Port>>,
    pub(crate) parent: Option<(DeviceId, usize)>,
    pub(crate) children: Vec<Option<Child>>,
    depth: OnceLock<u32>,
    access: RegisterAccess,
    settings: Arc<Settings>,
    families: Arc<FamilyTable>,
    probe: OnceLock<ProbedCaps>,
    init: Mutex<InitState>,
    state: AtomicU8,
}

impl BridgeDevice {
    /// Build a device from its ports; the family comes from the upstream id
    pub fn new(
        id: DeviceId,
        upstream: Option<Arc<Port>>,
        downstream: Vec<Arc<Port>>,
        access: RegisterAccess,
        settings: Arc<Settings>,
        families: Arc<FamilyTable>,
    ) -> Self {
        let family = families.classify(upstream.as_ref().map(|p| p.id()));
        let children = vec![None; downstream.len()];
        Self {
            id,
            family,
            upstream,
            downstream,
            parent: None,
            children,
            depth: OnceLock::new(),
            access,
            settings,
            families,
            probe: OnceLock::new(),
            init: Mutex::new(InitState::default()),
            state: AtomicU8::new(DeviceState::Unknown.to_raw()),
        }
    }

    /// Arena index
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    /// Hardware family
    pub const fn family(&self) -> Family {
        self.family
    }

    /// Root device (no upstream port)
    pub const fn is_root(&self) -> bool {
        self.upstream.is_none()
    }

    /// Upstream port
    pub const fn upstream(&self) -> Option<&Arc<Port>> {
        self.upstream.as_ref()
    }

    /// Downstream ports
    pub fn downstream_ports(&self) -> &[Arc<Port>] {
        &self.downstream
    }

    /// Downstream port by index
    ///
    /// # Errors
    ///
    /// Returns `InvalidPort` if `index` is out of range.
    pub fn downstream(&self, index: usize) -> Result<&Arc<Port>> {
        self.downstream.get(index).ok_or(PexError::InvalidPort {
            index,
            count: self.downstream.len(),
        })
    }

    /// Port addressed by `select`
    ///
    /// # Errors
    ///
    /// Returns `InvalidPort` for a bad index and `Unsupported` for the
    /// upstream port of a root device.
    pub fn port(&self, select: PortSelect) -> Result<&Arc<Port>> {
        match select {
            PortSelect::Downstream(i) => self.downstream(i),
            PortSelect::Upstream => self
                .upstream
                .as_ref()
                .ok_or_else(|| PexError::unsupported("root device has no upstream port")),
        }
    }

    /// Parent device and the index of its downstream port leading here
    pub const fn parent(&self) -> Option<(DeviceId, usize)> {
        self.parent
    }

    /// What hangs below downstream port `index`
    pub fn child(&self, index: usize) -> Option<Child> {
        self.children.get(index).copied().flatten()
    }

    /// Index of this device in its parent's downstream port list
    pub fn parent_port_index(&self) -> Option<usize> {
        self.parent.map(|(_, i)| i)
    }

    /// Distance from the root (root = 0)
    pub fn depth(&self) -> Option<u32> {
        self.depth.get().copied()
    }

    /// Set the depth; a second call must agree with the first
    ///
    /// # Errors
    ///
    /// Returns `Topology` if a different depth was already assigned.
    pub(crate) fn assign_depth(&self, depth: u32) -> Result<()> {
        let current = *self.depth.get_or_init(|| depth);
        if current == depth {
            Ok(())
        } else {
            Err(PexError::topology(format!(
                "device {} already at depth {current}, not {depth}",
                self.id.0
            )))
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> DeviceState {
        DeviceState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DeviceState) {
        self.state.store(state.to_raw(), Ordering::Release);
    }

    fn mark_live(&self) {
        if self.state() == DeviceState::CapabilitiesProbed {
            self.set_state(DeviceState::Live);
        }
    }

    /// Every port of the device, upstream first
    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.upstream.iter().chain(self.downstream.iter())
    }

    /// Register accessor shared by the device
    pub const fn access(&self) -> &RegisterAccess {
        &self.access
    }

    /// Id used for quirk lookups: upstream id, or downstream port 0 for roots
    fn quirk_id(&self) -> PciId {
        self.upstream
            .as_ref()
            .or_else(|| self.downstream.first())
            .map_or_else(PciId::default, |p| p.id())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Map the family's MMIO window and probe capabilities
    ///
    /// A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if mapping or the capability probe fails; the device
    /// stays uninitialized.
    pub fn initialize(&self) -> Result<()> {
        let mut init = self
            .init
            .lock()
            .map_err(|_| PexError::invalid_state("device init state poisoned"))?;
        if init.initialized {
            return Ok(());
        }

        match self.family.window_source() {
            WindowSource::None => {}
            WindowSource::UpstreamBar0 { .. } if self.settings.skip_hw_counters() => {
                tracing::debug!("device {}: hardware counters skipped, BAR0 not mapped", self.id.0);
            }
            WindowSource::UpstreamBar0 { size } => {
                let up = self.port(PortSelect::Upstream)?;
                let region = self.access.platform().map_bar(up.addr(), 0)?;
                if region.size() < size {
                    tracing::debug!(
                        "{}: BAR0 is {:#x} bytes, counters expect {size:#x}",
                        up.addr(),
                        region.size()
                    );
                }
                if let Some(layout) = self.family.counter_layout() {
                    let helper = Arc::new(HwCounterHelper::new(region, layout));
                    for port in self.ports() {
                        port.set_hw_counters(Some(Arc::clone(&helper)));
                    }
                    init.helper = Some(helper);
                }
            }
            WindowSource::ControlBar0 { size, stride } => {
                let up = self.port(PortSelect::Upstream)?;
                let base = match self
                    .access
                    .platform()
                    .control(ControlRequest::Bar0Address { addr: up.addr() })?
                {
                    ControlResponse::Address(a) => a,
                    other => {
                        return Err(PexError::unsupported(format!(
                            "{}: BAR0 lookup returned {other:?}",
                            up.addr()
                        )))
                    }
                };
                let region = self.access.platform().map_physical(base, size)?;
                for (slot, port) in self.ports().enumerate() {
                    if (slot + 1) * stride <= region.size() {
                        port.set_window(Some(MmioWindow::new(Arc::clone(&region), slot * stride)));
                    }
                }
            }
        }

        self.probe()?;
        init.initialized = true;
        self.set_state(DeviceState::CapabilitiesProbed);
        tracing::info!(
            "Initialized {} device {} ({} downstream ports)",
            self.family,
            self.id.0,
            self.downstream.len()
        );
        Ok(())
    }

    /// `initialize()` has completed
    pub fn is_initialized(&self) -> bool {
        self.init.lock().map(|i| i.initialized).unwrap_or(false)
    }

    /// Detach counter helpers and MMIO windows
    ///
    /// # Errors
    ///
    /// Returns the first error; every port is still released.
    pub fn shutdown(&self) -> Result<()> {
        let mut sticky = StickyError::new();
        let init = self
            .init
            .lock()
            .map_err(|_| PexError::invalid_state("device init state poisoned"));
        if let Some(mut init) = sticky.record("shutdown lock", init) {
            for port in self.ports() {
                port.set_hw_counters(None);
                port.set_window(None);
            }
            init.helper = None;
            init.initialized = false;
        }
        tracing::debug!("Shut down device {}", self.id.0);
        sticky.finish()
    }

    // ── Capabilities ─────────────────────────────────────────────────────

    /// Capabilities, probed on first use
    ///
    /// Reads downstream port 0 only; siblings are assumed identical.
    ///
    /// # Errors
    ///
    /// Returns error if a capability read fails. Nothing is cached then.
    pub fn probe(&self) -> Result<&ProbedCaps> {
        if let Some(caps) = self.probe.get() {
            return Ok(caps);
        }
        let caps = self.read_caps()?;
        Ok(self.probe.get_or_init(|| caps))
    }

    fn read_caps(&self) -> Result<ProbedCaps> {
        let port0 = self.downstream(0)?;
        let pc = port0.caps();

        let mut links = Vec::with_capacity(self.downstream.len());
        for port in &self.downstream {
            let info = if port.caps().has_express() {
                let raw = self.access.read(port, port.caps().express_reg(express::LINK_CAP))?;
                LinkCapInfo::decode(raw)
            } else {
                LinkCapInfo::default()
            };
            links.push(info);
        }

        let base = links.first().map_or(Aspm::Disabled, |l| l.aspm);
        let ov = self.family.aspm_override(self.quirk_id(), &self.families);
        let aspm = Aspm::from_flags(ov.l0s.unwrap_or(base.l0s()), ov.l1.unwrap_or(base.l1()));

        let (substates, l1ss_caps) = if pc.has_l1ss() {
            let raw = self.access.read(port0, pc.l1ss + l1ss::CAPS)?;
            (raw & l1ss::CAP_SUBSTATES != 0, L1ssState::from_bits(raw))
        } else {
            (false, L1ssState::NONE)
        };

        let dpc = if pc.has_dpc() { DpcMask::ALL } else { DpcMask::NONE };

        tracing::debug!(
            "device {} ({}): aspm={aspm} substates={substates} l1ss={l1ss_caps} dpc={}",
            self.id.0,
            self.family,
            dpc.is_supported()
        );

        Ok(ProbedCaps {
            aspm,
            substates,
            l1ss: if substates { l1ss_caps } else { L1ssState::NONE },
            dpc,
            links,
        })
    }

    // ── Link speed and width ─────────────────────────────────────────────

    fn link_ctl_sta(&self, port: &Port) -> Result<u32> {
        let caps = port.caps();
        if !caps.has_express() {
            return Err(PexError::missing_capability(port.addr(), "PCI Express"));
        }
        self.access.read(port, caps.express_reg(express::LINK_CTL_STA))
    }

    /// Link capabilities of a downstream port
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or failed probe.
    pub fn link_caps(&self, index: usize) -> Result<LinkCapInfo> {
        self.downstream(index)?;
        Ok(self.probe()?.links.get(index).copied().unwrap_or_default())
    }

    /// Maximum speed of a downstream port
    ///
    /// # Errors
    ///
    /// Returns error on a bad index, failed probe or reserved encoding.
    pub fn max_speed(&self, index: usize) -> Result<LinkSpeed> {
        let port = self.downstream(index)?;
        self.link_caps(index)?
            .max_speed
            .ok_or_else(|| PexError::unsupported(format!("{}: max link speed not encoded", port.addr())))
    }

    /// Maximum width of a downstream port
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or failed probe.
    pub fn max_width(&self, index: usize) -> Result<u8> {
        Ok(self.link_caps(index)?.max_width)
    }

    /// Current link status of a port
    ///
    /// # Errors
    ///
    /// Returns error if the port has no PCI Express capability.
    pub fn link_status(&self, select: PortSelect) -> Result<LinkStatus> {
        let port = self.port(select)?;
        Ok(LinkStatus::decode(self.link_ctl_sta(port)?))
    }

    /// Current speed of a downstream link
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or unreadable status.
    pub fn downstream_speed(&self, index: usize) -> Result<LinkSpeed> {
        let port = self.downstream(index)?;
        self.link_status(PortSelect::Downstream(index))?
            .speed
            .ok_or_else(|| PexError::unsupported(format!("{}: link down", port.addr())))
    }

    /// Negotiated width of a link
    ///
    /// # Errors
    ///
    /// Returns error on a bad selection or unreadable status.
    pub fn width(&self, select: PortSelect) -> Result<u8> {
        Ok(self.link_status(select)?.width)
    }

    /// Change a downstream link's target speed and retrain
    ///
    /// # Errors
    ///
    /// Returns `CapabilityMismatch` above the port's maximum, before any
    /// register is written.
    pub fn set_downstream_speed(&self, index: usize, speed: LinkSpeed) -> Result<()> {
        let max = self.max_speed(index)?;
        if speed > max {
            return Err(PexError::capability_mismatch(format!(
                "{speed} exceeds port maximum {max}"
            )));
        }
        let port = self.downstream(index)?;
        let reg = port.caps().express_reg(express::LINK_CTL2_STA2);
        let old = self.access.read(port, reg)?;
        let new = with_field(old & 0xFFFF, express::link::CTL2_TARGET_SPEED_LO, 4, speed.code());
        if new != old & 0xFFFF {
            self.access.write(port, reg, new)?;
        }
        tracing::info!("{}: target link speed {speed}", port.addr());
        self.retrain(index)
    }

    /// Speed of the link above this device
    ///
    /// # Errors
    ///
    /// Returns error for root devices or failed reads / control calls.
    pub fn upstream_speed(&self) -> Result<LinkSpeed> {
        let up = self.port(PortSelect::Upstream)?;
        if self.family.upstream_speed_via_control() {
            return match self
                .access
                .platform()
                .control(ControlRequest::GetUpstreamSpeed { addr: up.addr() })?
            {
                ControlResponse::Speed(s) => Ok(s),
                other => Err(PexError::unsupported(format!(
                    "{}: upstream speed query returned {other:?}",
                    up.addr()
                ))),
            };
        }
        LinkStatus::decode(self.link_ctl_sta(up)?)
            .speed
            .ok_or_else(|| PexError::unsupported(format!("{}: link down", up.addr())))
    }

    /// Set the target speed advertised by the upstream port
    ///
    /// BR04 needs host-side coordination and goes through the control call.
    ///
    /// # Errors
    ///
    /// Returns error for root devices, above the port maximum, or on a
    /// failed write.
    pub fn set_upstream_speed(&self, speed: LinkSpeed) -> Result<()> {
        let up = self.port(PortSelect::Upstream)?;
        if self.family.upstream_speed_via_control() {
            self.access
                .platform()
                .control(ControlRequest::SetUpstreamSpeed { addr: up.addr(), speed })?;
            return Ok(());
        }
        let caps = up.caps();
        if !caps.has_express() {
            return Err(PexError::missing_capability(up.addr(), "PCI Express"));
        }
        let max = LinkCapInfo::decode(self.access.read(up, caps.express_reg(express::LINK_CAP))?).max_speed;
        if max.is_some_and(|m| speed > m) {
            return Err(PexError::capability_mismatch(format!(
                "{speed} exceeds upstream port maximum"
            )));
        }
        let reg = caps.express_reg(express::LINK_CTL2_STA2);
        let old = self.access.read(up, reg)?;
        let new = with_field(old & 0xFFFF, express::link::CTL2_TARGET_SPEED_LO, 4, speed.code());
        self.access.write(up, reg, new)
    }

    // ── ASPM ─────────────────────────────────────────────────────────────

    fn read_aspm(&self, port: &Port) -> Result<Aspm> {
        read_port_aspm(&self.access, port)
    }

    fn write_aspm(&self, port: &Port, state: Aspm) -> Result<()> {
        write_port_aspm(&self.access, port, state)
    }

    fn clamp_aspm(&self, port: &Port, state: Aspm, force: bool) -> Result<Aspm> {
        let allowed = self.probe()?.aspm;
        let effective = if force { state } else { state.intersect(allowed) };
        if effective != state {
            tracing::debug!("{}: ASPM {state} clamped to {effective}", port.addr());
        }
        if effective.l1() && self.family.warns_l1_at_high_speed() {
            let speed = LinkStatus::decode(self.link_ctl_sta(port)?).speed;
            if matches!(speed, Some(LinkSpeed::Gen3 | LinkSpeed::Gen4)) {
                tracing::warn!(
                    "{}: enabling ASPM L1 at {} on {} silicon",
                    port.addr(),
                    speed.map_or_else(String::new, |s| s.to_string()),
                    self.family
                );
            }
        }
        Ok(effective)
    }

    /// ASPM capability after family overrides
    ///
    /// # Errors
    ///
    /// Returns error if the probe fails.
    pub fn aspm_capability(&self) -> Result<Aspm> {
        Ok(self.probe()?.aspm)
    }

    /// ASPM enables of a downstream port
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or failed read.
    pub fn downstream_aspm(&self, index: usize) -> Result<Aspm> {
        self.read_aspm(self.downstream(index)?)
    }

    /// Set a downstream port's ASPM, clamped to the capability unless forced
    ///
    /// Returns the state written.
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or failed access.
    pub fn set_downstream_aspm(&self, index: usize, state: Aspm, force: bool) -> Result<Aspm> {
        let port = self.downstream(index)?;
        let effective = self.clamp_aspm(port, state, force)?;
        self.write_aspm(port, effective)?;
        self.mark_live();
        Ok(effective)
    }

    /// ASPM enables of the upstream port
    ///
    /// # Errors
    ///
    /// Returns error for root devices or on a failed read.
    pub fn upstream_aspm(&self) -> Result<Aspm> {
        self.read_aspm(self.port(PortSelect::Upstream)?)
    }

    /// Set the upstream port's ASPM, clamped like the downstream side
    ///
    /// # Errors
    ///
    /// Returns error for root devices or on a failed access.
    pub fn set_upstream_aspm(&self, state: Aspm, force: bool) -> Result<Aspm> {
        let port = self.port(PortSelect::Upstream)?;
        let effective = self.clamp_aspm(port, state, force)?;
        self.write_aspm(port, effective)?;
        self.mark_live();
        Ok(effective)
    }

    /// L1 substate enables of a port
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` without an L1SS capability.
    pub fn l1ss(&self, select: PortSelect) -> Result<L1ssState> {
        let port = self.port(select)?;
        read_l1ss(&self.access, port)
    }

    pub(crate) fn note_l1ss_change(&self) {
        self.mark_live();
    }

    // ── DPC ──────────────────────────────────────────────────────────────

    fn dpc_reg(&self, index: usize) -> Result<(&Arc<Port>, u16)> {
        let port = self.downstream(index)?;
        if !port.caps().has_dpc() {
            return Err(PexError::missing_capability(port.addr(), "DPC"));
        }
        Ok((port, port.caps().dpc + dpc::CAP_CTL))
    }

    /// DPC trigger mode of a downstream port
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` without DPC.
    pub fn dpc_mode(&self, index: usize) -> Result<DpcMode> {
        let (port, reg) = self.dpc_reg(index)?;
        let raw = self.access.read(port, reg)?;
        Ok(DpcMode::from_trigger(pexfab_regs::field(
            raw,
            dpc::CTL_TRIGGER_LO,
            dpc::CTL_TRIGGER_BITS,
        )))
    }

    /// Set a downstream port's DPC trigger mode
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` without DPC and `CapabilityMismatch` for
    /// a mode outside the DPC mask.
    pub fn set_dpc_mode(&self, index: usize, mode: DpcMode) -> Result<()> {
        let (port, reg) = self.dpc_reg(index)?;
        if !self.probe()?.dpc.allows(mode) {
            return Err(PexError::capability_mismatch(format!(
                "{}: DPC mode {mode} not supported",
                port.addr()
            )));
        }
        let old = self.access.read(port, reg)?;
        let new = with_field(old, dpc::CTL_TRIGGER_LO, dpc::CTL_TRIGGER_BITS, mode.trigger());
        if new != old {
            self.access.write(port, reg, new)?;
        }
        tracing::debug!("{}: DPC {mode}", port.addr());
        Ok(())
    }

    // ── Link control ─────────────────────────────────────────────────────

    /// Disable or re-enable a downstream link
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or failed access.
    pub fn set_link_disabled(&self, index: usize, disabled: bool) -> Result<()> {
        let port = self.downstream(index)?;
        let reg = port.caps().express_reg(express::LINK_CTL_STA);
        self.link_ctl_sta(port)?;
        let (clear, set) = if disabled {
            (0, express::link::CTL_LINK_DISABLE)
        } else {
            (express::link::CTL_LINK_DISABLE, 0)
        };
        self.access.modify(port, reg, clear, set, express::link::STA_RW1C)?;
        tracing::info!("{}: link {}", port.addr(), if disabled { "disabled" } else { "enabled" });
        Ok(())
    }

    /// Retrain a downstream link and wait for training to finish
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the training bit stays set.
    pub fn retrain(&self, index: usize) -> Result<()> {
        let port = self.downstream(index)?;
        let reg = port.caps().express_reg(express::LINK_CTL_STA);
        let ctl = self.link_ctl_sta(port)?;
        self.access.write(
            port,
            reg,
            (ctl & 0xFFFF) | express::link::CTL_RETRAIN,
        )?;
        let done = poll(LINK_TRAINING_TIMEOUT, || {
            Ok(self.access.read(port, reg)? & express::link::STA_TRAINING == 0)
        })?;
        if done {
            Ok(())
        } else {
            Err(PexError::timeout(
                format!("{} link training", port.addr()),
                duration_ms(LINK_TRAINING_TIMEOUT),
            ))
        }
    }

    /// Wait for the data link layer of a downstream link to come up
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the port cannot report it and `Timeout`
    /// if the link stays down.
    pub fn wait_link_active(&self, index: usize, timeout: Duration) -> Result<()> {
        let port = self.downstream(index)?;
        if !self.link_caps(index)?.dll_active_reporting {
            return Err(PexError::unsupported(format!(
                "{}: no data link layer active reporting",
                port.addr()
            )));
        }
        let reg = port.caps().express_reg(express::LINK_CTL_STA);
        let up = poll(timeout, || {
            Ok(self.access.read(port, reg)? & express::link::STA_DLL_ACTIVE != 0)
        })?;
        if up {
            Ok(())
        } else {
            Err(PexError::timeout(format!("{} link active", port.addr()), duration_ms(timeout)))
        }
    }

    /// Pulse secondary bus reset on a downstream port
    ///
    /// # Errors
    ///
    /// Returns the first failed access; the reset bit is always released.
    pub fn secondary_bus_reset(&self, index: usize) -> Result<()> {
        let port = self.downstream(index)?;
        let ctl = self.access.read(port, config::BRIDGE_CONTROL)?;
        self.access
            .write(port, config::BRIDGE_CONTROL, ctl | config::BRIDGE_CTL_BUS_RESET)?;
        thread::sleep(BUS_RESET_HOLD);

        let mut sticky = StickyError::new();
        sticky.record(
            "release bus reset",
            self.access
                .write(port, config::BRIDGE_CONTROL, ctl & !config::BRIDGE_CTL_BUS_RESET),
        );
        thread::sleep(BUS_RESET_SETTLE);
        tracing::info!("{}: secondary bus reset", port.addr());
        sticky.finish()
    }

    /// Enable or disable bus mastering on a port
    ///
    /// # Errors
    ///
    /// Returns error on a bad selection or failed access.
    pub fn set_bus_master(&self, select: PortSelect, enable: bool) -> Result<()> {
        let port = self.port(select)?;
        // Status half is RW1C; write it back as zero
        let (clear, set) = if enable {
            (0, config::CMD_BUS_MASTER)
        } else {
            (config::CMD_BUS_MASTER, 0)
        };
        self.access
            .modify(port, config::COMMAND_STATUS, clear, set, 0xFFFF_0000)?;
        Ok(())
    }

    /// Bus mastering enabled on a port
    ///
    /// # Errors
    ///
    /// Returns error on a bad selection or failed read.
    pub fn bus_master(&self, select: PortSelect) -> Result<bool> {
        let port = self.port(select)?;
        Ok(self.access.read(port, config::COMMAND_STATUS)? & config::CMD_BUS_MASTER != 0)
    }

    // ── Hot-plug ─────────────────────────────────────────────────────────

    /// Arm or disarm hot-plug interrupts on a downstream port
    ///
    /// Pending slot events are acknowledged before arming. Unless the slot
    /// reports no command completed support, the command completed bit is
    /// polled; on ports in the skip list a timeout is only logged.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` on a slot without hot-plug and `Timeout` if
    /// the command does not complete.
    pub fn set_hotplug_interrupts(&self, index: usize, enable: bool) -> Result<()> {
        use express::slot;

        let port = self.downstream(index)?;
        let caps = port.caps();
        if !caps.has_express() {
            return Err(PexError::missing_capability(port.addr(), "PCI Express"));
        }
        let slot_cap = self.access.read(port, caps.express_reg(express::SLOT_CAP))?;
        if slot_cap & slot::CAP_HOTPLUG == 0 {
            return Err(PexError::unsupported(format!("{}: slot is not hot-plug capable", port.addr())));
        }

        let reg = caps.express_reg(express::SLOT_CTL_STA);
        let ctl = self.access.read(port, reg)? & 0xFFFF;
        self.access.write(port, reg, ctl | slot::STA_PENDING_EVENTS)?;

        let new_ctl = if enable {
            ctl | slot::CTL_HOTPLUG_EVENTS
        } else {
            ctl & !slot::CTL_HOTPLUG_EVENTS
        };
        self.access.write(port, reg, new_ctl)?;

        if slot_cap & slot::CAP_NO_COMMAND_COMPLETED != 0 {
            return Ok(());
        }

        let completed = poll(COMMAND_COMPLETED_TIMEOUT, || {
            Ok(self.access.read(port, reg)? & slot::STA_COMMAND_COMPLETED != 0)
        })?;
        if completed {
            self.access.write(port, reg, new_ctl | slot::STA_COMMAND_COMPLETED)?;
            return Ok(());
        }

        if self.families.skips_command_completed(port.id()) {
            tracing::warn!("{}: hot-plug command completed never set (known quirk)", port.addr());
            Ok(())
        } else {
            Err(PexError::timeout(
                format!("{} hot-plug command completed", port.addr()),
                duration_ms(COMMAND_COMPLETED_TIMEOUT),
            ))
        }
    }
}

/// ASPM control bits of any port with a PCI Express capability
pub(crate) fn read_port_aspm(access: &RegisterAccess, port: &Port) -> Result<Aspm> {
    let caps = port.caps();
    if !caps.has_express() {
        return Err(PexError::missing_capability(port.addr(), "PCI Express"));
    }
    Ok(Aspm::from_bits(access.read(port, caps.express_reg(express::LINK_CTL_STA))?))
}

/// Write ASPM control bits, leaving LinkSta RW1C bits untouched
pub(crate) fn write_port_aspm(access: &RegisterAccess, port: &Port, state: Aspm) -> Result<()> {
    let caps = port.caps();
    if !caps.has_express() {
        return Err(PexError::missing_capability(port.addr(), "PCI Express"));
    }
    access.modify(
        port,
        caps.express_reg(express::LINK_CTL_STA),
        express::link::CTL_ASPM_MASK,
        state.bits(),
        express::link::STA_RW1C,
    )?;
    Ok(())
}

/// L1SS control 1 enables of any port
pub(crate) fn read_l1ss(access: &RegisterAccess, port: &Port) -> Result<L1ssState> {
    let caps = port.caps();
    if !caps.has_l1ss() {
        return Err(PexError::missing_capability(port.addr(), "L1 PM Substates"));
    }
    Ok(L1ssState::from_bits(access.read(port, caps.l1ss + l1ss::CTL1)?))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Poll `check` until it returns true or `timeout` elapses
fn poll(timeout: Duration, mut check: impl FnMut() -> Result<bool>) -> Result<bool> {
    let start = Instant::now();
    loop {
        if check()? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PciAddress;
    use crate::platform::sim::{SIM_DPC_CAP, SIM_PCIE_CAP};
    use crate::platform::{SimFunction, SimMmio, SimPlatform};
    use pexfab_regs::express::port_type;
    use pexfab_regs::vendor;

    const UP: PciAddress = PciAddress::new(0, 1, 0, 0);
    const DOWN: PciAddress = PciAddress::new(0, 2, 0, 0);
    const PLX: PciId = PciId::new(0x10B5, 0x8747);
    const GENERIC: PciId = PciId::new(0x1234, 0x0001);

    fn device(sim: &Arc<SimPlatform>) -> BridgeDevice {
        device_with(sim, Settings::default())
    }

    fn device_with(sim: &Arc<SimPlatform>, settings: Settings) -> BridgeDevice {
        let access = RegisterAccess::new(sim.clone());
        let up = Arc::new(Port::scan(sim.as_ref(), UP).unwrap());
        let down = Arc::new(Port::scan(sim.as_ref(), DOWN).unwrap());
        BridgeDevice::new(
            DeviceId(0),
            Some(up),
            vec![down],
            access,
            Arc::new(settings),
            Arc::new(FamilyTable::default()),
        )
    }

    fn fabric(id: PciId, down: SimFunction) -> Arc<SimPlatform> {
        Arc::new(
            SimPlatform::new()
                .with(SimFunction::bridge(UP, id, port_type::UPSTREAM, 0, 1, 2).with_link_cap(3, 16, 0b11, 0))
                .with(down),
        )
    }

    fn down_port(id: PciId) -> SimFunction {
        SimFunction::bridge(DOWN, id, port_type::DOWNSTREAM, 1, 2, 2)
            .with_link_cap(3, 8, 0b11, 1)
            .with_link_status(1, 8)
    }

    #[test]
    fn speed_code_three_is_eight_gts() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        assert_eq!(dev.max_speed(0).unwrap(), LinkSpeed::Gen3);
        assert_eq!(dev.max_speed(0).unwrap().to_string(), "8.0 GT/s");
        assert_eq!(dev.max_width(0).unwrap(), 8);
        assert_eq!(dev.downstream_speed(0).unwrap(), LinkSpeed::Gen1);
    }

    #[test]
    fn aspm_round_trip_clamps_unless_forced() {
        // port supports L1 only
        let down = SimFunction::bridge(DOWN, GENERIC, port_type::DOWNSTREAM, 1, 2, 2).with_link_cap(3, 8, 0b10, 1);
        let sim = fabric(GENERIC, down);
        let dev = device(&sim);
        dev.initialize().unwrap();

        dev.set_downstream_aspm(0, Aspm::L0sL1, false).unwrap();
        assert_eq!(dev.downstream_aspm(0).unwrap(), Aspm::L1);

        dev.set_downstream_aspm(0, Aspm::L0sL1, true).unwrap();
        assert_eq!(dev.downstream_aspm(0).unwrap(), Aspm::L0sL1);
        assert_eq!(dev.state(), DeviceState::Live);
    }

    #[test]
    fn plx_forces_l0s_off() {
        let sim = fabric(PLX, down_port(PLX));
        sim.add_bar(UP, 0, Arc::new(SimMmio::new(vendor::plx::PORT_STRIDE * 2)));
        let dev = device(&sim);
        dev.initialize().unwrap();
        assert_eq!(dev.family(), Family::Plx(crate::family::PlxGeneration::Gen3));
        assert_eq!(dev.aspm_capability().unwrap(), Aspm::L1);
    }

    #[test]
    fn initialize_maps_once() {
        let sim = fabric(PLX, down_port(PLX));
        sim.add_bar(UP, 0, Arc::new(SimMmio::new(vendor::plx::PORT_STRIDE * 2)));
        let dev = device(&sim);
        assert_eq!(dev.state(), DeviceState::Unknown);
        dev.initialize().unwrap();
        dev.initialize().unwrap();
        assert_eq!(sim.map_calls(), 1);
        assert!(dev.downstream(0).unwrap().hw_counters().is_some());
        assert_eq!(dev.state(), DeviceState::CapabilitiesProbed);

        dev.shutdown().unwrap();
        assert!(dev.downstream(0).unwrap().hw_counters().is_none());
    }

    #[test]
    fn skipped_hw_counters_leave_bar_unmapped() {
        let sim = fabric(PLX, down_port(PLX));
        sim.add_bar(UP, 0, Arc::new(SimMmio::new(vendor::plx::PORT_STRIDE * 2)));
        let settings = Settings::default();
        settings.set_skip_hw_counters(true);
        let dev = device_with(&sim, settings);
        dev.initialize().unwrap();
        assert_eq!(sim.map_calls(), 0);
        assert!(dev.downstream(0).unwrap().hw_counters().is_none());
        assert_eq!(dev.state(), DeviceState::CapabilitiesProbed);
    }

    #[test]
    fn plx_l1_at_gen3_is_allowed() {
        let sim = fabric(PLX, down_port(PLX).with_link_status(3, 8));
        let dev = device(&sim);
        assert_eq!(dev.set_downstream_aspm(0, Aspm::L1, false).unwrap(), Aspm::L1);
        assert_eq!(dev.downstream_aspm(0).unwrap(), Aspm::L1);
    }

    #[test]
    fn br04_windows_come_from_control_call() {
        let br04 = PciId::new(0x10DE, 0x05B8);
        let sim = fabric(br04, down_port(br04));
        let bar = Arc::new(SimMmio::new(vendor::br04::BAR0_SIZE));
        sim.add_physical(0xF000_0000, bar.clone());
        sim.script_control(
            ControlRequest::Bar0Address { addr: UP },
            ControlResponse::Address(0xF000_0000),
        );
        let dev = device(&sim);
        dev.initialize().unwrap();
        let w = dev.downstream(0).unwrap().window().unwrap();
        assert_eq!(w.base(), vendor::br04::PORT_STRIDE);
        // errors come from the status mirror, not counter registers
        assert!(dev.downstream(0).unwrap().hw_counters().is_none());
    }

    #[test]
    fn br04_upstream_speed_uses_control_call() {
        let br04 = PciId::new(0x10DE, 0x05B8);
        let sim = fabric(br04, down_port(br04));
        sim.script_control(
            ControlRequest::GetUpstreamSpeed { addr: UP },
            ControlResponse::Speed(LinkSpeed::Gen2),
        );
        let dev = device(&sim);
        assert_eq!(dev.upstream_speed().unwrap(), LinkSpeed::Gen2);
        assert!(dev.set_upstream_speed(LinkSpeed::Gen1).is_err());
        assert_eq!(sim.control_calls().len(), 2);
    }

    #[test]
    fn failed_probe_caches_nothing() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        sim.fail_register(DOWN, SIM_PCIE_CAP + express::LINK_CAP, "bus error");
        assert!(dev.initialize().is_err());
        assert!(!dev.is_initialized());
        assert_eq!(dev.state(), DeviceState::Unknown);
    }

    #[test]
    fn bad_port_index() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        assert!(matches!(
            dev.downstream_aspm(3),
            Err(PexError::InvalidPort { index: 3, count: 1 })
        ));
    }

    #[test]
    fn speed_above_max_rejected_before_write() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        sim.clear_writes();
        assert!(matches!(
            dev.set_downstream_speed(0, LinkSpeed::Gen4),
            Err(PexError::CapabilityMismatch { .. })
        ));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn speed_change_writes_target_and_retrains() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        dev.set_downstream_speed(0, LinkSpeed::Gen2).unwrap();
        let ctl2 = sim.peek(DOWN, SIM_PCIE_CAP + express::LINK_CTL2_STA2);
        assert_eq!(ctl2 & 0xF, 2);
        let writes = sim.writes_to(DOWN, SIM_PCIE_CAP + express::LINK_CTL_STA);
        assert!(writes.iter().any(|w| w & express::link::CTL_RETRAIN != 0));
    }

    #[test]
    fn dpc_mode_round_trip() {
        let sim = fabric(GENERIC, down_port(GENERIC).with_dpc());
        let dev = device(&sim);
        dev.set_dpc_mode(0, DpcMode::NonFatal).unwrap();
        assert_eq!(dev.dpc_mode(0).unwrap(), DpcMode::NonFatal);
        assert_eq!((sim.peek(DOWN, SIM_DPC_CAP + dpc::CAP_CTL) >> 16) & 3, 2);
    }

    #[test]
    fn dpc_missing_capability() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        assert!(matches!(dev.dpc_mode(0), Err(PexError::MissingCapability { .. })));
    }

    #[test]
    fn hotplug_clears_pending_before_arming() {
        use express::slot;
        let reg = SIM_PCIE_CAP + express::SLOT_CTL_STA;
        let down = down_port(GENERIC)
            .with_slot_cap(slot::CAP_HOTPLUG)
            .with_latched(reg, slot::STA_COMMAND_COMPLETED);
        let sim = fabric(GENERIC, down);
        sim.assert_bits(DOWN, reg, slot::STA_PRESENCE_CHANGED);
        let dev = device(&sim);
        dev.set_hotplug_interrupts(0, true).unwrap();

        let writes = sim.writes_to(DOWN, reg);
        assert_eq!(writes[0] & slot::STA_PENDING_EVENTS, slot::STA_PENDING_EVENTS);
        assert_eq!(writes[1] & slot::CTL_HOTPLUG_EVENTS, slot::CTL_HOTPLUG_EVENTS);
        assert_eq!(sim.peek(DOWN, reg) & slot::STA_PRESENCE_CHANGED, 0);
    }

    #[test]
    fn hotplug_without_command_completed_support_does_not_wait() {
        use express::slot;
        let down = down_port(GENERIC).with_slot_cap(slot::CAP_HOTPLUG | slot::CAP_NO_COMMAND_COMPLETED);
        let sim = fabric(GENERIC, down);
        let dev = device(&sim);
        dev.set_hotplug_interrupts(0, true).unwrap();
    }

    #[test]
    fn hotplug_command_completed_timeout() {
        use express::slot;
        let sim = fabric(GENERIC, down_port(GENERIC).with_slot_cap(slot::CAP_HOTPLUG));
        let dev = device(&sim);
        assert!(matches!(
            dev.set_hotplug_interrupts(0, true),
            Err(PexError::Timeout { .. })
        ));
    }

    #[test]
    fn hotplug_timeout_on_quirk_port_is_only_logged() {
        use express::slot;
        let quirk = PciId::new(0x8086, 0x0C00);
        let down = SimFunction::bridge(DOWN, quirk, port_type::DOWNSTREAM, 1, 2, 2)
            .with_link_cap(3, 8, 0b11, 1)
            .with_slot_cap(slot::CAP_HOTPLUG);
        let sim = fabric(GENERIC, down);
        let dev = device(&sim);
        dev.set_hotplug_interrupts(0, true).unwrap();
        let ctl = sim.peek(DOWN, SIM_PCIE_CAP + express::SLOT_CTL_STA);
        assert_eq!(ctl & slot::CTL_HOTPLUG_EVENTS, slot::CTL_HOTPLUG_EVENTS);
    }

    #[test]
    fn bus_master_toggle() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        dev.set_bus_master(PortSelect::Upstream, true).unwrap();
        assert!(dev.bus_master(PortSelect::Upstream).unwrap());
        dev.set_bus_master(PortSelect::Upstream, false).unwrap();
        assert!(!dev.bus_master(PortSelect::Upstream).unwrap());
    }

    #[test]
    fn secondary_bus_reset_pulses_bit() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        dev.secondary_bus_reset(0).unwrap();
        let writes = sim.writes_to(DOWN, config::BRIDGE_CONTROL);
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0] & config::BRIDGE_CTL_BUS_RESET, 0);
        assert_eq!(writes[1] & config::BRIDGE_CTL_BUS_RESET, 0);
    }

    #[test]
    fn depth_is_set_once() {
        let sim = fabric(GENERIC, down_port(GENERIC));
        let dev = device(&sim);
        dev.assign_depth(1).unwrap();
        dev.assign_depth(1).unwrap();
        assert!(dev.assign_depth(2).is_err());
        assert_eq!(dev.depth(), Some(1));
    }
}
