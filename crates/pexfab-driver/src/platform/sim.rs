// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated platform
//!
//! In-memory 4 KiB configuration spaces with enough register semantics to
//! exercise the manager without hardware:
//!
//! - RW1C status bits (DevSta, LinkSta, SlotSta, AER, DPC) clear on a
//!   written one and ignore a written zero
//! - read-only fields keep their value across writes
//! - latched bits re-assert after every write (a fault that will not clear)
//! - the AER first error pointer tracks the lowest pending valid UE bit
//! - every config write is recorded in order for sequencing checks
//!
//! BARs and physical windows are [`SimMmio`] regions registered up front.

use super::{ControlRequest, ControlResponse, Mmio, Platform};
use crate::address::{PciAddress, PciId};
use crate::error::{PexError, Result};
use pexfab_regs::{aer, config, dpc, express, ext, l1ss};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const CONFIG_DWORDS: usize = config::EXTENDED_SIZE as usize / 4;

/// Offset of the PCI Express capability in simulated functions
pub const SIM_PCIE_CAP: u16 = 0x40;
/// Offset of the AER extended capability in simulated functions
pub const SIM_AER_CAP: u16 = 0x100;
/// Offset of the L1SS extended capability in simulated functions
pub const SIM_L1SS_CAP: u16 = 0x180;
/// Offset of the DPC extended capability in simulated functions
pub const SIM_DPC_CAP: u16 = 0x1C0;

/// One configuration write observed by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target function
    pub addr: PciAddress,
    /// Dword offset
    pub offset: u16,
    /// Value as written by the caller
    pub value: u32,
}

/// Builder and backing store for one simulated PCI function
#[derive(Debug, Clone)]
pub struct SimFunction {
    addr: PciAddress,
    regs: Vec<u32>,
    rw1c: HashMap<u16, u32>,
    readonly: HashMap<u16, u32>,
    self_clearing: HashMap<u16, u32>,
    latched: HashMap<u16, u32>,
    ext_caps: BTreeMap<u16, u16>,
}

impl SimFunction {
    fn blank(addr: PciAddress, id: PciId, class: u32, header_type: u32) -> Self {
        let mut f = Self {
            addr,
            regs: vec![0; CONFIG_DWORDS],
            rw1c: HashMap::new(),
            readonly: HashMap::new(),
            self_clearing: HashMap::new(),
            latched: HashMap::new(),
            ext_caps: BTreeMap::new(),
        };
        f.set(config::ID, id_dword(id));
        f.set(config::COMMAND_STATUS, config::STATUS_CAP_LIST);
        f.set(config::CLASS_REVISION, class << 8);
        f.set(config::HEADER_DWORD, header_type << 16);
        f.set(config::CAP_PTR, u32::from(SIM_PCIE_CAP));
        f
    }

    fn express_cap(mut self, port_type: u32) -> Self {
        let cap = SIM_PCIE_CAP;
        self.set(cap, u32::from(config::cap_id::PCI_EXPRESS) | (2 << 16) | (port_type << 20));
        self.rw1c.insert(cap + express::DEVICE_CTL_STA, express::device::STA_ERRORS << 16);
        self.readonly.insert(cap + express::LINK_CTL_STA, 0xFFFF_0000 & !express::link::STA_RW1C);
        self.rw1c.insert(cap + express::LINK_CTL_STA, express::link::STA_RW1C);
        self.self_clearing.insert(cap + express::LINK_CTL_STA, express::link::CTL_RETRAIN);
        self.rw1c.insert(cap + express::SLOT_CTL_STA, express::slot::STA_PENDING_EVENTS);
        self
    }

    /// Type-1 bridge function with a PCI Express capability of `port_type`
    #[must_use]
    pub fn bridge(
        addr: PciAddress,
        id: PciId,
        port_type: u32,
        primary: u8,
        secondary: u8,
        subordinate: u8,
    ) -> Self {
        let mut f = Self::blank(addr, id, config::CLASS_PCI_BRIDGE, config::HEADER_TYPE_BRIDGE)
            .express_cap(port_type);
        f.set(
            config::BUS_NUMBERS,
            u32::from(primary) | (u32::from(secondary) << 8) | (u32::from(subordinate) << 16),
        );
        f
    }

    /// Type-0 endpoint with the given 24-bit class code
    #[must_use]
    pub fn endpoint(addr: PciAddress, id: PciId, class: u32) -> Self {
        Self::blank(addr, id, class, config::HEADER_TYPE_NORMAL)
            .express_cap(express::port_type::ENDPOINT)
    }

    /// Function without a capability list (legacy PCI)
    #[must_use]
    pub fn without_express(mut self) -> Self {
        self.set(config::COMMAND_STATUS, 0);
        self.set(config::CAP_PTR, 0);
        self.set(SIM_PCIE_CAP, 0);
        self
    }

    /// Link capabilities: max speed code, max width, ASPM support bits
    #[must_use]
    pub fn with_link_cap(mut self, speed_code: u32, width: u32, aspm_support: u32, port_number: u8) -> Self {
        let value = speed_code
            | (width << express::link::CAP_WIDTH_LO)
            | ((aspm_support & 0b11) << 10)
            | express::link::CAP_DLL_ACTIVE_REPORTING
            | (u32::from(port_number) << express::link::CAP_PORT_NUMBER_LO);
        self.set(SIM_PCIE_CAP + express::LINK_CAP, value);
        self.set(SIM_PCIE_CAP + express::LINK_CTL2_STA2, speed_code);
        self
    }

    /// Link status: current speed, negotiated width, DLL active
    #[must_use]
    pub fn with_link_status(mut self, speed_code: u32, width: u32) -> Self {
        let off = SIM_PCIE_CAP + express::LINK_CTL_STA;
        let ctl = self.get(off) & 0xFFFF;
        let sta = (speed_code << express::link::STA_SPEED_LO)
            | (width << express::link::STA_WIDTH_LO)
            | express::link::STA_DLL_ACTIVE;
        self.set(off, ctl | sta);
        self
    }

    /// Slot capabilities
    #[must_use]
    pub fn with_slot_cap(mut self, value: u32) -> Self {
        self.set(SIM_PCIE_CAP + express::SLOT_CAP, value);
        self
    }

    /// AER extended capability with multi-header recording capable + enabled
    #[must_use]
    pub fn with_aer(mut self, multi_header: bool) -> Self {
        self.add_ext(ext::id::AER, SIM_AER_CAP);
        self.rw1c.insert(SIM_AER_CAP + aer::UE_STATUS, 0xFFFF_FFFF);
        self.rw1c.insert(SIM_AER_CAP + aer::CE_STATUS, 0xFFFF_FFFF);
        if multi_header {
            self.set(
                SIM_AER_CAP + aer::CAP_CTL,
                aer::cap_ctl::MULTI_HEADER_CAPABLE | aer::cap_ctl::MULTI_HEADER_ENABLE,
            );
        }
        self.readonly.insert(SIM_AER_CAP + aer::CAP_CTL, aer::cap_ctl::FIRST_ERROR_POINTER_MASK);
        self
    }

    /// L1 PM substates capability with the given capability bits
    #[must_use]
    pub fn with_l1ss(mut self, caps: u32) -> Self {
        self.add_ext(ext::id::L1SS, SIM_L1SS_CAP);
        self.set(SIM_L1SS_CAP + l1ss::CAPS, caps | l1ss::CAP_SUBSTATES);
        self
    }

    /// DPC capability
    #[must_use]
    pub fn with_dpc(mut self) -> Self {
        self.add_ext(ext::id::DPC, SIM_DPC_CAP);
        self.rw1c.insert(SIM_DPC_CAP + dpc::STATUS, dpc::STATUS_TRIGGERED);
        self
    }

    /// Raw register value
    #[must_use]
    pub fn with_register(mut self, offset: u16, value: u32) -> Self {
        self.set(offset, value);
        self
    }

    /// Bits of `offset` that re-assert after every write
    #[must_use]
    pub fn with_latched(mut self, offset: u16, bits: u32) -> Self {
        *self.latched.entry(offset).or_default() |= bits;
        self.regs[usize::from(offset / 4)] |= bits;
        self
    }

    /// Address of this function
    #[must_use]
    pub const fn addr(&self) -> PciAddress {
        self.addr
    }

    fn add_ext(&mut self, id: u16, offset: u16) {
        self.ext_caps.insert(offset, id);
        let offsets: Vec<(u16, u16)> = self.ext_caps.iter().map(|(o, i)| (*o, *i)).collect();
        // first extended capability must sit at 0x100; unused slot gets a null header
        if offsets[0].0 != ext::FIRST {
            self.set(ext::FIRST, ext::header(0, 0, offsets[0].0));
        }
        for (n, (off, cap)) in offsets.iter().enumerate() {
            let next = offsets.get(n + 1).map_or(0, |(o, _)| *o);
            self.set(*off, ext::header(*cap, 1, next));
        }
    }

    fn get(&self, offset: u16) -> u32 {
        self.regs[usize::from(offset / 4)]
    }

    fn set(&mut self, offset: u16, value: u32) {
        self.regs[usize::from(offset / 4)] = value;
    }

    fn write(&mut self, offset: u16, value: u32) {
        let old = self.get(offset);
        let rw1c = self.rw1c.get(&offset).copied().unwrap_or(0);
        let ro = self.readonly.get(&offset).copied().unwrap_or(0);
        let sc = self.self_clearing.get(&offset).copied().unwrap_or(0);
        let latched = self.latched.get(&offset).copied().unwrap_or(0);

        let plain = !(rw1c | ro);
        let mut new = (value & plain) | (old & ro) | (old & rw1c & !value);
        new &= !sc;
        new |= latched;
        self.set(offset, new);

        if offset == SIM_AER_CAP + aer::UE_STATUS && self.ext_caps.contains_key(&SIM_AER_CAP) {
            self.update_first_error_pointer();
        }
    }

    fn update_first_error_pointer(&mut self) {
        let pending = self.get(SIM_AER_CAP + aer::UE_STATUS) & aer::ue::VALID;
        let fep = if pending == 0 { 0 } else { pending.trailing_zeros() };
        let off = SIM_AER_CAP + aer::CAP_CTL;
        let ctl = self.get(off) & !aer::cap_ctl::FIRST_ERROR_POINTER_MASK;
        self.set(off, ctl | fep);
    }
}

fn id_dword(id: PciId) -> u32 {
    (u32::from(id.device) << 16) | u32::from(id.vendor)
}

/// Simulated MMIO region
#[derive(Debug)]
pub struct SimMmio {
    words: Mutex<Vec<u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl SimMmio {
    /// Zero-filled region of `size` bytes
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            words: Mutex::new(vec![0; size / 4]),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Set a register without recording a write
    pub fn poke(&self, offset: usize, value: u32) {
        if let Ok(mut words) = self.words.lock() {
            if let Some(w) = words.get_mut(offset / 4) {
                *w = value;
            }
        }
    }

    /// Read a register without tracing
    #[must_use]
    pub fn peek(&self, offset: usize) -> u32 {
        self.words
            .lock()
            .ok()
            .and_then(|w| w.get(offset / 4).copied())
            .unwrap_or(0)
    }

    /// Writes issued through [`Mmio::write_u32`], in order
    #[must_use]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

impl Mmio for SimMmio {
    fn read_u32(&self, offset: usize) -> Result<u32> {
        let words = self
            .words
            .lock()
            .map_err(|_| PexError::invalid_state("sim mmio poisoned"))?;
        words
            .get(offset / 4)
            .copied()
            .filter(|_| offset % 4 == 0)
            .ok_or_else(|| PexError::map_failed(format!("sim mmio read at {offset:#x} out of range")))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let mut words = self
            .words
            .lock()
            .map_err(|_| PexError::invalid_state("sim mmio poisoned"))?;
        let slot = words
            .get_mut(offset / 4)
            .filter(|_| offset % 4 == 0)
            .ok_or_else(|| PexError::map_failed(format!("sim mmio write at {offset:#x} out of range")))?;
        *slot = value;
        if let Ok(mut w) = self.writes.lock() {
            w.push((offset, value));
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.words.lock().map(|w| w.len() * 4).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct SimState {
    functions: BTreeMap<PciAddress, SimFunction>,
    writes: Vec<RecordedWrite>,
    bars: HashMap<(PciAddress, u8), Arc<SimMmio>>,
    physical: HashMap<u64, Arc<SimMmio>>,
    control: HashMap<ControlRequest, ControlResponse>,
    control_calls: Vec<ControlRequest>,
    failing: HashMap<(PciAddress, u16), String>,
}

/// Platform backed entirely by memory
#[derive(Debug, Default)]
pub struct SimPlatform {
    state: Mutex<SimState>,
    map_calls: AtomicUsize,
}

impl SimPlatform {
    /// Empty simulated bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| PexError::invalid_state("sim platform poisoned"))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        match self.state.lock() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Add (or replace) a function
    pub fn add(&self, function: SimFunction) {
        self.with_state(|s| {
            s.functions.insert(function.addr, function);
        });
    }

    /// Builder form of [`SimPlatform::add`]
    #[must_use]
    pub fn with(self, function: SimFunction) -> Self {
        self.add(function);
        self
    }

    /// Register a BAR region for `addr`
    pub fn add_bar(&self, addr: PciAddress, bar: u8, region: Arc<SimMmio>) {
        self.with_state(|s| {
            s.bars.insert((addr, bar), region);
        });
    }

    /// Register a physical window at `base`
    pub fn add_physical(&self, base: u64, region: Arc<SimMmio>) {
        self.with_state(|s| {
            s.physical.insert(base, region);
        });
    }

    /// Script the response to a control call
    pub fn script_control(&self, request: ControlRequest, response: ControlResponse) {
        self.with_state(|s| {
            s.control.insert(request, response);
        });
    }

    /// Make every access to `offset` of `addr` fail
    pub fn fail_register(&self, addr: PciAddress, offset: u16, reason: &str) {
        self.with_state(|s| {
            s.failing.insert((addr, offset), reason.to_string());
        });
    }

    /// Set bits in a register as hardware would (bypasses RW1C)
    pub fn assert_bits(&self, addr: PciAddress, offset: u16, bits: u32) {
        self.with_state(|s| {
            if let Some(f) = s.functions.get_mut(&addr) {
                let v = f.get(offset);
                f.set(offset, v | bits);
                if offset == SIM_AER_CAP + aer::UE_STATUS {
                    f.update_first_error_pointer();
                }
            }
        });
    }

    /// Overwrite a register as hardware would
    pub fn poke(&self, addr: PciAddress, offset: u16, value: u32) {
        self.with_state(|s| {
            if let Some(f) = s.functions.get_mut(&addr) {
                f.set(offset, value);
            }
        });
    }

    /// Current register value without recording anything
    #[must_use]
    pub fn peek(&self, addr: PciAddress, offset: u16) -> u32 {
        self.with_state(|s| s.functions.get(&addr).map_or(0xFFFF_FFFF, |f| f.get(offset)))
    }

    /// Every config write so far
    #[must_use]
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.with_state(|s| s.writes.clone())
    }

    /// Config writes to one register of one function
    #[must_use]
    pub fn writes_to(&self, addr: PciAddress, offset: u16) -> Vec<u32> {
        self.with_state(|s| {
            s.writes
                .iter()
                .filter(|w| w.addr == addr && w.offset == offset)
                .map(|w| w.value)
                .collect()
        })
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.with_state(|s| s.writes.clear());
    }

    /// Control calls issued so far
    #[must_use]
    pub fn control_calls(&self) -> Vec<ControlRequest> {
        self.with_state(|s| s.control_calls.clone())
    }

    /// Number of successful BAR / physical mappings
    #[must_use]
    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }
}

impl Platform for SimPlatform {
    fn enumerate(&self) -> Result<Vec<PciAddress>> {
        Ok(self.state()?.functions.keys().copied().collect())
    }

    fn config_read(&self, addr: PciAddress, offset: u16) -> Result<u32> {
        let state = self.state()?;
        if let Some(reason) = state.failing.get(&(addr, offset)) {
            return Err(PexError::register_access(addr, offset, reason.clone()));
        }
        if offset % 4 != 0 || offset >= config::EXTENDED_SIZE {
            return Err(PexError::register_access(addr, offset, "unaligned or out of range"));
        }
        // absent functions read as all ones, like a master abort
        Ok(state.functions.get(&addr).map_or(0xFFFF_FFFF, |f| f.get(offset)))
    }

    fn config_write(&self, addr: PciAddress, offset: u16, value: u32) -> Result<()> {
        let mut state = self.state()?;
        if let Some(reason) = state.failing.get(&(addr, offset)) {
            return Err(PexError::register_access(addr, offset, reason.clone()));
        }
        if offset % 4 != 0 || offset >= config::EXTENDED_SIZE {
            return Err(PexError::register_access(addr, offset, "unaligned or out of range"));
        }
        let function = state
            .functions
            .get_mut(&addr)
            .ok_or_else(|| PexError::register_access(addr, offset, "no such function"))?;
        function.write(offset, value);
        state.writes.push(RecordedWrite { addr, offset, value });
        Ok(())
    }

    fn map_bar(&self, addr: PciAddress, bar: u8) -> Result<Arc<dyn Mmio>> {
        let state = self.state()?;
        let region = state
            .bars
            .get(&(addr, bar))
            .cloned()
            .ok_or_else(|| PexError::map_failed(format!("{addr}: BAR{bar} not simulated")))?;
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        Ok(region)
    }

    fn map_physical(&self, base: u64, size: usize) -> Result<Arc<dyn Mmio>> {
        let state = self.state()?;
        let region = state
            .physical
            .get(&base)
            .cloned()
            .ok_or_else(|| PexError::map_failed(format!("physical {base:#x} not simulated")))?;
        if region.size() < size {
            return Err(PexError::map_failed(format!(
                "physical {base:#x}: {size:#x} bytes requested, {:#x} simulated",
                region.size()
            )));
        }
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        Ok(region)
    }

    fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
        let mut state = self.state()?;
        state.control_calls.push(request);
        state
            .control
            .get(&request)
            .copied()
            .ok_or_else(|| PexError::unsupported(format!("control call {request:?} not scripted")))
    }
}
