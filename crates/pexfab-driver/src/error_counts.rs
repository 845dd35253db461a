// SPDX-License-Identifier: AGPL-3.0-only

//! Error counter read paths
//!
//! **Flag path** (every port): read the DevCtl/DevSta dword, or the vendor
//! mirror for BR03/BR04, and turn each asserted error bit into one sticky
//! count. Before the bits are acknowledged the AER block can be captured,
//! and AER UE/CE status is cleared alongside.
//!
//! **Hardware path** (PLX only): receiver, bad-TLP and bad-DLLP counters
//! summed into the correctable slot, then reset.
//!
//! Both run under the port's error lock.

use crate::access::RegisterAccess;
use crate::aer::AerEntry;
use crate::counters::{Counter, CounterMask, ErrorCounters, ErrorSource};
use crate::error::Result;
use crate::family::Family;
use crate::port::Port;
use crate::settings::Settings;
use pexfab_regs::aer::{self, cap_ctl, BLOCK_DWORDS, MAX_UE_CLEAR_COUNT};
use pexfab_regs::express::device;
use std::time::SystemTime;

/// Drain the error flags of one port into its sticky counters
///
/// Returns the DevSta error bits found.
///
/// # Errors
///
/// Returns the first failed register access; counters are only bumped
/// after the status has been acknowledged.
pub fn drain_flags(
    access: &RegisterAccess,
    port: &Port,
    family: Family,
    settings: &Settings,
) -> Result<u32> {
    let Some(status_reg) = family.error_status_offset(port.caps()) else {
        return Ok(0);
    };

    let mut log = port.lock_errors()?;

    let dword = access.read(port, status_reg)?;
    let bits = (dword >> device::STATUS_SHIFT) & device::STA_ERRORS;
    if bits == 0 {
        return Ok(0);
    }

    let caps = *port.caps();
    if settings.aer_capture() && caps.has_aer() {
        let entry = capture_aer(access, port, bits)?;
        let capacity = settings.aer_capacity();
        if log.capacity() != capacity {
            log.set_capacity(capacity);
        }
        if !log.push(entry, settings.aer_policy()) {
            tracing::debug!("{}: AER log full, snapshot dropped", port.addr());
        }
    }

    // Control half written back unchanged; only the asserted bits are acknowledged
    access.write(port, status_reg, (dword & 0xFFFF) | (bits << device::STATUS_SHIFT))?;

    if caps.has_aer() {
        clear_uncorrectable(access, port, caps.aer)?;
        let ce_reg = caps.aer + aer::CE_STATUS;
        let ce = access.read(port, ce_reg)?;
        if ce != 0 {
            access.write(port, ce_reg, ce)?;
        }
    }

    for (bit, counter) in [
        (device::STA_CORRECTABLE, Counter::Correctable),
        (device::STA_NON_FATAL, Counter::NonFatal),
        (device::STA_FATAL, Counter::Fatal),
        (device::STA_UNSUPPORTED, Counter::UnsupportedRequest),
    ] {
        if bits & bit != 0 {
            port.add_sticky(counter, 1);
        }
    }

    if settings.verbose() {
        tracing::info!("{}: error status {bits:#x} drained", port.addr());
    } else {
        tracing::debug!("{}: error status {bits:#x} drained", port.addr());
    }

    Ok(bits)
}

fn capture_aer(access: &RegisterAccess, port: &Port, status: u32) -> Result<AerEntry> {
    let base = port.caps().aer;
    let mut block = [0u32; BLOCK_DWORDS];
    for (i, word) in (0u16..).zip(block.iter_mut()) {
        *word = access.read(port, base + i * 4)?;
    }
    Ok(AerEntry {
        status,
        block,
        captured_at: SystemTime::now(),
    })
}

/// Clear AER uncorrectable status
///
/// With multiple header recording on, each clear only retires the error
/// named by the first error pointer, so walk the pointer until it names a
/// bit outside the defined set or the clear bound is reached.
fn clear_uncorrectable(access: &RegisterAccess, port: &Port, aer_base: u16) -> Result<()> {
    let ue_reg = aer_base + aer::UE_STATUS;
    let ctl_reg = aer_base + aer::CAP_CTL;

    let ue = access.read(port, ue_reg)?;
    if ue == 0 {
        return Ok(());
    }

    let ctl = access.read(port, ctl_reg)?;
    let multi_header = cap_ctl::MULTI_HEADER_CAPABLE | cap_ctl::MULTI_HEADER_ENABLE;
    if ctl & multi_header != multi_header {
        return access.write(port, ue_reg, ue);
    }

    let mut ctl = ctl;
    for _ in 0..MAX_UE_CLEAR_COUNT {
        let bit = 1u32 << (ctl & cap_ctl::FIRST_ERROR_POINTER_MASK);
        if bit & aer::ue::VALID == 0 {
            return Ok(());
        }
        access.write(port, ue_reg, bit)?;
        ctl = access.read(port, ctl_reg)?;
    }

    tracing::warn!(
        "{}: UE status still pending after {MAX_UE_CLEAR_COUNT} clears",
        port.addr()
    );
    Ok(())
}

/// Read error counts from the sources `source` selects
///
/// Sticky counts are consumed: a second call returns only what happened
/// in between.
///
/// # Errors
///
/// Returns the first failed register access.
pub fn read_counts(
    access: &RegisterAccess,
    port: &Port,
    family: Family,
    settings: &Settings,
    source: ErrorSource,
) -> Result<ErrorCounters> {
    let mut out = ErrorCounters::new();

    if source.uses_flags() {
        drain_flags(access, port, family, settings)?;
        for (counter, n) in Counter::BASIC.into_iter().zip(port.take_sticky()) {
            out.add(counter, n);
        }
        out.threshold |= CounterMask::BASIC;
    }

    if source.uses_hardware() && !settings.skip_hw_counters() {
        if let Some(helper) = port.hw_counters() {
            let _guard = port.lock_errors()?;
            let hw = helper.read_and_reset(port.port_number())?;
            out.add(Counter::Correctable, hw.correctable());
            out.add(Counter::Receiver, u64::from(hw.receiver));
            out.add(Counter::BadTlp, u64::from(hw.bad_tlp));
            out.add(Counter::BadDllp, u64::from(hw.bad_dllp));
            let hw_mask = CounterMask::of(Counter::Correctable)
                .with(Counter::Receiver)
                .with(Counter::BadTlp)
                .with(Counter::BadDllp);
            out.hw |= hw_mask;
            out.threshold |= hw_mask;
        }
    }

    Ok(out)
}

/// Discard every pending count of a port
///
/// # Errors
///
/// Returns the first failed register access.
pub fn reset_counts(
    access: &RegisterAccess,
    port: &Port,
    family: Family,
    settings: &Settings,
) -> Result<()> {
    read_counts(access, port, family, settings, ErrorSource::Combined).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{PciAddress, PciId};
    use crate::family::PlxGeneration;
    use crate::hwcounter::HwCounterHelper;
    use crate::platform::sim::{SIM_AER_CAP, SIM_PCIE_CAP};
    use crate::platform::{SimFunction, SimMmio, SimPlatform};
    use pexfab_regs::express::{port_type, DEVICE_CTL_STA};
    use pexfab_regs::vendor;
    use std::sync::Arc;

    const ADDR: PciAddress = PciAddress::new(0, 2, 0, 0);
    const DEVSTA: u16 = SIM_PCIE_CAP + DEVICE_CTL_STA;

    fn setup(f: SimFunction) -> (Arc<SimPlatform>, RegisterAccess, Port) {
        let sim = Arc::new(SimPlatform::new().with(f));
        let access = RegisterAccess::new(sim.clone());
        let port = Port::scan(sim.as_ref(), ADDR).unwrap();
        (sim, access, port)
    }

    fn plx_downstream() -> SimFunction {
        SimFunction::bridge(ADDR, PciId::new(0x10B5, 0x8747), port_type::DOWNSTREAM, 1, 2, 2)
    }

    #[test]
    fn unsupported_request_twice_counts_two() {
        let (sim, access, port) = setup(plx_downstream());
        let settings = Settings::default();
        let family = Family::Generic;

        for _ in 0..2 {
            sim.assert_bits(ADDR, DEVSTA, device::STA_UNSUPPORTED << 16);
            drain_flags(&access, &port, family, &settings).unwrap();
        }

        let counts = read_counts(&access, &port, family, &settings, ErrorSource::FlagOnly).unwrap();
        assert_eq!(counts.get(Counter::UnsupportedRequest), 2);
        assert_eq!(counts.get(Counter::Correctable), 0);
        assert_eq!(counts.get(Counter::NonFatal), 0);
        assert_eq!(counts.get(Counter::Fatal), 0);
        assert_eq!(sim.peek(ADDR, DEVSTA) >> 16, 0);
    }

    #[test]
    fn counts_are_consumed_by_reading() {
        let (sim, access, port) = setup(plx_downstream());
        let settings = Settings::default();
        sim.assert_bits(ADDR, DEVSTA, device::STA_CORRECTABLE << 16);
        let first = read_counts(&access, &port, Family::Generic, &settings, ErrorSource::FlagOnly).unwrap();
        let second = read_counts(&access, &port, Family::Generic, &settings, ErrorSource::FlagOnly).unwrap();
        assert_eq!(first.get(Counter::Correctable), 1);
        assert_eq!(second.get(Counter::Correctable), 0);
    }

    #[test]
    fn control_bits_survive_acknowledge() {
        let (sim, access, port) = setup(plx_downstream().with_register(DEVSTA, 0x000F));
        sim.assert_bits(ADDR, DEVSTA, device::STA_FATAL << 16);
        drain_flags(&access, &port, Family::Generic, &Settings::default()).unwrap();
        assert_eq!(sim.peek(ADDR, DEVSTA), 0x000F);
    }

    #[test]
    fn br04_uses_vendor_mirror() {
        let (sim, access, port) = setup(plx_downstream());
        sim.assert_bits(ADDR, vendor::br04::ERROR_CTL_STA, device::STA_NON_FATAL << 16);
        let bits = drain_flags(&access, &port, Family::Br04, &Settings::default()).unwrap();
        assert_eq!(bits, device::STA_NON_FATAL);
        assert_eq!(sim.writes_to(ADDR, vendor::br04::ERROR_CTL_STA).len(), 1);
    }

    #[test]
    fn captures_aer_and_walks_first_error_pointer() {
        let (sim, access, port) = setup(plx_downstream().with_aer(true));
        let ue = SIM_AER_CAP + aer::UE_STATUS;
        sim.assert_bits(ADDR, ue, aer::ue::POISONED_TLP | aer::ue::COMPLETION_TIMEOUT);
        sim.assert_bits(ADDR, DEVSTA, device::STA_NON_FATAL << 16);

        drain_flags(&access, &port, Family::Generic, &Settings::default()).unwrap();

        assert_eq!(
            sim.writes_to(ADDR, ue),
            vec![aer::ue::POISONED_TLP, aer::ue::COMPLETION_TIMEOUT]
        );
        assert_eq!(sim.peek(ADDR, ue), 0);
        let log = port.lock_errors().unwrap();
        assert_eq!(log.len(), 1);
        let entry = log.snapshot().remove(0);
        assert_eq!(entry.uncorrectable(), aer::ue::POISONED_TLP | aer::ue::COMPLETION_TIMEOUT);
    }

    #[test]
    fn stuck_uncorrectable_bit_stops_at_bound() {
        let ue = SIM_AER_CAP + aer::UE_STATUS;
        let (sim, access, port) =
            setup(plx_downstream().with_aer(true).with_latched(ue, aer::ue::MALFORMED_TLP));
        sim.assert_bits(ADDR, ue, 0);
        sim.assert_bits(ADDR, DEVSTA, device::STA_FATAL << 16);

        drain_flags(&access, &port, Family::Generic, &Settings::default()).unwrap();
        assert_eq!(sim.writes_to(ADDR, ue).len(), MAX_UE_CLEAR_COUNT as usize);
    }

    #[test]
    fn capture_disabled_keeps_log_empty() {
        let (sim, access, port) = setup(plx_downstream().with_aer(false));
        let settings = Settings::default();
        settings.set_aer_capture(false);
        sim.assert_bits(ADDR, DEVSTA, device::STA_CORRECTABLE << 16);
        drain_flags(&access, &port, Family::Generic, &settings).unwrap();
        assert!(port.lock_errors().unwrap().is_empty());
    }

    #[test]
    fn hardware_path_sums_into_correctable() {
        let (_sim, access, port) = setup(plx_downstream());
        let family = Family::Plx(PlxGeneration::Gen3);
        let bar = Arc::new(SimMmio::new(vendor::plx::PORT_STRIDE));
        bar.poke(vendor::plx::gen3::RECEIVER_ERRORS, 2);
        bar.poke(vendor::plx::BAD_TLP_COUNT, 1);
        port.set_hw_counters(Some(Arc::new(HwCounterHelper::new(
            bar,
            family.counter_layout().unwrap(),
        ))));

        let settings = Settings::default();
        let hw = read_counts(&access, &port, family, &settings, ErrorSource::HardwareOnly).unwrap();
        assert_eq!(hw.get(Counter::Correctable), 3);
        assert!(hw.hw.contains(Counter::Correctable));

        settings.set_skip_hw_counters(true);
        let skipped = read_counts(&access, &port, family, &settings, ErrorSource::HardwareOnly).unwrap();
        assert!(skipped.valid.is_empty());
    }
}
