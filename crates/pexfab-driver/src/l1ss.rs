// SPDX-License-Identifier: AGPL-3.0-only

//! L1 PM substate sequencing across one link
//!
//! The two ends of a link must never disagree in a way the link partner
//! cannot follow. Enables reach the upstream side first; disables reach the
//! downstream side first. L1.2 threshold fields are only touched while L1.2
//! is off on that port.
//!
//! ```text
//! 1. downstream side: drop removed bits, always drop L1.2
//! 2. upstream side:   drop removed bits
//! 3. L1.2 newly on, thresholds unprogrammed: program both sides
//! 4. upstream side:   target bits
//! 5. downstream side: target bits
//! ```
//!
//! Writes that would not change a register are skipped.

use crate::access::RegisterAccess;
use crate::error::{PexError, Result};
use crate::link::L1ssState;
use crate::port::Port;
use pexfab_regs::l1ss::{self, defaults};
use pexfab_regs::{field, with_field};

/// Requested substate enables for one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L1ssRequest {
    /// ASPM L1.1 / L1.2 enables
    pub aspm: L1ssState,
    /// PCI-PM enables; `None` keeps whatever each side has now
    pub pcipm: Option<L1ssState>,
}

impl L1ssRequest {
    /// ASPM substates only, PCI-PM untouched
    pub const fn aspm(aspm: L1ssState) -> Self {
        Self { aspm, pcipm: None }
    }

    /// Exact enables for both mechanisms
    pub const fn exact(state: L1ssState) -> Self {
        Self {
            aspm: state.aspm(),
            pcipm: Some(state.pcipm()),
        }
    }

    fn target(self, current: L1ssState) -> L1ssState {
        self.aspm
            .aspm()
            .union(self.pcipm.map_or(current.pcipm(), L1ssState::pcipm))
    }
}

/// One end of a link with its L1SS capability offset
struct End<'a> {
    port: &'a Port,
    base: u16,
}

impl<'a> End<'a> {
    fn new(port: &'a Port) -> Result<Self> {
        let base = port.caps().l1ss;
        if base == 0 {
            return Err(PexError::missing_capability(port.addr(), "L1 PM Substates"));
        }
        Ok(Self { port, base })
    }

    fn ctl1(&self, access: &RegisterAccess) -> Result<u32> {
        access.read(self.port, self.base + l1ss::CTL1)
    }

    fn supported(&self, access: &RegisterAccess) -> Result<L1ssState> {
        let caps = access.read(self.port, self.base + l1ss::CAPS)?;
        if caps & l1ss::CAP_SUBSTATES == 0 {
            return Ok(L1ssState::NONE);
        }
        Ok(L1ssState::from_bits(caps))
    }

    /// Set the enable bits to `state`, leaving threshold fields alone
    fn set(&self, access: &RegisterAccess, state: L1ssState, side: &str) -> Result<()> {
        let old = self.ctl1(access)?;
        let new = access.modify(self.port, self.base + l1ss::CTL1, l1ss::ENABLE_MASK, state.bits(), 0)?;
        if new != old {
            tracing::debug!(
                "{} ({side}): L1SS {} -> {}",
                self.port.addr(),
                L1ssState::from_bits(old),
                state
            );
        }
        Ok(())
    }

    fn thresholds_unset(&self, access: &RegisterAccess) -> Result<bool> {
        let ctl1 = self.ctl1(access)?;
        Ok(field(ctl1, l1ss::CTL1_THRESHOLD_VALUE_LO, l1ss::CTL1_THRESHOLD_VALUE_BITS) == 0
            && field(ctl1, l1ss::CTL1_THRESHOLD_SCALE_LO, l1ss::CTL1_THRESHOLD_SCALE_BITS) == 0)
    }

    fn program_thresholds(&self, access: &RegisterAccess, common_mode: bool) -> Result<()> {
        let ctl2_reg = self.base + l1ss::CTL2;
        let ctl2 = access.read(self.port, ctl2_reg)?;
        let ctl2 = with_field(
            ctl2,
            l1ss::CTL2_POWER_ON_SCALE_LO,
            l1ss::CTL2_POWER_ON_SCALE_BITS,
            defaults::POWER_ON_SCALE,
        );
        let ctl2 = with_field(
            ctl2,
            l1ss::CTL2_POWER_ON_VALUE_LO,
            l1ss::CTL2_POWER_ON_VALUE_BITS,
            defaults::POWER_ON_VALUE,
        );
        access.write(self.port, ctl2_reg, ctl2)?;

        let ctl1_reg = self.base + l1ss::CTL1;
        let mut ctl1 = access.read(self.port, ctl1_reg)?;
        ctl1 = with_field(
            ctl1,
            l1ss::CTL1_THRESHOLD_VALUE_LO,
            l1ss::CTL1_THRESHOLD_VALUE_BITS,
            defaults::THRESHOLD_VALUE,
        );
        ctl1 = with_field(
            ctl1,
            l1ss::CTL1_THRESHOLD_SCALE_LO,
            l1ss::CTL1_THRESHOLD_SCALE_BITS,
            defaults::THRESHOLD_SCALE,
        );
        if common_mode {
            ctl1 = with_field(
                ctl1,
                l1ss::CTL1_CM_RESTORE_LO,
                l1ss::CTL1_CM_RESTORE_BITS,
                defaults::CM_RESTORE_US,
            );
        }
        access.write(self.port, ctl1_reg, ctl1)?;
        tracing::debug!("{}: L1.2 thresholds programmed", self.port.addr());
        Ok(())
    }
}

/// Apply `request` to the link between `upstream` and `downstream`
///
/// `upstream` is the bridge's downstream-facing port, `downstream` the
/// port of the device below it. Returns the state left on the downstream
/// side.
///
/// # Errors
///
/// Returns `MissingCapability` if either end lacks L1 PM substates and
/// `CapabilityMismatch` if the target exceeds what both ends support; both
/// are reported before any write.
pub fn apply(
    access: &RegisterAccess,
    upstream: &Port,
    downstream: &Port,
    request: L1ssRequest,
) -> Result<L1ssState> {
    let up = End::new(upstream)?;
    let down = End::new(downstream)?;

    let up_now = L1ssState::from_bits(up.ctl1(access)?);
    let down_now = L1ssState::from_bits(down.ctl1(access)?);
    let up_target = request.target(up_now);
    let down_target = request.target(down_now);

    let supported = up.supported(access)?.intersect(down.supported(access)?);
    let unsupported = up_target.union(down_target).difference(supported);
    if !unsupported.is_empty() {
        return Err(PexError::capability_mismatch(format!(
            "{} <-> {}: {unsupported} not supported on both ends",
            upstream.addr(),
            downstream.addr()
        )));
    }

    // Disable phase
    let l1_2 = L1ssState::from_bits(l1ss::L1_2_MASK);
    down.set(access, down_now.intersect(down_target).difference(l1_2), "downstream")?;
    up.set(access, up_now.intersect(up_target), "upstream")?;

    if down_target.has_l1_2() && !(up_now.has_l1_2() && down_now.has_l1_2()) {
        if !up_now.has_l1_2() && up.thresholds_unset(access)? {
            up.program_thresholds(access, true)?;
        }
        if down.thresholds_unset(access)? {
            down.program_thresholds(access, false)?;
        }
    }

    // Enable phase
    up.set(access, up_target, "upstream")?;
    down.set(access, down_target, "downstream")?;

    Ok(down_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{PciAddress, PciId};
    use crate::platform::sim::SIM_L1SS_CAP;
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::port_type;
    use std::sync::Arc;

    const UP: PciAddress = PciAddress::new(0, 2, 0, 0);
    const DOWN: PciAddress = PciAddress::new(0, 3, 0, 0);
    const CTL1: u16 = SIM_L1SS_CAP + l1ss::CTL1;
    const CTL2: u16 = SIM_L1SS_CAP + l1ss::CTL2;

    fn link(up_caps: u32, down_caps: u32) -> (Arc<SimPlatform>, RegisterAccess, Port, Port) {
        let sim = Arc::new(
            SimPlatform::new()
                .with(
                    SimFunction::bridge(UP, PciId::new(0x10B5, 0x8747), port_type::DOWNSTREAM, 2, 3, 3)
                        .with_l1ss(up_caps),
                )
                .with(SimFunction::endpoint(DOWN, PciId::new(0x10DE, 0x2204), 0x03_0000).with_l1ss(down_caps)),
        );
        let up = Port::scan(sim.as_ref(), UP).unwrap();
        let down = Port::scan(sim.as_ref(), DOWN).unwrap();
        (sim.clone(), RegisterAccess::new(sim), up, down)
    }

    fn ctl1_writes(sim: &SimPlatform) -> Vec<(PciAddress, u32)> {
        sim.writes()
            .into_iter()
            .filter(|w| w.offset == CTL1)
            .map(|w| (w.addr, w.value & l1ss::ENABLE_MASK))
            .collect()
    }

    #[test]
    fn enable_reaches_upstream_first() {
        let (sim, access, up, down) = link(0xF, 0xF);
        apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_L1_1)).unwrap();
        let writes = ctl1_writes(&sim);
        assert_eq!(
            writes,
            vec![(UP, l1ss::ASPM_L1_1), (DOWN, l1ss::ASPM_L1_1)]
        );
    }

    #[test]
    fn disable_reaches_downstream_first() {
        let (sim, access, up, down) = link(0xF, 0xF);
        sim.poke(UP, CTL1, l1ss::ASPM_L1_1);
        sim.poke(DOWN, CTL1, l1ss::ASPM_L1_1);
        apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::NONE)).unwrap();
        assert_eq!(ctl1_writes(&sim), vec![(DOWN, 0), (UP, 0)]);
    }

    #[test]
    fn downstream_never_ahead_of_upstream() {
        let (sim, access, up, down) = link(0xF, 0xF);
        sim.poke(UP, CTL1, l1ss::ASPM_L1_1);
        sim.poke(DOWN, CTL1, l1ss::ASPM_L1_1);
        apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_ALL)).unwrap();

        let mut up_bits = l1ss::ASPM_L1_1;
        let mut down_bits = l1ss::ASPM_L1_1;
        for (addr, bits) in ctl1_writes(&sim) {
            if addr == UP {
                up_bits = bits;
            } else {
                down_bits = bits;
            }
            assert_eq!(down_bits & !up_bits, 0, "downstream {down_bits:#x} ahead of upstream {up_bits:#x}");
        }
        assert_eq!(up_bits, l1ss::ASPM_MASK);
        assert_eq!(down_bits, l1ss::ASPM_MASK);
    }

    #[test]
    fn new_l1_2_programs_default_thresholds() {
        let (sim, access, up, down) = link(0xF, 0xF);
        apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_ALL)).unwrap();

        let up_ctl1 = sim.peek(UP, CTL1);
        assert_eq!(field(up_ctl1, l1ss::CTL1_THRESHOLD_VALUE_LO, 10), defaults::THRESHOLD_VALUE);
        assert_eq!(field(up_ctl1, l1ss::CTL1_THRESHOLD_SCALE_LO, 3), defaults::THRESHOLD_SCALE);
        assert_eq!(field(up_ctl1, l1ss::CTL1_CM_RESTORE_LO, 8), defaults::CM_RESTORE_US);

        let down_ctl1 = sim.peek(DOWN, CTL1);
        assert_eq!(field(down_ctl1, l1ss::CTL1_CM_RESTORE_LO, 8), 0);
        assert_eq!(field(sim.peek(DOWN, CTL2), l1ss::CTL2_POWER_ON_VALUE_LO, 5), defaults::POWER_ON_VALUE);
    }

    #[test]
    fn programmed_thresholds_are_kept() {
        let (sim, access, up, down) = link(0xF, 0xF);
        let existing = with_field(0, l1ss::CTL1_THRESHOLD_VALUE_LO, 10, 0x40);
        sim.poke(UP, CTL1, existing);
        apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_ALL)).unwrap();
        assert_eq!(field(sim.peek(UP, CTL1), l1ss::CTL1_THRESHOLD_VALUE_LO, 10), 0x40);
    }

    #[test]
    fn pcipm_bits_survive_aspm_only_request() {
        let (sim, access, up, down) = link(0xF, 0xF);
        sim.poke(UP, CTL1, l1ss::PCIPM_L1_1);
        sim.poke(DOWN, CTL1, l1ss::PCIPM_L1_1);
        let state = apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_L1_1)).unwrap();
        assert_eq!(state.bits(), l1ss::PCIPM_L1_1 | l1ss::ASPM_L1_1);
        assert_eq!(sim.peek(DOWN, CTL1) & l1ss::ENABLE_MASK, l1ss::PCIPM_L1_1 | l1ss::ASPM_L1_1);
    }

    #[test]
    fn unsupported_target_writes_nothing() {
        // downstream end has no L1.2
        let (sim, access, up, down) = link(0xF, l1ss::ASPM_L1_1 | l1ss::PCIPM_L1_1);
        sim.clear_writes();
        let err = apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_ALL)).unwrap_err();
        assert!(matches!(err, PexError::CapabilityMismatch { .. }));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn missing_capability_on_either_end() {
        let sim = Arc::new(
            SimPlatform::new()
                .with(SimFunction::bridge(UP, PciId::new(0x10B5, 0x8747), port_type::DOWNSTREAM, 2, 3, 3))
                .with(SimFunction::endpoint(DOWN, PciId::new(0x10DE, 0x2204), 0x03_0000).with_l1ss(0xF)),
        );
        let up = Port::scan(sim.as_ref(), UP).unwrap();
        let down = Port::scan(sim.as_ref(), DOWN).unwrap();
        let access = RegisterAccess::new(sim);
        assert!(matches!(
            apply(&access, &up, &down, L1ssRequest::aspm(L1ssState::ASPM_L1_1)),
            Err(PexError::MissingCapability { .. })
        ));
    }
}
