// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware error counters (PLX / Broadcom switches)
//!
//! One helper per chip holds the BAR0 mapping and the generation's register
//! layout. Every port of the chip shares it; each port owns one slice of
//! `port_stride` bytes selected by its port number.

use crate::error::Result;
use crate::family::CounterLayout;
use crate::platform::Mmio;
use pexfab_regs::field;
use std::sync::Arc;

/// Raw counts read from one port slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwCounts {
    /// Receiver errors
    pub receiver: u32,
    /// Bad TLPs
    pub bad_tlp: u32,
    /// Bad DLLPs
    pub bad_dllp: u32,
}

impl HwCounts {
    /// Everything the correctable slot accumulates
    pub const fn correctable(&self) -> u64 {
        self.receiver as u64 + self.bad_tlp as u64 + self.bad_dllp as u64
    }
}

/// Counter access for one chip
#[derive(Debug)]
pub struct HwCounterHelper {
    region: Arc<dyn Mmio>,
    layout: CounterLayout,
}

impl HwCounterHelper {
    /// Helper over a mapped BAR0
    pub fn new(region: Arc<dyn Mmio>, layout: CounterLayout) -> Self {
        Self { region, layout }
    }

    /// Register layout
    pub const fn layout(&self) -> &CounterLayout {
        &self.layout
    }

    fn slice(&self, port_number: u8) -> usize {
        usize::from(port_number) * self.layout.port_stride
    }

    /// Read the counters of one port, then reset them
    ///
    /// The caller holds the port's error lock, so the read and the reset
    /// are not interleaved with another reader of the same port.
    ///
    /// # Errors
    ///
    /// Returns error if a register access falls outside the mapping.
    pub fn read_and_reset(&self, port_number: u8) -> Result<HwCounts> {
        let base = self.slice(port_number);
        let l = &self.layout;

        let raw = self.region.read_u32(base + l.receiver_errors)?;
        let counts = HwCounts {
            receiver: field(raw, l.count_lo, l.count_bits),
            bad_tlp: self.region.read_u32(base + l.bad_tlp)?,
            bad_dllp: self.region.read_u32(base + l.bad_dllp)?,
        };

        self.region.write_u32(base + l.receiver_errors, l.reset_value)?;
        self.region.write_u32(base + l.bad_tlp, 0)?;
        self.region.write_u32(base + l.bad_dllp, 0)?;

        if counts != HwCounts::default() {
            tracing::debug!(
                "hw counters port {port_number}: rx={} tlp={} dllp={}",
                counts.receiver,
                counts.bad_tlp,
                counts.bad_dllp
            );
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{Family, PlxGeneration};
    use crate::platform::SimMmio;
    use pexfab_regs::vendor::plx;

    #[test]
    fn gen3_layout_reads_low_byte_and_writes_zero() {
        let bar = Arc::new(SimMmio::new(plx::PORT_STRIDE * 4));
        let layout = Family::Plx(PlxGeneration::Gen3).counter_layout().unwrap();
        let base = 2 * plx::PORT_STRIDE;
        bar.poke(base + plx::gen3::RECEIVER_ERRORS, 0xAB05);
        bar.poke(base + plx::BAD_TLP_COUNT, 3);
        bar.poke(base + plx::BAD_DLLP_COUNT, 1);

        let helper = HwCounterHelper::new(bar.clone(), layout);
        let c = helper.read_and_reset(2).unwrap();
        assert_eq!(c, HwCounts { receiver: 5, bad_tlp: 3, bad_dllp: 1 });
        assert_eq!(c.correctable(), 9);
        assert_eq!(bar.peek(base + plx::gen3::RECEIVER_ERRORS), 0);
        assert_eq!(bar.peek(base + plx::BAD_TLP_COUNT), 0);
    }

    #[test]
    fn gen4_layout_reads_high_half_and_writes_reset_bit() {
        let bar = Arc::new(SimMmio::new(plx::PORT_STRIDE));
        let layout = Family::Plx(PlxGeneration::Gen4).counter_layout().unwrap();
        bar.poke(plx::gen4::RECEIVER_ERRORS, 0x0007_0000);

        let helper = HwCounterHelper::new(bar.clone(), layout);
        assert_eq!(helper.read_and_reset(0).unwrap().receiver, 7);
        assert!(bar
            .writes()
            .contains(&(plx::gen4::RECEIVER_ERRORS, plx::gen4::RESET_VALUE)));
    }
}
