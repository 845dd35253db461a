// SPDX-License-Identifier: AGPL-3.0-only

//! Background error collector
//!
//! One worker thread per manager. It wakes on the configured period (or an
//! explicit [`Collector::wake`]) and runs the flag-path drain on every
//! located port, so sticky counts stay correct without foreground polling.
//!
//! A [`CollectorPause`] lease suspends passes while held; leases nest.
//! Shutdown is cooperative: end flag, wake, join.

use crate::access::RegisterAccess;
use crate::error::{PexError, Result};
use crate::error_counts::drain_flags;
use crate::family::Family;
use crate::port::Port;
use crate::settings::Settings;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// A port the collector drains, with the family selecting its status register
#[derive(Debug, Clone)]
pub struct DrainTarget {
    /// Port to drain
    pub port: Arc<Port>,
    /// Family of the owning device
    pub family: Family,
}

#[derive(Debug, Default)]
struct Shared {
    woken: Mutex<bool>,
    signal: Condvar,
    end: AtomicBool,
    pauses: AtomicUsize,
    passes: AtomicU64,
}

impl Shared {
    fn notify(&self) {
        match self.woken.lock() {
            Ok(mut w) => *w = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        self.signal.notify_all();
    }
}

/// Scoped pause; passes resume when every lease is dropped
#[derive(Debug)]
#[must_use = "the collector resumes as soon as the lease is dropped"]
pub struct CollectorPause {
    shared: Arc<Shared>,
}

impl Drop for CollectorPause {
    fn drop(&mut self) {
        if self.shared.pauses.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!("collector resumed");
        }
    }
}

/// Periodic flag drain thread
#[derive(Debug, Default)]
pub struct Collector {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Idle collector; nothing runs until [`Collector::start`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker; a second call while running is a no-op
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub fn start(&self, targets: Vec<DrainTarget>, access: RegisterAccess, settings: Arc<Settings>) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| PexError::invalid_state("collector state poisoned"))?;
        if worker.is_some() {
            return Ok(());
        }

        self.shared.end.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let count = targets.len();
        let handle = thread::Builder::new()
            .name("pexfab-collector".into())
            .spawn(move || run(&shared, &targets, &access, &settings))?;
        *worker = Some(handle);

        tracing::info!("Collector started ({count} ports)");
        Ok(())
    }

    /// Stop and join the worker
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the worker panicked.
    pub fn stop(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .map_err(|_| PexError::invalid_state("collector state poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        self.shared.end.store(true, Ordering::Release);
        self.shared.notify();
        handle
            .join()
            .map_err(|_| PexError::invalid_state("collector thread panicked"))?;
        tracing::info!("Collector stopped");
        Ok(())
    }

    /// Run a pass now instead of waiting for the period
    pub fn wake(&self) {
        self.shared.notify();
    }

    /// Suspend passes until the lease is dropped
    pub fn pause(&self) -> CollectorPause {
        self.shared.pauses.fetch_add(1, Ordering::AcqRel);
        CollectorPause {
            shared: Arc::clone(&self.shared),
        }
    }

    /// At least one pause lease is held
    pub fn is_paused(&self) -> bool {
        self.shared.pauses.load(Ordering::Acquire) > 0
    }

    /// Worker thread is alive
    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Completed (non-skipped) passes since creation
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Acquire)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("collector shutdown: {e}");
        }
    }
}

fn run(shared: &Shared, targets: &[DrainTarget], access: &RegisterAccess, settings: &Settings) {
    loop {
        let Ok(guard) = shared.woken.lock() else {
            tracing::error!("collector wake state poisoned, exiting");
            return;
        };
        let wait = shared.signal.wait_timeout_while(guard, settings.collector_period(), |woken| {
            !*woken && !shared.end.load(Ordering::Acquire)
        });
        match wait {
            Ok((mut woken, _)) => *woken = false,
            Err(_) => {
                tracing::error!("collector wake state poisoned, exiting");
                return;
            }
        }

        if shared.end.load(Ordering::Acquire) {
            return;
        }
        if shared.pauses.load(Ordering::Acquire) > 0 {
            tracing::trace!("collector paused, pass skipped");
            continue;
        }

        for target in targets.iter().filter(|t| t.port.is_located()) {
            if let Err(e) = drain_flags(access, &target.port, target.family, settings) {
                tracing::warn!("{}: drain failed: {e}", target.port.addr());
            }
        }
        shared.passes.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{PciAddress, PciId};
    use crate::counters::Counter;
    use crate::platform::sim::SIM_PCIE_CAP;
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::{self, port_type};
    use std::time::{Duration, Instant};

    const ADDR: PciAddress = PciAddress::new(0, 2, 0, 0);
    const STATUS: u16 = SIM_PCIE_CAP + express::DEVICE_CTL_STA;
    const UR: u32 = express::device::STA_UNSUPPORTED << express::device::STATUS_SHIFT;

    fn setup() -> (Arc<SimPlatform>, Arc<Port>, RegisterAccess) {
        let sim = Arc::new(SimPlatform::new().with(SimFunction::bridge(
            ADDR,
            PciId::new(0x1234, 0x0001),
            port_type::DOWNSTREAM,
            1,
            2,
            2,
        )));
        let port = Arc::new(Port::scan(sim.as_ref(), ADDR).unwrap());
        port.set_located();
        let access = RegisterAccess::new(sim.clone());
        (sim, port, access)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn settings() -> Arc<Settings> {
        let s = Settings::default();
        s.set_collector_period(Duration::from_millis(20));
        Arc::new(s)
    }

    #[test]
    fn drains_located_ports() {
        let (sim, port, access) = setup();
        sim.assert_bits(ADDR, STATUS, UR);

        let collector = Collector::new();
        let target = DrainTarget { port: port.clone(), family: Family::Generic };
        collector.start(vec![target], access, settings()).unwrap();
        collector.wake();

        assert!(wait_for(|| port.peek_sticky()[Counter::UnsupportedRequest.index()] == 1));
        assert_eq!(sim.peek(ADDR, STATUS) & UR, 0);
        collector.stop().unwrap();
        assert!(!collector.is_running());
    }

    #[test]
    fn pause_lease_skips_passes() {
        let (sim, port, access) = setup();
        let collector = Collector::new();
        let target = DrainTarget { port: port.clone(), family: Family::Generic };

        let lease = collector.pause();
        let nested = collector.pause();
        collector.start(vec![target], access, settings()).unwrap();
        sim.assert_bits(ADDR, STATUS, UR);
        collector.wake();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(collector.passes(), 0);
        assert_eq!(port.peek_sticky(), [0; 4]);

        drop(lease);
        assert!(collector.is_paused());
        drop(nested);
        assert!(!collector.is_paused());

        collector.wake();
        assert!(wait_for(|| collector.passes() > 0));
        assert!(wait_for(|| port.peek_sticky()[Counter::UnsupportedRequest.index()] == 1));
    }

    #[test]
    fn start_twice_and_stop_idle() {
        let (_sim, port, access) = setup();
        let collector = Collector::new();
        collector.stop().unwrap();
        let target = DrainTarget { port, family: Family::Generic };
        collector.start(vec![target.clone()], access.clone(), settings()).unwrap();
        collector.start(vec![target], access, settings()).unwrap();
        assert!(collector.is_running());
        collector.stop().unwrap();
    }
}
