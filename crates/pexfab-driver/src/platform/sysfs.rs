// SPDX-License-Identifier: AGPL-3.0-only

//! Linux sysfs platform
//!
//! Configuration cycles go through `/sys/bus/pci/devices/<addr>/config`
//! with positioned reads and writes; BARs are mapped from `resourceN`.
//! Full 4 KiB extended config space needs root (unprivileged readers see
//! only the first 64 bytes), which we report as a register access error.

use super::mmap::MmapRegion;
use super::{ControlRequest, ControlResponse, Mmio, Platform};
use crate::address::PciAddress;
use crate::error::{PexError, Result};
use crate::link::{Aspm, LinkSpeed};
use rustix::io::{pread, pwrite};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Platform backed by Linux sysfs
#[derive(Debug)]
pub struct SysfsPlatform {
    root: PathBuf,
    config_files: Mutex<HashMap<PciAddress, Arc<File>>>,
}

impl SysfsPlatform {
    /// Platform rooted at `/sys`
    pub fn new() -> Self {
        Self::with_root(DEFAULT_SYSFS_ROOT)
    }

    /// Platform rooted at an alternate sysfs tree (containers, tests)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_files: Mutex::new(HashMap::new()),
        }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    fn device_dir(&self, addr: PciAddress) -> PathBuf {
        self.devices_dir().join(addr.to_string())
    }

    fn config_file(&self, addr: PciAddress) -> Result<Arc<File>> {
        let mut files = self
            .config_files
            .lock()
            .map_err(|_| PexError::invalid_state("sysfs config cache poisoned"))?;

        if let Some(file) = files.get(&addr) {
            return Ok(Arc::clone(file));
        }

        let path = self.device_dir(addr).join("config");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|_| OpenOptions::new().read(true).open(&path))
            .map_err(|e| {
                PexError::register_access(addr, 0, format!("Cannot open {}: {e}", path.display()))
            })?;

        let file = Arc::new(file);
        files.insert(addr, Arc::clone(&file));
        Ok(file)
    }

    fn read_attr(&self, addr: PciAddress, attr: &str) -> Result<String> {
        let path = self.device_dir(addr).join(attr);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| PexError::not_found(format!("{}: {e}", path.display())))
    }

    /// First BAR start address from the `resource` table
    fn bar0_address(&self, addr: PciAddress) -> Result<u64> {
        let table = self.read_attr(addr, "resource")?;
        let first = table
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .ok_or_else(|| PexError::not_found(format!("{addr}: empty resource table")))?;

        let base = u64::from_str_radix(first.trim_start_matches("0x"), 16)
            .map_err(|e| PexError::not_found(format!("{addr}: bad resource entry: {e}")))?;

        if base == 0 {
            return Err(PexError::not_found(format!("{addr}: BAR0 not assigned")));
        }
        Ok(base)
    }

    fn aspm_policy(&self) -> Result<String> {
        let path = self.root.join("module/pcie_aspm/parameters/policy");
        std::fs::read_to_string(&path)
            .map_err(|e| PexError::unsupported(format!("{}: {e}", path.display())))
    }
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SysfsPlatform {
    fn enumerate(&self) -> Result<Vec<PciAddress>> {
        let dir = self.devices_dir();
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            PexError::not_found(format!("Cannot read PCI devices at {}: {e}", dir.display()))
        })?;

        let mut found: Vec<PciAddress> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();

        // Sort for consistent ordering
        found.sort();
        tracing::debug!("sysfs enumeration: {} functions", found.len());
        Ok(found)
    }

    fn config_read(&self, addr: PciAddress, offset: u16) -> Result<u32> {
        let file = self.config_file(addr)?;
        let mut buf = [0u8; 4];
        let n = pread(&*file, &mut buf, u64::from(offset))
            .map_err(|e| PexError::register_access(addr, offset, format!("pread: {e}")))?;
        if n != buf.len() {
            return Err(PexError::register_access(
                addr,
                offset,
                format!("short read ({n} bytes); extended config space needs root"),
            ));
        }
        let value = u32::from_le_bytes(buf);
        tracing::trace!("{addr} cfg read {offset:#05x} = {value:#010x}");
        Ok(value)
    }

    fn config_write(&self, addr: PciAddress, offset: u16, value: u32) -> Result<()> {
        let file = self.config_file(addr)?;
        tracing::trace!("{addr} cfg write {offset:#05x} = {value:#010x}");
        let n = pwrite(&*file, &value.to_le_bytes(), u64::from(offset))
            .map_err(|e| PexError::register_access(addr, offset, format!("pwrite: {e}")))?;
        if n != 4 {
            return Err(PexError::register_access(
                addr,
                offset,
                format!("short write ({n} bytes)"),
            ));
        }
        Ok(())
    }

    fn map_bar(&self, addr: PciAddress, bar: u8) -> Result<Arc<dyn Mmio>> {
        let path = self.device_dir(addr).join(format!("resource{bar}"));
        let region = MmapRegion::open_resource(&path)?;
        Ok(Arc::new(region))
    }

    fn map_physical(&self, base: u64, size: usize) -> Result<Arc<dyn Mmio>> {
        Ok(Arc::new(MmapRegion::open_physical(base, size)?))
    }

    fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::Bar0Address { addr } => {
                self.bar0_address(addr).map(ControlResponse::Address)
            }
            ControlRequest::GetUpstreamSpeed { addr } => {
                let text = self.read_attr(addr, "current_link_speed")?;
                LinkSpeed::from_sysfs(&text)
                    .map(ControlResponse::Speed)
                    .ok_or_else(|| PexError::unsupported(format!("{addr}: link speed '{text}'")))
            }
            ControlRequest::ChipsetAspm { addr } => {
                // "[performance]" means the OS keeps ASPM off on every link
                let policy = self.aspm_policy()?;
                if policy.contains("[performance]") {
                    tracing::debug!("{addr}: OS ASPM policy is performance");
                    Ok(ControlResponse::Aspm(Aspm::Disabled))
                } else {
                    Err(PexError::unsupported(format!(
                        "{addr}: chipset ASPM mask not reported by sysfs"
                    )))
                }
            }
            ControlRequest::SetUpstreamSpeed { addr, speed } => Err(PexError::unsupported(
                format!("{addr}: host-coordinated speed change to {speed} needs a kernel driver"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires hardware (and root for extended config space)
    fn enumerates_real_bus() {
        let platform = SysfsPlatform::new();
        let functions = platform.enumerate().unwrap();
        println!("Found {} PCI functions", functions.len());
        for addr in functions.iter().take(4) {
            let id = platform.config_read(*addr, 0).unwrap();
            println!("  {addr}: {id:#010x}");
        }
    }
}
