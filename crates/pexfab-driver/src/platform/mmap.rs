// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped register windows
//!
//! Backs [`Mmio`] with a `MAP_SHARED` mapping of either a sysfs
//! `resourceN` file (a function's BAR) or `/dev/mem` (a physical range
//! reported by a control call). `rustix` provides the mmap/munmap calls.

use super::Mmio;
use crate::error::{PexError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;

/// Memory-mapped register window
///
/// Provides bounds-checked volatile 32-bit access to mapped hardware.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    label: String,
}

impl MmapRegion {
    /// Map a whole sysfs BAR resource file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened, is empty, or mmap fails.
    pub fn open_resource(path: &Path) -> Result<Self> {
        let file = Self::open_rw(path)?;

        // BAR sizes fit in usize on 64-bit targets
        #[allow(clippy::cast_possible_truncation)]
        let size = file
            .metadata()
            .map_err(|e| PexError::map_failed(format!("Cannot stat {}: {e}", path.display())))?
            .len() as usize;

        if size == 0 {
            return Err(PexError::map_failed(format!(
                "{} has size 0 (BAR not implemented or device disabled)",
                path.display()
            )));
        }

        Self::map(file, 0, size, path.display().to_string())
    }

    /// Map `size` bytes of physical memory at `base` through `/dev/mem`
    ///
    /// # Errors
    ///
    /// Returns error if `/dev/mem` cannot be opened or mmap fails.
    pub fn open_physical(base: u64, size: usize) -> Result<Self> {
        let file = Self::open_rw(Path::new("/dev/mem"))?;
        Self::map(file, base, size, format!("phys {base:#x}"))
    }

    fn open_rw(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PexError::map_failed(format!("Cannot open {}: {e}", path.display())))
    }

    fn map(file: File, offset: u64, size: usize, label: String) -> Result<Self> {
        tracing::debug!("Mapping {label} ({size:#x} bytes)");

        // SAFETY: mmap of a device file:
        // - file descriptor is valid (opened above and kept in the struct)
        // - size is non-zero and comes from the resource file or the caller's window
        // - MAP_SHARED so writes reach the device; unmapped in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| PexError::map_failed(format!("mmap of {label} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| PexError::map_failed(format!("mmap of {label} returned null")))?;

        tracing::info!("Mapped {label} at {ptr:p}, size={size:#x}");

        Ok(Self {
            ptr,
            size,
            _file: file,
            label,
        })
    }

    fn check(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset + 4 > self.size {
            return Err(PexError::map_failed(format!(
                "{}: access at {offset:#x} outside window of {:#x} bytes",
                self.label, self.size
            )));
        }
        Ok(())
    }
}

impl Mmio for MmapRegion {
    fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;

        // SAFETY: volatile read from mapped hardware:
        // - offset + 4 <= size and offset is 4-byte aligned (checked above)
        // - ptr is valid for the lifetime of self (from successful mmap)
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("{}: read {offset:#x} = {value:#010x}", self.label);
        Ok(value)
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;

        tracing::trace!("{}: write {offset:#x} = {value:#010x}", self.label);

        // SAFETY: volatile write to mapped hardware:
        // - offset + 4 <= size and offset is 4-byte aligned (checked above)
        // - ptr is valid for the lifetime of self (from successful mmap)
        // - registers are side-effecting; volatile keeps the write in program order
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {}", self.label);

        // SAFETY: ptr/size are exactly what mmap returned in map(); Drop runs once
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap of {} failed: {e}", self.label);
            }
        }
    }
}

// SAFETY: Send - the mapping is process-wide and owned exclusively by this value.
unsafe impl Send for MmapRegion {}

// SAFETY: Sync - every access is a single bounds-checked volatile 32-bit
// load or store; callers serialise read-modify-write sequences per port.
unsafe impl Sync for MmapRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_a_regular_file_and_bounds_checks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 64]).unwrap();
        tmp.flush().unwrap();

        let region = MmapRegion::open_resource(tmp.path()).unwrap();
        assert_eq!(region.size(), 64);
        region.write_u32(8, 0xDEAD_BEEF).unwrap();
        assert_eq!(region.read_u32(8).unwrap(), 0xDEAD_BEEF);
        assert!(region.read_u32(62).is_err());
        assert!(region.read_u32(64).is_err());
        assert!(region.write_u32(3, 0).is_err());
    }

    #[test]
    fn empty_resource_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            MmapRegion::open_resource(tmp.path()),
            Err(PexError::MapFailed { .. })
        ));
    }
}
