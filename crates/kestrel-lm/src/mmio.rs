//! Memory-mapped access to the VF's BAR0 mailbox.
//!
//! Maps a VFIO device region and exposes bounds-checked volatile register
//! accessors. rustix covers mmap/munmap; the region-info query stays on a
//! raw `libc::ioctl` because VFIO ioctls are kernel-specific.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{MigrationError, Result};

/// VFIO region info structure (`struct vfio_region_info`).
#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

// VFIO_DEVICE_GET_REGION_INFO = _IOWR(';', 100 + 8, struct vfio_region_info)
const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = 0xC018_3B68;

/// One mmap'd BAR region.
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
    index: u32,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("index", &self.index)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; mmap'd memory is
// process-wide and carries no thread-local state.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map BAR `index` of a VFIO device.
    ///
    /// # Errors
    ///
    /// Fails if the region-info ioctl or the mmap fails.
    pub fn map(device_fd: &File, index: u32) -> Result<Self> {
        let mut info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO fills `info` with the BAR's
        // size and mmap offset. Invariants: (1) device_fd is an open VFIO
        // device fd; (2) info.argsz/index initialized above; (3) struct
        // layout matches the kernel's vfio_region_info.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                VFIO_DEVICE_GET_REGION_INFO,
                std::ptr::addr_of_mut!(info),
            )
        };
        if ret < 0 {
            return Err(MigrationError::transport(format!(
                "BAR{index} region info failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::debug!(
            "mapping BAR{index}: size={:#x}, offset={:#x}",
            info.size,
            info.offset
        );

        // SAFETY: maps the BAR into our address space. Invariants:
        // (1) device_fd valid; (2) size/offset come from the successful
        // ioctl above; (3) the mapping is exclusive to us via VFIO;
        // (4) mmap returns a valid pointer for `size` bytes or an error.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                info.offset,
            )
            .map_err(|e| MigrationError::transport(format!("BAR{index} mmap failed: {e}")))?
        };

        Ok(Self {
            ptr: ptr.cast(),
            size: info.size as usize,
            index,
        })
    }

    /// Read a 32-bit register.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped size.
    #[must_use]
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: ptr is valid for `size` bytes (mmap in `map`), the
        // offset is bounds-checked above, and MMIO registers are 4-byte
        // aligned. Volatile because hardware changes the value.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// Write a 32-bit register.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped size.
    pub fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: bounds-checked as in read32; volatile because the write
        // triggers hardware side effects.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }

    /// Copy `buf` into a register window as aligned 32-bit words.
    ///
    /// # Panics
    ///
    /// Panics if the window exceeds the mapped size or `buf.len()` is not
    /// a multiple of 4.
    pub fn write_block(&self, offset: usize, buf: &[u8]) {
        assert!(buf.len() % 4 == 0, "block length must be word-aligned");
        assert!(offset + buf.len() <= self.size, "block out of bounds");
        for (i, word) in buf.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            // SAFETY: bounds checked above, word-aligned window.
            unsafe {
                std::ptr::write_volatile(self.ptr.add(offset + i * 4).cast::<u32>(), value);
            }
        }
    }

    /// Copy a register window into `buf` as aligned 32-bit words.
    ///
    /// # Panics
    ///
    /// Panics if the window exceeds the mapped size or `buf.len()` is not
    /// a multiple of 4.
    pub fn read_block(&self, offset: usize, buf: &mut [u8]) {
        assert!(buf.len() % 4 == 0, "block length must be word-aligned");
        assert!(offset + buf.len() <= self.size, "block out of bounds");
        for (i, word) in buf.chunks_exact_mut(4).enumerate() {
            // SAFETY: bounds checked above, word-aligned window.
            let value =
                unsafe { std::ptr::read_volatile(self.ptr.add(offset + i * 4).cast::<u32>()) };
            word.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Mapped size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in `map`; Drop
        // runs at most once and no references outlive self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!(index = self.index, "unmapped BAR region");
    }
}
