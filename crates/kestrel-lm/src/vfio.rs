//! VFIO mailbox transport.
//!
//! The real [`CommandTransport`]: opens the VFIO container/group/device
//! trio for a vfio-pci-bound VF, maps BAR0, and drives the firmware
//! mailbox — command window in, doorbell, completion-valid poll, completion
//! window out. Bulk data is staged through one IOMMU-mapped, mlocked,
//! page-aligned DMA buffer whose IOVA is programmed into the mailbox's
//! data-window registers.
//!
//! # Requirements
//!
//! 1. IOMMU enabled (`intel_iommu=on` / `amd_iommu=on`)
//! 2. The VF bound to `vfio-pci`
//! 3. Access to `/dev/vfio/<group>`

// FFI/ioctl casts are intentional - the VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use kestrel_proto::regs;
use kestrel_proto::{CommandBlock, Completion, COMP_LEN};
use rustix::mm::{mlock, munlock};

use crate::error::{MigrationError, Result};
use crate::mmio::MappedRegion;
use crate::transport::{CommandTransport, DataXfer};

/// Spacing between completion-valid polls.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// VFIO ioctl numbers (from Linux kernel headers).
///
/// Calculated as `_IO(';', 100 + offset)` = `(type << 8) | nr`.
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    const VFIO_TYPE: u8 = b';';
    const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Page-aligned, mlocked, IOMMU-mapped staging buffer.
#[derive(Debug)]
struct DmaBuffer {
    vaddr: *mut u8,
    iova: u64,
    size: usize,
    container_fd: RawFd,
}

// SAFETY: DmaBuffer owns its allocation exclusively.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    fn new(container_fd: RawFd, size: usize, iova: u64) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MigrationError::transport(format!("bad DMA buffer layout: {e}")))?;

        // SAFETY: layout is nonzero and 4096-aligned; the pointer is
        // deallocated with the same layout in Drop.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(MigrationError::transport("DMA buffer allocation failed"));
        }

        // SAFETY: vaddr is valid for `size` bytes from the allocation
        // above; mlock pins the pages so the IOMMU mapping stays valid.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: allocated above with this layout; error-path cleanup.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            return Err(MigrationError::transport(format!("mlock failed: {e}")));
        }

        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };

        // SAFETY: VFIO_IOMMU_MAP_DMA maps [vaddr, vaddr+size) at `iova`.
        // Invariants: (1) container_fd is an open VFIO container with an
        // IOMMU set; (2) dma_map fields describe our pinned allocation;
        // (3) struct layout matches the kernel's vfio_iommu_type1_dma_map.
        let ret = unsafe {
            libc::ioctl(
                container_fd,
                ioctls::VFIO_IOMMU_MAP_DMA,
                std::ptr::addr_of!(dma_map),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: error-path cleanup of the allocation made above.
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            }
            return Err(MigrationError::transport(format!("DMA map failed: {err}")));
        }

        tracing::debug!("DMA buffer mapped: iova={iova:#x}, size={size:#x}");
        Ok(Self {
            vaddr,
            iova,
            size,
            container_fd,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: vaddr valid for size bytes; we own the allocation.
        unsafe { std::slice::from_raw_parts(self.vaddr, self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: vaddr valid for size bytes; &mut self gives exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.vaddr, self.size) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: self.size as u64,
        };
        // SAFETY: unmaps the IOVA established in `new` before the memory
        // is freed; struct layout matches the kernel's.
        unsafe {
            libc::ioctl(
                self.container_fd,
                ioctls::VFIO_IOMMU_UNMAP_DMA,
                std::ptr::addr_of!(dma_unmap),
            );
        }

        // SAFETY: vaddr was mlock'd and allocated in `new` with this
        // exact layout; Drop runs at most once.
        unsafe {
            let _ = munlock(self.vaddr.cast(), self.size);
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, 4096);
            std::alloc::dealloc(self.vaddr, layout);
        }
    }
}

/// Real mailbox transport over a vfio-pci-bound VF.
#[derive(Debug)]
pub struct VfioTransport {
    pcie_address: String,
    container: File,
    /// Kept open for the VFIO group lifetime.
    #[allow(dead_code)]
    group: File,
    /// Kept open for the device fd / BAR mapping lifetime.
    #[allow(dead_code)]
    device: File,
    bar0: MappedRegion,
    dma: Option<DmaBuffer>,
    next_iova: u64,
}

impl VfioTransport {
    /// Open the VFIO path for `pcie_address` and map BAR0.
    ///
    /// # Errors
    ///
    /// Fails if the IOMMU group cannot be resolved, any VFIO handshake
    /// step is rejected, or BAR0 cannot be mapped.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!(pcie_address, "opening VFIO transport");

        let group_id = Self::find_iommu_group(pcie_address)?;
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| MigrationError::transport(format!("open /dev/vfio/vfio: {e}")))?;

        // SAFETY: argument-less _IO ioctl on the container fd; returns the
        // kernel's VFIO API version.
        let api = unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION) };
        if api != ioctls::VFIO_API_VERSION {
            return Err(MigrationError::transport(format!(
                "unsupported VFIO API version {api}"
            )));
        }

        // SAFETY: queries Type1v2 IOMMU support; third arg is the
        // extension id, kernel returns 1 if supported.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(MigrationError::transport("VFIO Type1v2 IOMMU not supported"));
        }

        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/vfio/{group_id}"))
            .map_err(|e| MigrationError::transport(format!("open group {group_id}: {e}")))?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: fills `status` for the group fd; struct layout matches
        // the kernel's vfio_group_status.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS,
                std::ptr::addr_of_mut!(status),
            )
        };
        if ret < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(MigrationError::transport(format!(
                "IOMMU group {group_id} not viable (all group devices must be bound to vfio-pci)"
            )));
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: attaches the group to the container; the argument is a
        // pointer to the container fd per the VFIO ABI.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER,
                std::ptr::addr_of!(container_fd),
            )
        };
        if ret < 0 {
            return Err(MigrationError::transport(format!(
                "group set container: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: selects the Type1v2 IOMMU backend for the container.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(MigrationError::transport(format!(
                "set IOMMU: {}",
                std::io::Error::last_os_error()
            )));
        }

        let addr = CString::new(pcie_address)
            .map_err(|_| MigrationError::transport("PCIe address contains NUL"))?;
        // SAFETY: returns a new device fd for the named group member; the
        // argument is a NUL-terminated device name.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD,
                addr.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(MigrationError::transport(format!(
                "get device fd for {pcie_address}: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: device_fd is a freshly returned, owned fd.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let bar0 = MappedRegion::map(&device, 0)?;
        if bar0.size() < regs::MBOX_SPAN {
            return Err(MigrationError::transport(format!(
                "BAR0 too small for mailbox: {:#x}",
                bar0.size()
            )));
        }

        tracing::info!(pcie_address, group_id, "VFIO transport ready");
        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container,
            group,
            device,
            bar0,
            dma: None,
            next_iova: 0x1_0000,
        })
    }

    /// PCIe address this transport drives.
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    fn find_iommu_group(pcie_address: &str) -> Result<u32> {
        let link = std::fs::read_link(format!(
            "/sys/bus/pci/devices/{pcie_address}/iommu_group"
        ))
        .map_err(|e| {
            MigrationError::transport(format!(
                "cannot read IOMMU group for {pcie_address}: {e} (is the IOMMU enabled?)"
            ))
        })?;
        link.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MigrationError::transport("invalid IOMMU group path"))
    }

    /// Return a staging buffer of at least `len` bytes, growing (and
    /// remapping) on demand.
    fn staging(&mut self, len: usize) -> Result<&mut DmaBuffer> {
        let needed = len.div_ceil(4096) * 4096;
        let grow = match &self.dma {
            Some(buf) => buf.size < needed,
            None => true,
        };
        if grow {
            self.dma = None; // unmap the old IOVA first
            let iova = self.next_iova;
            self.next_iova += needed as u64;
            self.dma = Some(DmaBuffer::new(self.container.as_raw_fd(), needed, iova)?);
        }
        Ok(self.dma.as_mut().expect("staging buffer just ensured"))
    }

    fn mailbox_status(&self) -> u32 {
        self.bar0.read32(regs::MBOX_STATUS)
    }
}

impl CommandTransport for VfioTransport {
    fn ready(&self) -> bool {
        let status = self.mailbox_status();
        status & regs::status::READY != 0 && status & regs::status::RESET == 0
    }

    fn submit(
        &mut self,
        cmd: &CommandBlock,
        data: DataXfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        // Stage outbound data and program the data window.
        let (iova, data_len) = match &data {
            DataXfer::None => (0u64, 0usize),
            DataXfer::ToDevice(src) if src.is_empty() => (0, 0),
            DataXfer::FromDevice(dst) if dst.is_empty() => (0, 0),
            DataXfer::ToDevice(src) => {
                let buf = self.staging(src.len())?;
                buf.as_mut_slice()[..src.len()].copy_from_slice(src);
                (buf.iova, src.len())
            }
            DataXfer::FromDevice(dst) => {
                let len = dst.len();
                let buf = self.staging(len)?;
                (buf.iova, len)
            }
        };

        self.bar0.write_block(regs::MBOX_CMD, cmd.as_bytes());
        self.bar0.write32(regs::MBOX_DATA_LO, iova as u32);
        self.bar0.write32(regs::MBOX_DATA_HI, (iova >> 32) as u32);
        self.bar0.write32(regs::MBOX_DATA_LEN, data_len as u32);
        self.bar0.write32(regs::MBOX_DOORBELL, regs::doorbell::RING);

        // Poll for the completion.
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.mailbox_status();
            if status & regs::status::COMP_VALID != 0 {
                break;
            }
            if status & regs::status::RESET != 0 {
                tracing::warn!(
                    pcie_address = %self.pcie_address,
                    "device reset while command in flight"
                );
                return Err(MigrationError::Busy);
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let mut comp_bytes = [0u8; COMP_LEN];
        self.bar0.read_block(regs::MBOX_COMP, &mut comp_bytes);
        // COMP_VALID is write-1-to-clear.
        self.bar0
            .write32(regs::MBOX_STATUS, regs::status::COMP_VALID);

        // Copy inbound data out of the staging buffer.
        if let DataXfer::FromDevice(dst) = data {
            if !dst.is_empty() {
                let len = dst.len();
                let buf = self.dma.as_ref().expect("staging buffer present");
                dst.copy_from_slice(&buf.as_slice()[..len]);
            }
        }

        Ok(Completion::from_bytes(comp_bytes))
    }
}
