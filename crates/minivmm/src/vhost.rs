//! Kernel vhost control ABI.
//!
//! The structs here are passed by pointer to `ioctl(2)` on a vhost
//! character device and must match `<linux/vhost_types.h>` exactly.
//! [`VhostControl`] names the calls device bring-up needs so it can be
//! driven against a recording double in tests; [`VhostVsockFd`] is the
//! real implementation on `/dev/vhost-vsock`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr, ioctl_ior_nr, ioctl_iow_nr};

use crate::memory::HostRegion;

/// Default vhost-vsock control device.
pub const VHOST_VSOCK_DEVICE: &str = "/dev/vhost-vsock";

/// Capacity of [`VhostMemory`]; the kernel default for `max_mem_regions`.
pub const VHOST_MAX_MEM_REGIONS: usize = 64;

/// Where the running kernel reports its memory-table limit.
pub const MAX_MEM_REGIONS_PARAM: &str = "/sys/module/vhost/parameters/max_mem_regions";

const VHOST_VIRTIO: u32 = 0xAF;

// ─── ABI structs ─────────────────────────────────────────────────────

/// `struct vhost_memory_region`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VhostMemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub flags_padding: u64,
}

/// The fixed part of `struct vhost_memory`; sizes the ioctl number.
#[repr(C)]
struct VhostMemoryHeader {
    _nregions: u32,
    _padding: u32,
}

/// `struct vhost_memory` with room for [`VHOST_MAX_MEM_REGIONS`] entries.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct VhostMemory {
    nregions: u32,
    _padding: u32,
    regions: [VhostMemoryRegion; VHOST_MAX_MEM_REGIONS],
}

impl Default for VhostMemory {
    fn default() -> Self {
        Self {
            nregions: 0,
            _padding: 0,
            regions: [VhostMemoryRegion::default(); VHOST_MAX_MEM_REGIONS],
        }
    }
}

/// The table has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

impl VhostMemory {
    /// Append a region.  Fails once [`VHOST_MAX_MEM_REGIONS`] are held.
    pub fn push(&mut self, region: VhostMemoryRegion) -> Result<(), TableFull> {
        let slot = self.regions.get_mut(self.nregions as usize).ok_or(TableFull)?;
        *slot = region;
        self.nregions += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nregions as usize
    }

    pub fn is_empty(&self) -> bool {
        self.nregions == 0
    }

    pub fn regions(&self) -> &[VhostMemoryRegion] {
        &self.regions[..self.len()]
    }
}

impl From<&HostRegion> for VhostMemoryRegion {
    fn from(r: &HostRegion) -> Self {
        Self {
            guest_phys_addr: r.guest_phys_addr,
            memory_size: r.size,
            userspace_addr: r.host_addr,
            flags_padding: 0,
        }
    }
}

/// `struct vhost_vring_state`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VhostVringState {
    pub index: u32,
    pub num: u32,
}

/// `struct vhost_vring_file`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VhostVringFile {
    pub index: u32,
    pub fd: i32,
}

/// `struct vhost_vring_addr`.  Ring addresses are host virtual.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VhostVringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

// ─── ioctl numbers ───────────────────────────────────────────────────

ioctl_ior_nr!(VHOST_GET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_iow_nr!(VHOST_SET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_io_nr!(VHOST_SET_OWNER, VHOST_VIRTIO, 0x01);
ioctl_iow_nr!(VHOST_SET_MEM_TABLE, VHOST_VIRTIO, 0x03, VhostMemoryHeader);
ioctl_iow_nr!(VHOST_SET_VRING_NUM, VHOST_VIRTIO, 0x10, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_ADDR, VHOST_VIRTIO, 0x11, VhostVringAddr);
ioctl_iow_nr!(VHOST_SET_VRING_BASE, VHOST_VIRTIO, 0x12, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_KICK, VHOST_VIRTIO, 0x20, VhostVringFile);
ioctl_iow_nr!(VHOST_SET_VRING_CALL, VHOST_VIRTIO, 0x21, VhostVringFile);
ioctl_iow_nr!(VHOST_VSOCK_SET_GUEST_CID, VHOST_VIRTIO, 0x60, u64);
ioctl_iow_nr!(VHOST_VSOCK_SET_RUNNING, VHOST_VIRTIO, 0x61, libc::c_int);

// ─── Control surface ─────────────────────────────────────────────────

/// Control calls on a vhost-vsock backend.
pub trait VhostControl {
    fn set_owner(&mut self) -> io::Result<()>;
    fn get_features(&mut self) -> io::Result<u64>;
    fn set_features(&mut self, features: u64) -> io::Result<()>;
    fn set_mem_table(&mut self, table: &VhostMemory) -> io::Result<()>;
    fn set_vring_num(&mut self, index: u32, num: u16) -> io::Result<()>;
    fn set_vring_base(&mut self, index: u32, base: u16) -> io::Result<()>;
    fn set_vring_addr(&mut self, addr: &VhostVringAddr) -> io::Result<()>;
    fn set_vring_kick(&mut self, index: u32, fd: RawFd) -> io::Result<()>;
    fn set_vring_call(&mut self, index: u32, fd: RawFd) -> io::Result<()>;
    fn set_guest_cid(&mut self, cid: u64) -> io::Result<()>;
    fn set_running(&mut self, running: bool) -> io::Result<()>;
}

/// An open vhost-vsock control descriptor.
#[derive(Debug)]
pub struct VhostVsockFd {
    file: File,
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl VhostVsockFd {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { file })
    }

    fn set_vring_state(&self, req: libc::c_ulong, index: u32, num: u16) -> io::Result<()> {
        let state = VhostVringState {
            index,
            num: u32::from(num),
        };
        // SAFETY: the kernel reads one `vhost_vring_state`.
        check(unsafe { ioctl_with_ref(&self.file, req, &state) })
    }

    fn set_vring_file(&self, req: libc::c_ulong, index: u32, fd: RawFd) -> io::Result<()> {
        let file = VhostVringFile { index, fd };
        // SAFETY: the kernel reads one `vhost_vring_file`.
        check(unsafe { ioctl_with_ref(&self.file, req, &file) })
    }
}

impl AsRawFd for VhostVsockFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl VhostControl for VhostVsockFd {
    fn set_owner(&mut self) -> io::Result<()> {
        // SAFETY: VHOST_SET_OWNER takes no argument.
        check(unsafe { ioctl(&self.file, VHOST_SET_OWNER()) })
    }

    fn get_features(&mut self) -> io::Result<u64> {
        let mut features = 0u64;
        // SAFETY: the kernel writes one u64.
        check(unsafe { ioctl_with_mut_ref(&self.file, VHOST_GET_FEATURES(), &mut features) })?;
        Ok(features)
    }

    fn set_features(&mut self, features: u64) -> io::Result<()> {
        // SAFETY: the kernel reads one u64.
        check(unsafe { ioctl_with_ref(&self.file, VHOST_SET_FEATURES(), &features) })
    }

    fn set_mem_table(&mut self, table: &VhostMemory) -> io::Result<()> {
        // SAFETY: `VhostMemory` is a header followed by `nregions` valid
        // entries, which is all the kernel reads.
        check(unsafe { ioctl_with_ref(&self.file, VHOST_SET_MEM_TABLE(), table) })
    }

    fn set_vring_num(&mut self, index: u32, num: u16) -> io::Result<()> {
        self.set_vring_state(VHOST_SET_VRING_NUM(), index, num)
    }

    fn set_vring_base(&mut self, index: u32, base: u16) -> io::Result<()> {
        self.set_vring_state(VHOST_SET_VRING_BASE(), index, base)
    }

    fn set_vring_addr(&mut self, addr: &VhostVringAddr) -> io::Result<()> {
        // SAFETY: the kernel reads one `vhost_vring_addr`.
        check(unsafe { ioctl_with_ref(&self.file, VHOST_SET_VRING_ADDR(), addr) })
    }

    fn set_vring_kick(&mut self, index: u32, fd: RawFd) -> io::Result<()> {
        self.set_vring_file(VHOST_SET_VRING_KICK(), index, fd)
    }

    fn set_vring_call(&mut self, index: u32, fd: RawFd) -> io::Result<()> {
        self.set_vring_file(VHOST_SET_VRING_CALL(), index, fd)
    }

    fn set_guest_cid(&mut self, cid: u64) -> io::Result<()> {
        // SAFETY: the kernel reads one u64.
        check(unsafe { ioctl_with_ref(&self.file, VHOST_VSOCK_SET_GUEST_CID(), &cid) })
    }

    fn set_running(&mut self, running: bool) -> io::Result<()> {
        let start = libc::c_int::from(running);
        // SAFETY: the kernel reads one int.
        check(unsafe { ioctl_with_ref(&self.file, VHOST_VSOCK_SET_RUNNING(), &start) })
    }
}

/// The kernel's memory-table limit, never above [`VHOST_MAX_MEM_REGIONS`].
///
/// Missing or malformed parameter files mean the default of 64.
pub fn max_mem_regions() -> usize {
    max_mem_regions_from(Path::new(MAX_MEM_REGIONS_PARAM))
}

pub(crate) fn max_mem_regions_from(path: &Path) -> usize {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .map_or(VHOST_MAX_MEM_REGIONS, |n| n.min(VHOST_MAX_MEM_REGIONS))
}
