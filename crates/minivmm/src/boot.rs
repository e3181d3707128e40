//! Direct Linux boot: kernel and initrd loading plus the data structures
//! the x86_64 64-bit boot protocol expects in guest memory.
//!
//! The loader accepts a bzImage (boot protocol 2.12 or later, with a
//! 64-bit entry point) or an uncompressed ELF `vmlinux`.  For a bzImage
//! the boot header at offset `0x1f1` is parsed and validated, the
//! real-mode setup code is copied to [`REAL_MODE_START`] and the
//! protected-mode kernel to [`HIMEM_START`].  The initrd goes at the top
//! of the window the kernel allows, and a `boot_params` zero page with
//! the command line, initrd location and E820 map is written at
//! [`ZERO_PAGE_START`].
//!
//! # Low Memory Layout
//!
//! ```text
//! 0x0000_0500  GDT (4 × 8-byte entries)
//! 0x0000_0520  IDT (placeholder)
//! 0x0000_7000  Zero page (boot_params)
//! 0x0000_8FF0  Boot stack (grows down)
//! 0x0000_9000  PML4
//! 0x0000_A000  PDPTE
//! 0x0000_B000  PDE (512 × 2 MB pages → 1 GB identity map)
//! 0x0002_0000  Kernel command line
//! 0x0009_0000  Real-mode setup code (bzImage only)
//! 0x0010_0000  Protected-mode kernel, then initrd near the window top
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use kvm_bindings::kvm_segment;
use linux_loader::configurator::linux::LinuxBootConfigurator;
use linux_loader::configurator::{BootConfigurator, BootParams};
use linux_loader::loader::bootparam::{boot_params, setup_header};
use linux_loader::loader::bzimage::BzImage;
use linux_loader::loader::elf::Elf;
use linux_loader::loader::{KernelLoader, KernelLoaderResult};
use log::info;
use thiserror::Error;
use vm_memory::{ByteValued, GuestAddress};

use crate::memory::{GuestMemoryManager, MemoryError, MMIO_GAP_START, PAGE_SIZE};
pub use crate::memory::HIMEM_START;

// ═══════════════════════════════════════════════════════════════════════
//  Memory layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Initial stack pointer for the boot CPU.
pub const BOOT_STACK_POINTER: u64 = 0x8ff0;

/// Address of the "zero page" (`boot_params` structure).
///
/// `rsi` points here when the kernel's 64-bit entry runs.
pub const ZERO_PAGE_START: u64 = 0x7000;

/// Address where the kernel command-line string is written.
pub const CMDLINE_START: u64 = 0x20000;

/// Maximum length of the kernel command line (bytes, including NUL).
pub const CMDLINE_MAX_SIZE: usize = 0x10000;

/// Where the bzImage real-mode setup code is copied.
pub const REAL_MODE_START: u64 = 0x90000;

/// Offset of the boot GDT in guest physical memory.
pub const BOOT_GDT_OFFSET: u64 = 0x500;

/// Offset of the boot IDT in guest physical memory.
pub const BOOT_IDT_OFFSET: u64 = 0x520;

/// Physical address of the PML4 table.  `CR3` is loaded with this value.
pub const PML4_START: u64 = 0x9000;

/// Physical address of the PDPTE page.
pub const PDPTE_START: u64 = 0xa000;

/// Physical address of the PDE page (512 × 2 MB entries).
pub const PDE_START: u64 = 0xb000;

const PDE_ENTRY_COUNT: u64 = 512;
const PTE_PRESENT_WRITABLE: u64 = 0x03;
const PDE_PRESENT_WRITABLE_PS: u64 = 0x83;

// ═══════════════════════════════════════════════════════════════════════
//  Boot protocol constants
// ═══════════════════════════════════════════════════════════════════════

/// Offset of `setup_header` within a bzImage.
pub const SETUP_HEADER_OFFSET: usize = 0x1f1;

/// Bytes of the image up to the end of `setup_header`.
const HEADER_PREFIX_LEN: usize = SETUP_HEADER_OFFSET + std::mem::size_of::<setup_header>();

/// `boot_flag` value at 0x1fe.
pub const BOOT_FLAG_MAGIC: u16 = 0xaa55;

/// `"HdrS"` at 0x202.
pub const HDRS_MAGIC: u32 = 0x5372_6448;

/// Oldest protocol with `xloadflags` (and so a declared 64-bit entry).
pub const MIN_BOOT_PROTOCOL: u16 = 0x020c;

/// `xloadflags` bit: the kernel has a 64-bit entry at +0x200.
pub const XLF_KERNEL_64: u16 = 1 << 0;

/// `loadflags` bit: protected-mode code is loaded at 0x100000.
pub const LOADED_HIGH: u8 = 1 << 0;

/// Offset of `startup_64` from the start of the protected-mode kernel.
const STARTUP_64_OFFSET: u64 = 0x200;

const KERNEL_LOADER_OTHER: u8 = 0xff;
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;

/// `initrd_addr_max` assumed when the header predates the field.
const DEFAULT_INITRD_ADDR_MAX: u64 = 0x37ff_ffff;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

// ═══════════════════════════════════════════════════════════════════════
//  GDT constants
// ═══════════════════════════════════════════════════════════════════════

pub const GDT_ENTRY_COUNT: usize = 4;
pub const GDT_INDEX_CODE: u8 = 1;
pub const GDT_INDEX_DATA: u8 = 2;
pub const GDT_INDEX_TSS: u8 = 3;

/// 64-bit code segment: access `0x9B` (present, ring 0, exec-read,
/// accessed), flags `0xA` (G=1, L=1).
pub const GDT_FLAGS_CODE64: u16 = 0xa09b;

/// Data segment: access `0x93` (present, ring 0, read-write, accessed),
/// flags `0xC` (G=1, D/B=1).
pub const GDT_FLAGS_DATA: u16 = 0xc093;

/// Busy 64-bit TSS.
pub const GDT_FLAGS_TSS: u16 = 0x808b;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to read kernel image {path:?}")]
    Kernel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read initrd {path:?}")]
    Initrd {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("kernel image is neither a bzImage nor an ELF file")]
    UnknownFormat,

    #[error("boot protocol {version:#06x} is older than {MIN_BOOT_PROTOCOL:#06x}")]
    UnsupportedProtocol { version: u16 },

    #[error("bzImage has no 64-bit entry point")]
    No64BitEntry,

    #[error("loader rejected kernel image")]
    Load(#[source] linux_loader::loader::Error),

    #[error("failed to write boot parameters")]
    BootParams(#[source] linux_loader::configurator::Error),

    #[error("no RAM region covers guest address 0 and extends past {HIMEM_START:#x}")]
    NoLowMemory,

    #[error("kernel needs {size:#x} bytes, {available:#x} free above {HIMEM_START:#x}")]
    KernelTooLarge { size: u64, available: u64 },

    #[error("real-mode setup code of {size:#x} bytes does not fit below the EBDA")]
    SetupTooLarge { size: u64 },

    #[error("initrd of {size:#x} bytes exceeds the {available:#x} byte window after the kernel")]
    InitrdTooLarge { size: u64, available: u64 },

    #[error("kernel command line of {len} bytes exceeds the {max} byte limit")]
    CmdlineTooLong { len: usize, max: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl BootError {
    /// Whether this error means something did not fit in guest memory.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::NoLowMemory
                | Self::KernelTooLarge { .. }
                | Self::SetupTooLarge { .. }
                | Self::InitrdTooLarge { .. }
                | Self::CmdlineTooLong { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  bzImage boot header
// ═══════════════════════════════════════════════════════════════════════

/// A validated bzImage `setup_header`.
#[derive(Debug, Clone, Copy)]
pub struct BootHeader(setup_header);

impl BootHeader {
    /// Parse and validate the header from the first bytes of an image.
    ///
    /// Returns [`BootError::UnknownFormat`] if the magic numbers are
    /// missing, and a protocol error if the kernel cannot be entered in
    /// 64-bit mode.
    pub fn parse(image: &[u8]) -> Result<Self, BootError> {
        let raw = image
            .get(SETUP_HEADER_OFFSET..HEADER_PREFIX_LEN)
            .and_then(setup_header::from_slice)
            .copied()
            .ok_or(BootError::UnknownFormat)?;
        if { raw.boot_flag } != BOOT_FLAG_MAGIC || { raw.header } != HDRS_MAGIC {
            return Err(BootError::UnknownFormat);
        }

        let header = Self(raw);
        if header.version() < MIN_BOOT_PROTOCOL {
            return Err(BootError::UnsupportedProtocol {
                version: header.version(),
            });
        }
        if header.xloadflags() & XLF_KERNEL_64 == 0 || header.loadflags() & LOADED_HIGH == 0 {
            return Err(BootError::No64BitEntry);
        }
        Ok(header)
    }

    /// The header as the kernel wrote it.
    pub fn raw(&self) -> &setup_header {
        &self.0
    }

    pub fn setup_sects(&self) -> u8 {
        self.0.setup_sects
    }

    pub fn version(&self) -> u16 {
        self.0.version
    }

    pub fn loadflags(&self) -> u8 {
        self.0.loadflags
    }

    pub fn xloadflags(&self) -> u16 {
        self.0.xloadflags
    }

    /// Highest address the initrd may end at; 0 on old kernels.
    pub fn initrd_addr_max(&self) -> u32 {
        self.0.initrd_addr_max
    }

    /// Longest command line the kernel accepts, without the NUL.
    pub fn cmdline_size(&self) -> u32 {
        self.0.cmdline_size
    }

    /// Memory the kernel needs from its load address while booting.
    pub fn init_size(&self) -> u32 {
        self.0.init_size
    }

    /// Size in bytes of the real-mode part (boot sector plus setup
    /// sectors).  A zero `setup_sects` means 4.
    pub fn setup_size(&self) -> u64 {
        let sects = match self.setup_sects() {
            0 => 4,
            n => u64::from(n),
        };
        (sects + 1) * 512
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Kernel loading
// ═══════════════════════════════════════════════════════════════════════

/// Result of loading a kernel, used to set the boot vCPU's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// 64-bit entry point (`rip`).
    pub entry: u64,
    /// First byte past the loaded kernel.
    pub kernel_end: u64,
    /// Guest address and size of the initrd, if one was loaded.
    pub initrd: Option<(u64, u64)>,
}

/// Load the kernel, initrd and boot parameters into guest memory.
///
/// This is the one-shot boot step run before any vCPU executes.  It
/// writes the GDT, page tables, command line and zero page as well as
/// the images themselves.
pub fn load_kernel(
    mem: &GuestMemoryManager,
    kernel: &Path,
    initrd: Option<&Path>,
    cmdline: &str,
) -> Result<BootInfo, BootError> {
    let low = mem.low_region().ok_or(BootError::NoLowMemory)?;
    let low_end = low.guest_phys_addr + low.size;
    if low_end <= HIMEM_START {
        return Err(BootError::NoLowMemory);
    }

    let kernel_err = |source| BootError::Kernel {
        path: kernel.to_path_buf(),
        source,
    };
    info!("Loading kernel from {}", kernel.display());
    let mut file = File::open(kernel).map_err(kernel_err)?;
    let file_len = file.metadata().map_err(kernel_err)?.len();

    let mut prefix = vec![0u8; HEADER_PREFIX_LEN.min(file_len as usize)];
    file.read_exact(&mut prefix).map_err(kernel_err)?;
    file.seek(SeekFrom::Start(0)).map_err(kernel_err)?;

    let available = low_end - HIMEM_START;
    let header;
    let result: KernelLoaderResult;
    let entry;

    if prefix.starts_with(&ELF_MAGIC) {
        header = None;
        if file_len > available {
            return Err(BootError::KernelTooLarge {
                size: file_len,
                available,
            });
        }
        result = Elf::load(mem.inner(), None, &mut file, Some(GuestAddress(HIMEM_START)))
            .map_err(BootError::Load)?;
        entry = result.kernel_load.0;
    } else {
        let hdr = BootHeader::parse(&prefix)?;
        let setup_size = hdr.setup_size();
        if REAL_MODE_START + setup_size > crate::memory::LOW_MEMORY_END || setup_size > file_len {
            return Err(BootError::SetupTooLarge { size: setup_size });
        }
        let needed = u64::from(hdr.init_size()).max(file_len - setup_size);
        if needed > available {
            return Err(BootError::KernelTooLarge {
                size: needed,
                available,
            });
        }

        copy_real_mode(mem, &mut file, setup_size).map_err(|e| match e {
            CopyError::Io(source) => kernel_err(source),
            CopyError::Memory(m) => BootError::Memory(m),
        })?;

        file.seek(SeekFrom::Start(0)).map_err(kernel_err)?;
        result = BzImage::load(mem.inner(), None, &mut file, Some(GuestAddress(HIMEM_START)))
            .map_err(BootError::Load)?;
        entry = result.kernel_load.0 + STARTUP_64_OFFSET;
        header = Some(hdr);
    }

    let kernel_end = result.kernel_end;
    info!(
        "Kernel loaded at {:#x}, entry {:#x}, end {:#x}",
        result.kernel_load.0, entry, kernel_end,
    );

    let initrd = match initrd {
        Some(path) => Some(load_initrd(mem, path, kernel_end, low_end, header.as_ref())?),
        None => None,
    };

    write_gdt(mem)?;
    write_page_tables(mem)?;

    let cmdline_max = header
        .map(|h| (h.cmdline_size() as usize + 1).min(CMDLINE_MAX_SIZE))
        .unwrap_or(CMDLINE_MAX_SIZE);
    let cmdline_len = write_cmdline(mem, cmdline.as_bytes(), cmdline_max)?;

    write_boot_params(mem, result.setup_header, cmdline_len, initrd)?;

    Ok(BootInfo {
        entry,
        kernel_end,
        initrd,
    })
}

enum CopyError {
    Io(io::Error),
    Memory(MemoryError),
}

fn copy_real_mode(
    mem: &GuestMemoryManager,
    file: &mut File,
    setup_size: u64,
) -> Result<(), CopyError> {
    let mut setup = vec![0u8; setup_size as usize];
    file.read_exact(&mut setup).map_err(CopyError::Io)?;
    mem.write_slice(&setup, REAL_MODE_START)
        .map_err(CopyError::Memory)?;
    info!(
        "Real-mode setup copied to {:#x} ({} bytes)",
        REAL_MODE_START, setup_size
    );
    Ok(())
}

/// Choose the initrd load address.
///
/// The initrd sits page-aligned at the top of the window bounded by the
/// end of low RAM, the kernel's `initrd_addr_max` and the device window,
/// and must not reach down into the kernel.
pub fn place_initrd(
    kernel_end: u64,
    ram_end: u64,
    initrd_addr_max: u64,
    size: u64,
) -> Result<u64, BootError> {
    let floor = align_up(kernel_end, PAGE_SIZE);
    let ceiling = ram_end
        .min(initrd_addr_max.saturating_add(1))
        .min(MMIO_GAP_START);
    let available = ceiling.saturating_sub(floor);
    if size > available {
        return Err(BootError::InitrdTooLarge { size, available });
    }
    Ok((ceiling - size) & !(PAGE_SIZE - 1))
}

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

fn load_initrd(
    mem: &GuestMemoryManager,
    path: &Path,
    kernel_end: u64,
    ram_end: u64,
    header: Option<&BootHeader>,
) -> Result<(u64, u64), BootError> {
    let initrd_err = |source| BootError::Initrd {
        path: path.to_path_buf(),
        source,
    };
    info!("Loading initrd from {}", path.display());
    let size = std::fs::metadata(path).map_err(initrd_err)?.len();
    let addr_max = header
        .map(|h| u64::from(h.initrd_addr_max()))
        .filter(|&m| m != 0)
        .unwrap_or(DEFAULT_INITRD_ADDR_MAX);
    let addr = place_initrd(kernel_end, ram_end, addr_max, size)?;

    let data = std::fs::read(path).map_err(initrd_err)?;
    mem.write_slice(&data, addr)?;
    info!("Initrd loaded at {:#x}, size: {} bytes", addr, data.len());
    Ok((addr, data.len() as u64))
}

// ═══════════════════════════════════════════════════════════════════════
//  Boot data structures
// ═══════════════════════════════════════════════════════════════════════

/// Write identity-mapped page tables for the first 1 GB.
///
/// ```text
/// PML4[0]  → PDPTE       (at 0x9000)
/// PDPTE[0] → PDE         (at 0xA000)
/// PDE[0..511] → 2 MB pages (at 0xB000)
/// ```
pub fn write_page_tables(mem: &GuestMemoryManager) -> Result<(), MemoryError> {
    mem.write_obj(PDPTE_START | PTE_PRESENT_WRITABLE, PML4_START)?;
    mem.write_obj(PDE_START | PTE_PRESENT_WRITABLE, PDPTE_START)?;
    for i in 0..PDE_ENTRY_COUNT {
        mem.write_obj((i << 21) | PDE_PRESENT_WRITABLE_PS, PDE_START + i * 8)?;
    }
    info!(
        "Page tables written: PML4={:#x}, PDPTE={:#x}, PDE={:#x}",
        PML4_START, PDPTE_START, PDE_START,
    );
    Ok(())
}

/// Write the boot GDT (NULL, CODE64, DATA, TSS) and an empty IDT.
pub fn write_gdt(mem: &GuestMemoryManager) -> Result<(), MemoryError> {
    let gdt_table: [u64; GDT_ENTRY_COUNT] = [
        0,
        gdt_entry(GDT_FLAGS_CODE64, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_DATA, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_TSS, 0, 0xfffff),
    ];
    for (i, entry) in gdt_table.iter().enumerate() {
        mem.write_obj(*entry, BOOT_GDT_OFFSET + i as u64 * 8)?;
    }
    mem.write_obj(0u64, BOOT_IDT_OFFSET)?;
    Ok(())
}

/// Write the NUL-terminated command line at [`CMDLINE_START`].
///
/// Returns the length including the terminator.
pub fn write_cmdline(
    mem: &GuestMemoryManager,
    cmdline: &[u8],
    max: usize,
) -> Result<usize, BootError> {
    let cmdline = cmdline.strip_suffix(&[0]).unwrap_or(cmdline);
    let len = cmdline.len() + 1;
    if len > max {
        return Err(BootError::CmdlineTooLong { len, max });
    }
    mem.write_slice(cmdline, CMDLINE_START)?;
    mem.write_obj(0u8, CMDLINE_START + cmdline.len() as u64)?;
    info!("Command line written at {:#x} ({} bytes)", CMDLINE_START, len);
    Ok(len)
}

/// Build the zero page from the kernel's own header (if any) and the
/// guest memory map.
fn write_boot_params(
    mem: &GuestMemoryManager,
    kernel_header: Option<setup_header>,
    cmdline_len: usize,
    initrd: Option<(u64, u64)>,
) -> Result<(), BootError> {
    let mut hdr = kernel_header.unwrap_or(setup_header {
        boot_flag: BOOT_FLAG_MAGIC,
        header: HDRS_MAGIC,
        kernel_alignment: KERNEL_MIN_ALIGNMENT_BYTES,
        ..Default::default()
    });
    hdr.type_of_loader = KERNEL_LOADER_OTHER;
    hdr.cmd_line_ptr = CMDLINE_START as u32;
    hdr.cmdline_size = cmdline_len as u32;
    if let Some((addr, size)) = initrd {
        hdr.ramdisk_image = addr as u32;
        hdr.ramdisk_size = size as u32;
    }

    let mut params = boot_params {
        hdr,
        ..Default::default()
    };
    let e820 = mem.e820_map()?;
    for (slot, entry) in params.e820_table.iter_mut().zip(&e820) {
        slot.addr = entry.addr;
        slot.size = entry.size;
        slot.type_ = entry.type_;
    }
    params.e820_entries = e820.len() as u8;

    let boot_params = BootParams::new(&params, GuestAddress(ZERO_PAGE_START));
    LinuxBootConfigurator::write_bootparams(&boot_params, mem.inner())
        .map_err(BootError::BootParams)?;
    info!(
        "Zero page written at {:#x} ({} E820 entries)",
        ZERO_PAGE_START,
        e820.len()
    );
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  GDT helpers
// ═══════════════════════════════════════════════════════════════════════

/// Construct a raw 8-byte GDT descriptor from flags, base, and limit.
///
/// `flags[7:0]` is the access byte and `flags[15:12]` the G/DB/L/AVL
/// nibble.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ff) << 40)
        | ((u64::from(limit) & 0x000f_0000) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffff) << 16)
        | (u64::from(limit) & 0x0000_ffff)
}

/// Decode a GDT descriptor into the segment register KVM loads.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let present = ((entry >> 47) & 1) as u8;
    let g = ((entry >> 55) & 1) as u8;
    let raw_limit = (((entry & 0x000f_0000_0000_0000) >> 32) | (entry & 0xffff)) as u32;
    kvm_segment {
        base: ((entry & 0xff00_0000_0000_0000) >> 32)
            | ((entry & 0x0000_00ff_0000_0000) >> 16)
            | ((entry & 0x0000_0000_ffff_0000) >> 16),
        limit: if g == 0 {
            raw_limit
        } else {
            (raw_limit << 12) | 0xfff
        },
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 1) as u8,
        s: ((entry >> 44) & 1) as u8,
        l: ((entry >> 53) & 1) as u8,
        g,
        avl: ((entry >> 52) & 1) as u8,
        padding: 0,
        unusable: u8::from(present == 0),
    }
}

pub fn code64_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_CODE64, 0, 0xfffff), GDT_INDEX_CODE)
}

pub fn data_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_DATA, 0, 0xfffff), GDT_INDEX_DATA)
}

pub fn tss_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_TSS, 0, 0xfffff), GDT_INDEX_TSS)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
