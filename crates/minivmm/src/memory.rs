//! Guest physical memory: region parsing, host mappings and the memory map.
//!
//! Guest RAM is described by one or more [`MemoryRegion`]s, each created
//! from a `base@size@name` spec string:
//!
//! ```text
//! base@size@name
//!  │    │    └── backing file; empty = anonymous shared mapping
//!  │    └─────── number[gGmMkK]; empty = length of the backing file
//!  └──────────── number[gGmMkK]; empty = directly after the previous region
//! ```
//!
//! A region is mapped exactly once with [`MemoryRegion::map`].  Mapped
//! regions are then handed to [`GuestMemoryManager`], which checks that
//! they do not overlap each other or the device window, assembles them
//! into a single [`GuestMemoryMmap`], and derives the two views other
//! components need:
//!
//! - [`HostRegion`] descriptors (guest address, size, host address) used
//!   for KVM memory slots and the vhost memory table.
//! - The E820 map reported to the guest kernel.
//!
//! # Guest Physical Address Space
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  RAM (region at GPA 0)     │
//! 0x0009_FC00  ├───────────────────────────┤  ← LOW_MEMORY_END
//!              │  EBDA / VGA / BIOS hole    │  (not reported as RAM)
//! 0x0010_0000  ├───────────────────────────┤  ← HIMEM_START
//!              │  RAM                       │
//!              │  ...                       │
//! 0xD000_0000  ├───────────────────────────┤  ← MMIO_GAP_START
//!              │  virtio-mmio, IOAPIC, LAPIC│  (no RAM allowed)
//! 0x1_0000_0000└───────────────────────────┘  ← MMIO_GAP_END
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;
use vm_memory::{
    Bytes, FileOffset, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion,
    GuestRegionMmap, MmapRegion, VolatileMemory,
};

use crate::config::{parse_size, ConfigError};

// ═══════════════════════════════════════════════════════════════════════
//  Address-space constants
// ═══════════════════════════════════════════════════════════════════════

/// Start of high memory where the kernel is loaded (1 MB).
pub const HIMEM_START: u64 = 0x0010_0000;

/// End of conventional low memory (below the EBDA).
///
/// 0x9FC00–0xFFFFF holds the EBDA, legacy video memory and option ROMs
/// on a PC and is never reported as usable RAM.
pub const LOW_MEMORY_END: u64 = 0x9fc00;

/// First guest physical address reserved for devices.
pub const MMIO_GAP_START: u64 = 0xd000_0000;

/// End (exclusive) of the device window.
pub const MMIO_GAP_END: u64 = 0x1_0000_0000;

/// E820 memory type: usable RAM available to the operating system.
pub const E820_RAM: u32 = 1;

/// Maximum E820 entries the zero page can carry.
pub const E820_MAX_ENTRIES: usize = 128;

/// Host page size assumed for ring and region alignment.
pub const PAGE_SIZE: u64 = 4096;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors raised while parsing, mapping or assembling guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The region spec string is malformed.
    #[error("bad memory region spec")]
    Config(#[from] ConfigError),

    /// The backing file could not be opened or inspected.
    #[error("failed to open backing file {path:?} for region at {base:#x}")]
    Open {
        path: PathBuf,
        base: u64,
        #[source]
        source: io::Error,
    },

    /// The backing file is shorter than the region.
    #[error("backing file {path:?} holds {available} bytes, region needs {size}")]
    FileTooSmall {
        path: PathBuf,
        size: u64,
        available: u64,
    },

    /// `mmap` refused the mapping.
    #[error("failed to map {size} bytes for region {name:?} at {base:#x}")]
    Map {
        name: String,
        base: u64,
        size: u64,
        #[source]
        source: vm_memory::mmap::MmapRegionError,
    },

    /// The region size does not fit the host address space or is not
    /// page aligned.
    #[error("region at {base:#x} has unusable size {size:#x}")]
    BadSize { base: u64, size: u64 },

    /// The region base is not page aligned.
    #[error("region base {base:#x} is not page aligned")]
    Unaligned { base: u64 },

    /// A region was handed over without being mapped first.
    #[error("region at {base:#x} was never mapped")]
    Unmapped { base: u64 },

    /// Two regions claim the same guest physical addresses.
    #[error("region at {base:#x} overlaps region at {other:#x}")]
    Overlap { base: u64, other: u64 },

    /// A region reaches into the device window.
    #[error("region [{base:#x}, {end:#x}) overlaps the device window")]
    MmioOverlap { base: u64, end: u64 },

    /// `vm-memory` rejected the assembled region list.
    #[error("failed to assemble guest memory")]
    Assemble(#[source] vm_memory::mmap::Error),

    /// No regions were supplied.
    #[error("no guest memory regions configured")]
    Empty,

    /// The memory map has more entries than the zero page can hold.
    #[error("memory map needs {count} entries, at most {E820_MAX_ENTRIES} fit")]
    TooManyEntries { count: usize },

    /// A write to guest physical memory failed.
    #[error("failed to write to guest memory at {address:#x}")]
    Write { address: u64 },

    /// A read from guest physical memory failed.
    #[error("failed to read from guest memory at {address:#x}")]
    Read { address: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  MemoryRegion
// ═══════════════════════════════════════════════════════════════════════

/// What a region's bytes live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled anonymous shared memory.
    Anonymous,
    /// A file (or block device) mapped shared from offset 0.
    File(PathBuf),
}

/// One contiguous range of guest physical memory.
///
/// Created unmapped by [`MemoryRegion::parse`]; [`map`](Self::map) attaches
/// the host mapping.  The mapping lives as long as the region (or the
/// [`GuestMemoryManager`] the region is handed to).
#[derive(Debug)]
pub struct MemoryRegion {
    name: String,
    base: u64,
    size: u64,
    backing: Backing,
    data: Option<MmapRegion>,
}

impl MemoryRegion {
    /// Create an unmapped anonymous region.
    pub fn anonymous(base: u64, size: u64) -> Self {
        Self {
            name: String::new(),
            base,
            size,
            backing: Backing::Anonymous,
            data: None,
        }
    }

    /// Parse a `base@size@name` spec.
    ///
    /// An empty `base` places the region at `next_base`.  An empty `size`
    /// takes the length of the named file.  Everything after the second
    /// `@` is the file name, so names may themselves contain `@`.
    pub fn parse(spec: &str, next_base: u64) -> Result<Self, MemoryError> {
        let fields: Vec<&str> = spec.splitn(3, '@').collect();
        let [base, size, name] = fields[..] else {
            return Err(ConfigError::RegionSyntax {
                input: spec.to_string(),
            }
            .into());
        };

        let base = if base.is_empty() {
            next_base
        } else {
            parse_size(base, "")?
        };

        let backing = if name.is_empty() {
            Backing::Anonymous
        } else {
            Backing::File(PathBuf::from(name))
        };

        let size = match (size.is_empty(), &backing) {
            (false, _) => parse_size(size, "")?,
            (true, Backing::File(path)) => file_len(path, base)?,
            (true, Backing::Anonymous) => 0,
        };
        if size == 0 {
            return Err(ConfigError::RegionEmpty {
                input: spec.to_string(),
            }
            .into());
        }

        Ok(Self {
            name: name.to_string(),
            base,
            size,
            backing,
            data: None,
        })
    }

    /// Map the region's backing into the host address space.
    ///
    /// Anonymous regions get a zero-filled `MAP_SHARED` mapping of exactly
    /// `size` bytes.  File regions are opened read-write and `size` bytes
    /// from offset 0 are mapped `MAP_SHARED`; a regular file shorter than
    /// `size` is rejected before `mmap` is attempted.  On error the region
    /// stays unmapped.
    pub fn map(&mut self) -> Result<(), MemoryError> {
        if self.data.is_some() {
            return Ok(());
        }
        if self.base % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned { base: self.base });
        }
        let len = usize::try_from(self.size)
            .ok()
            .filter(|_| self.size % PAGE_SIZE == 0)
            .ok_or(MemoryError::BadSize {
                base: self.base,
                size: self.size,
            })?;

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let mapping = match &self.backing {
            Backing::Anonymous => MmapRegion::build(
                None,
                len,
                prot,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            ),
            Backing::File(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| MemoryError::Open {
                        path: path.clone(),
                        base: self.base,
                        source,
                    })?;
                let meta = file.metadata().map_err(|source| MemoryError::Open {
                    path: path.clone(),
                    base: self.base,
                    source,
                })?;
                if meta.is_file() && meta.len() < self.size {
                    return Err(MemoryError::FileTooSmall {
                        path: path.clone(),
                        size: self.size,
                        available: meta.len(),
                    });
                }
                MmapRegion::build(Some(FileOffset::new(file, 0)), len, prot, libc::MAP_SHARED)
            }
        }
        .map_err(|source| MemoryError::Map {
            name: self.name.clone(),
            base: self.base,
            size: self.size,
            source,
        })?;

        info!(
            "Mapped region {:?} at {:#x}: {} MB ({})",
            self.name,
            self.base,
            self.size >> 20,
            match self.backing {
                Backing::Anonymous => "anonymous",
                Backing::File(_) => "file",
            },
        );
        self.data = Some(mapping);
        Ok(())
    }

    /// Copy bytes out of the mapping starting at `offset` into the region.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let address = self.base + offset as u64;
        let data = self
            .data
            .as_ref()
            .ok_or(MemoryError::Unmapped { base: self.base })?;
        data.as_volatile_slice()
            .read_slice(buf, offset)
            .map_err(|_| MemoryError::Read { address })
    }

    /// Region file name; empty for anonymous regions.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guest physical base address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// First guest physical address past the region.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_mapped(&self) -> bool {
        self.data.is_some()
    }
}

fn file_len(path: &Path, base: u64) -> Result<u64, MemoryError> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| MemoryError::Open {
            path: path.to_path_buf(),
            base,
            source,
        })
}

/// Parse a list of region specs, threading the "next free" address.
///
/// Each region with an empty base is placed directly after the region
/// parsed before it; the first defaults to guest physical address 0.
pub fn parse_regions<S: AsRef<str>>(specs: &[S]) -> Result<Vec<MemoryRegion>, MemoryError> {
    let mut next_base = 0;
    let mut regions = Vec::with_capacity(specs.len());
    for spec in specs {
        let region = MemoryRegion::parse(spec.as_ref(), next_base)?;
        next_base = region.end();
        regions.push(region);
    }
    Ok(regions)
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestMemoryManager
// ═══════════════════════════════════════════════════════════════════════

/// A mapped region as seen from the host: where the guest sees it and
/// where its bytes live in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRegion {
    pub guest_phys_addr: u64,
    pub size: u64,
    pub host_addr: u64,
}

/// One entry of the E820 memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

/// Owns every mapped guest region as a single [`GuestMemoryMmap`].
///
/// Regions are kept sorted by guest address.  The mappings are released
/// when the manager is dropped.
pub struct GuestMemoryManager {
    memory: GuestMemoryMmap,
    regions: Vec<HostRegion>,
}

impl GuestMemoryManager {
    /// Take ownership of mapped regions and assemble guest memory.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::Empty`] if `regions` is empty.
    /// - [`MemoryError::Unmapped`] if a region was never mapped.
    /// - [`MemoryError::Overlap`] / [`MemoryError::MmioOverlap`] if the
    ///   regions collide with each other or the device window.
    pub fn new(mut regions: Vec<MemoryRegion>) -> Result<Self, MemoryError> {
        if regions.is_empty() {
            return Err(MemoryError::Empty);
        }
        regions.sort_by_key(|r| r.base);

        for pair in regions.windows(2) {
            if pair[1].base < pair[0].end() {
                return Err(MemoryError::Overlap {
                    base: pair[1].base,
                    other: pair[0].base,
                });
            }
        }
        for region in &regions {
            if region.base < MMIO_GAP_END && region.end() > MMIO_GAP_START {
                return Err(MemoryError::MmioOverlap {
                    base: region.base,
                    end: region.end(),
                });
            }
        }

        let mut mapped = Vec::with_capacity(regions.len());
        for region in regions {
            let base = region.base;
            let data = region.data.ok_or(MemoryError::Unmapped { base })?;
            let region = GuestRegionMmap::new(data, GuestAddress(base))
                .map_err(MemoryError::Assemble)?;
            mapped.push(region);
        }
        let memory = GuestMemoryMmap::from_regions(mapped).map_err(MemoryError::Assemble)?;

        let regions: Vec<HostRegion> = memory
            .iter()
            .map(|r| HostRegion {
                guest_phys_addr: r.start_addr().0,
                size: r.len(),
                host_addr: r.as_ptr() as u64,
            })
            .collect();

        info!(
            "Guest memory assembled: {} region(s), {} MB total",
            regions.len(),
            regions.iter().map(|r| r.size).sum::<u64>() >> 20,
        );

        Ok(Self { memory, regions })
    }

    /// Parse, map and assemble regions from spec strings.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, MemoryError> {
        let mut regions = parse_regions(specs)?;
        for region in &mut regions {
            region.map()?;
        }
        Self::new(regions)
    }

    /// A single anonymous region of `size` bytes at guest address 0.
    pub fn anonymous(size: u64) -> Result<Self, MemoryError> {
        let mut region = MemoryRegion::anonymous(0, size);
        region.map()?;
        Self::new(vec![region])
    }

    /// Host-side descriptors of every region, sorted by guest address.
    pub fn host_regions(&self) -> &[HostRegion] {
        &self.regions
    }

    /// The region containing guest physical address 0, if any.
    pub fn low_region(&self) -> Option<&HostRegion> {
        self.regions.first().filter(|r| r.guest_phys_addr == 0)
    }

    /// Build the E820 map from the mapped regions.
    ///
    /// The region at address 0 is split around the legacy hole into
    /// `[0, LOW_MEMORY_END)` and `[HIMEM_START, end)`; all other regions
    /// are reported whole.
    pub fn e820_map(&self) -> Result<Vec<E820Entry>, MemoryError> {
        let mut map = Vec::with_capacity(self.regions.len() + 1);
        for region in &self.regions {
            let end = region.guest_phys_addr + region.size;
            if region.guest_phys_addr == 0 {
                map.push(E820Entry {
                    addr: 0,
                    size: LOW_MEMORY_END.min(end),
                    type_: E820_RAM,
                });
                if end > HIMEM_START {
                    map.push(E820Entry {
                        addr: HIMEM_START,
                        size: end - HIMEM_START,
                        type_: E820_RAM,
                    });
                }
            } else {
                map.push(E820Entry {
                    addr: region.guest_phys_addr,
                    size: region.size,
                    type_: E820_RAM,
                });
            }
        }
        if map.len() > E820_MAX_ENTRIES {
            return Err(MemoryError::TooManyEntries { count: map.len() });
        }
        Ok(map)
    }

    /// Write a plain-old-data value into guest memory.
    pub fn write_obj<T>(&self, val: T, address: u64) -> Result<(), MemoryError>
    where
        T: vm_memory::ByteValued,
    {
        self.memory
            .write_obj(val, GuestAddress(address))
            .map_err(|_| MemoryError::Write { address })
    }

    /// Write raw bytes into guest memory.
    pub fn write_slice(&self, data: &[u8], address: u64) -> Result<(), MemoryError> {
        self.memory
            .write_slice(data, GuestAddress(address))
            .map_err(|_| MemoryError::Write { address })
    }

    /// Read raw bytes from guest memory.
    pub fn read_slice(&self, buf: &mut [u8], address: u64) -> Result<(), MemoryError> {
        self.memory
            .read_slice(buf, GuestAddress(address))
            .map_err(|_| MemoryError::Read { address })
    }

    /// The underlying [`GuestMemoryMmap`], for `linux-loader` and devices.
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Total bytes of guest RAM across all regions.
    pub fn size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
