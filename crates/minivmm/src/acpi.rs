//! ACPI tables for SMP discovery.
//!
//! With more than one vCPU the guest learns about the application
//! processors from the MADT.  Three tables are written into the BIOS
//! area below 1 MB, where the kernel's RSDP scan finds them through the
//! EBDA pointer at `0x40E`:
//!
//! ```text
//! 0xF_0000  RSDP  "RSD PTR "  → RSDT
//! 0xF_0030  RSDT  "RSDT"      → MADT
//! 0xF_0080  MADT  "APIC"      LAPIC × n, IOAPIC × 1
//! ```

use log::info;
use thiserror::Error;

use crate::config::MAX_VCPUS;
use crate::memory::{GuestMemoryManager, MemoryError};

/// Base of the ACPI table area (BIOS read-only region).
pub const ACPI_TABLE_BASE: u64 = 0xF_0000;

const RSDP_ADDR: u64 = ACPI_TABLE_BASE;
const RSDT_ADDR: u64 = ACPI_TABLE_BASE + 0x30;
const MADT_ADDR: u64 = ACPI_TABLE_BASE + 0x80;

/// BDA word holding the EBDA segment.
const EBDA_POINTER: u64 = 0x40E;

const SDT_HEADER_SIZE: usize = 36;
const OEM_ID: &[u8; 6] = b"MINVMM";
const OEM_TABLE_ID: &[u8; 8] = b"MINIVMM ";
const CREATOR_ID: &[u8; 4] = b"MVMM";

const MADT_LAPIC_TYPE: u8 = 0;
const MADT_LAPIC_LEN: usize = 8;
const MADT_IOAPIC_TYPE: u8 = 1;
const MADT_IOAPIC_LEN: usize = 12;
const MADT_PCAT_COMPAT: u32 = 1;
const LAPIC_ENABLED: u32 = 1;

/// Local APIC MMIO base.
pub const LAPIC_ADDR: u32 = 0xFEE0_0000;

/// I/O APIC MMIO base.
pub const IOAPIC_ADDR: u32 = 0xFEC0_0000;

#[derive(Debug, Error)]
pub enum AcpiError {
    #[error("{count} vCPUs exceed the {MAX_VCPUS} supported by the MADT")]
    TooManyCpus { count: usize },
    #[error("failed to write ACPI tables")]
    Memory(#[from] MemoryError),
}

fn checksum(table: &[u8]) -> u8 {
    let sum = table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

/// Standard SDT header; length and checksum are patched by [`finish`].
fn sdt(signature: &[u8; 4], revision: u8, body_len: usize) -> Vec<u8> {
    let mut table = vec![0u8; SDT_HEADER_SIZE + body_len];
    table[0..4].copy_from_slice(signature);
    table[8] = revision;
    table[10..16].copy_from_slice(OEM_ID);
    table[16..24].copy_from_slice(OEM_TABLE_ID);
    table[24..28].copy_from_slice(&1u32.to_le_bytes());
    table[28..32].copy_from_slice(CREATOR_ID);
    table[32..36].copy_from_slice(&1u32.to_le_bytes());
    table
}

fn finish(mut table: Vec<u8>) -> Vec<u8> {
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table[9] = checksum(&table);
    table
}

/// ACPI 1.0 RSDP (20 bytes).
fn build_rsdp(rsdt: u32) -> Vec<u8> {
    let mut rsdp = vec![0u8; 20];
    rsdp[0..8].copy_from_slice(b"RSD PTR ");
    rsdp[9..15].copy_from_slice(OEM_ID);
    rsdp[16..20].copy_from_slice(&rsdt.to_le_bytes());
    rsdp[8] = checksum(&rsdp);
    rsdp
}

fn build_rsdt(entries: &[u32]) -> Vec<u8> {
    let mut rsdt = sdt(b"RSDT", 1, entries.len() * 4);
    for (i, addr) in entries.iter().enumerate() {
        let off = SDT_HEADER_SIZE + i * 4;
        rsdt[off..off + 4].copy_from_slice(&addr.to_le_bytes());
    }
    finish(rsdt)
}

/// MADT with one enabled LAPIC per vCPU (UID = APIC ID = index) and the
/// I/O APIC at GSI 0.
fn build_madt(num_cpus: usize) -> Vec<u8> {
    let mut madt = sdt(b"APIC", 4, 8 + num_cpus * MADT_LAPIC_LEN + MADT_IOAPIC_LEN);
    let mut off = SDT_HEADER_SIZE;
    madt[off..off + 4].copy_from_slice(&LAPIC_ADDR.to_le_bytes());
    madt[off + 4..off + 8].copy_from_slice(&MADT_PCAT_COMPAT.to_le_bytes());
    off += 8;

    for cpu in 0..num_cpus {
        let entry = &mut madt[off..off + MADT_LAPIC_LEN];
        entry[0] = MADT_LAPIC_TYPE;
        entry[1] = MADT_LAPIC_LEN as u8;
        entry[2] = cpu as u8;
        entry[3] = cpu as u8;
        entry[4..8].copy_from_slice(&LAPIC_ENABLED.to_le_bytes());
        off += MADT_LAPIC_LEN;
    }

    let ioapic = &mut madt[off..off + MADT_IOAPIC_LEN];
    ioapic[0] = MADT_IOAPIC_TYPE;
    ioapic[1] = MADT_IOAPIC_LEN as u8;
    ioapic[4..8].copy_from_slice(&IOAPIC_ADDR.to_le_bytes());
    finish(madt)
}

/// Write RSDP, RSDT and MADT for `num_cpus` processors and point the
/// EBDA at them.  Returns the RSDP address.
pub fn write_acpi_tables(mem: &GuestMemoryManager, num_cpus: usize) -> Result<u64, AcpiError> {
    if num_cpus == 0 || num_cpus > MAX_VCPUS {
        return Err(AcpiError::TooManyCpus { count: num_cpus });
    }

    let madt = build_madt(num_cpus);
    mem.write_slice(&madt, MADT_ADDR)?;
    mem.write_slice(&build_rsdt(&[MADT_ADDR as u32]), RSDT_ADDR)?;
    mem.write_slice(&build_rsdp(RSDT_ADDR as u32), RSDP_ADDR)?;
    mem.write_obj((ACPI_TABLE_BASE >> 4) as u16, EBDA_POINTER)?;

    info!(
        "ACPI tables written: RSDP={:#x} RSDT={:#x} MADT={:#x} ({} CPUs)",
        RSDP_ADDR, RSDT_ADDR, MADT_ADDR, num_cpus,
    );
    Ok(RSDP_ADDR)
}
