//! Per-vCPU CPUID.
//!
//! Every vCPU gets the host-supported CPUID table with its own APIC ID
//! patched in.  Without this all vCPUs report APIC ID 0 and the guest
//! cannot bring up the application processors listed in the MADT.

use kvm_bindings::{kvm_cpuid_entry2, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuFd};
use thiserror::Error;

// ─── CPUID leaf constants ────────────────────────────────────────────

/// Processor Info and Feature Bits.
pub const CPUID_LEAF_FEATURES: u32 = 0x1;

/// Extended Topology Enumeration.
pub const CPUID_LEAF_TOPOLOGY: u32 = 0xB;

/// V2 Extended Topology Enumeration.
pub const CPUID_LEAF_TOPOLOGY_V2: u32 = 0x1F;

/// Leaf 1 EDX: max APIC IDs field is valid.
const EDX_HTT: u32 = 1 << 28;

/// Leaf 1 ECX: running under a hypervisor.
const ECX_HYPERVISOR: u32 = 1 << 31;

#[derive(Error, Debug)]
pub enum CpuError {
    #[error("failed to query supported CPUID")]
    GetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID on vCPU {index}")]
    SetCpuid {
        index: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("CPUID table for vCPU {index} has too many entries")]
    TooManyEntries { index: u32 },
}

/// The host's supported CPUID table, shared by every vCPU.
pub fn supported_cpuid(kvm: &Kvm) -> Result<CpuId, CpuError> {
    kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(CpuError::GetCpuid)
}

/// Copy `base` with the topology leaves rewritten for vCPU `index`.
///
/// - Leaf 1 EBX\[31:24\] is the initial APIC ID and EBX\[23:16\] the
///   addressable ID count, which must cover `num_vcpus`.
/// - Leaves 0xB and 0x1F report the x2APIC ID in EDX on every sub-leaf.
pub fn vcpu_cpuid(base: &CpuId, index: u32, num_vcpus: u32) -> Result<CpuId, CpuError> {
    let mut entries: Vec<kvm_cpuid_entry2> = base.as_slice().to_vec();
    for entry in entries.iter_mut() {
        match entry.function {
            CPUID_LEAF_FEATURES => {
                entry.ebx = (entry.ebx & 0x0000_FFFF) | (index << 24) | ((num_vcpus & 0xff) << 16);
                entry.ecx |= ECX_HYPERVISOR;
                if num_vcpus > 1 {
                    entry.edx |= EDX_HTT;
                }
            }
            CPUID_LEAF_TOPOLOGY | CPUID_LEAF_TOPOLOGY_V2 => entry.edx = index,
            _ => {}
        }
    }
    CpuId::from_entries(&entries).map_err(|_| CpuError::TooManyEntries { index })
}

/// Install the per-vCPU table on `vcpu`.
pub fn configure_vcpu(
    vcpu: &VcpuFd,
    base: &CpuId,
    index: u32,
    num_vcpus: u32,
) -> Result<(), CpuError> {
    let cpuid = vcpu_cpuid(base, index, num_vcpus)?;
    vcpu.set_cpuid2(&cpuid)
        .map_err(|source| CpuError::SetCpuid { index, source })
}
