//! One virtual CPU and its run loop.
//!
//! Every [`Vcpu`] is driven by its own host thread.  The loop enters
//! `KVM_RUN`, dispatches whatever exit comes back to the [`DeviceManager`]
//! and, before entering again, asserts every IRQ line other threads have
//! marked pending on the vCPU's [`InterruptSignal`].  That point between
//! an exit and the next entry is the only place pending interrupts are
//! consumed, so a raise never touches a running vCPU's state.

use std::sync::Arc;

use kvm_bindings::{kvm_fpu, kvm_regs, CpuId};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{debug, error, info};
use thiserror::Error;

use crate::boot::{
    code64_segment, data_segment, tss_segment, BOOT_GDT_OFFSET, BOOT_IDT_OFFSET,
    BOOT_STACK_POINTER, GDT_ENTRY_COUNT, PML4_START, ZERO_PAGE_START,
};
use crate::cpu::{configure_vcpu, CpuError};
use crate::devices::DeviceManager;
use crate::interrupt::{lines, InterruptSignal, ThreadAttachment, VcpuBinding};

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

/// Only the reserved bit set.
const RFLAGS_RESERVED: u64 = 0x2;

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error("failed to create vCPU {index}")]
    Create {
        index: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error(transparent)]
    Cpuid(#[from] CpuError),

    #[error("vCPU {index}: failed to {op}")]
    Registers {
        index: u32,
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU {index}: KVM_RUN failed")]
    Run {
        index: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU {index}: failed to set IRQ line {line}")]
    IrqLine {
        index: u32,
        line: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU {index}: guest shut down (triple fault)")]
    Shutdown { index: u32 },

    #[error("vCPU {index}: VM entry failed, hardware reason {reason:#x}")]
    FailEntry { index: u32, reason: u64 },

    #[error("vCPU {index}: KVM internal error")]
    InternalError { index: u32 },

    #[error("vCPU {index}: unhandled exit {exit}")]
    UnhandledExit { index: u32, exit: String },
}

/// How a run loop that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExitReason {
    /// The sole vCPU executed `HLT`.
    Halted,
}

/// A KVM vCPU wired to the VM's buses and its own interrupt mailbox.
pub struct Vcpu {
    index: u32,
    fd: VcpuFd,
    vm: Arc<VmFd>,
    devices: Arc<DeviceManager>,
    interrupts: Arc<InterruptSignal>,
    num_vcpus: u32,
}

impl Vcpu {
    /// Create vCPU `index` and install its CPUID table.
    ///
    /// Must be called after the in-kernel irqchip exists.
    pub fn new(
        index: u32,
        vm: Arc<VmFd>,
        cpuid: &CpuId,
        num_vcpus: u32,
        devices: Arc<DeviceManager>,
        interrupts: Arc<InterruptSignal>,
    ) -> Result<Self, VcpuError> {
        let fd = vm
            .create_vcpu(u64::from(index))
            .map_err(|source| VcpuError::Create { index, source })?;
        configure_vcpu(&fd, cpuid, index, num_vcpus)?;
        Ok(Self {
            index,
            fd,
            vm,
            devices,
            interrupts,
            num_vcpus,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The mailbox devices use to interrupt this vCPU.
    pub fn interrupts(&self) -> &Arc<InterruptSignal> {
        &self.interrupts
    }

    /// Put the vCPU in 64-bit mode at `entry` with the boot-protocol
    /// register ABI: `rsi` points at the zero page.
    ///
    /// Only the boot vCPU gets this; the others wait for INIT/SIPI from
    /// the guest.
    pub fn setup_boot_registers(&self, entry: u64) -> Result<(), VcpuError> {
        self.setup_sregs()?;
        self.setup_regs(entry)?;
        self.setup_fpu()
    }

    fn registers_error(&self, op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> VcpuError {
        let index = self.index;
        move |source| VcpuError::Registers { index, op, source }
    }

    fn setup_sregs(&self) -> Result<(), VcpuError> {
        let mut sregs = self.fd.get_sregs().map_err(self.registers_error("get sregs"))?;

        sregs.cs = code64_segment();
        let data = data_segment();
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        sregs.tr = tss_segment();

        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = (GDT_ENTRY_COUNT * 8 - 1) as u16;
        sregs.idt.base = BOOT_IDT_OFFSET;
        sregs.idt.limit = 8 - 1;

        sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
        sregs.cr3 = PML4_START;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.efer |= EFER_LME | EFER_LMA;

        self.fd
            .set_sregs(&sregs)
            .map_err(self.registers_error("set sregs"))
    }

    fn setup_regs(&self, entry: u64) -> Result<(), VcpuError> {
        let regs = kvm_regs {
            rip: entry,
            rsp: BOOT_STACK_POINTER,
            rbp: BOOT_STACK_POINTER,
            rsi: ZERO_PAGE_START,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.fd
            .set_regs(&regs)
            .map_err(self.registers_error("set registers"))
    }

    fn setup_fpu(&self) -> Result<(), VcpuError> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.fd.set_fpu(&fpu).map_err(self.registers_error("set FPU"))
    }

    /// Assert every pending line on the in-kernel PIC/IOAPIC.
    ///
    /// Lines are pulsed: raised and immediately lowered, which the
    /// in-kernel PIC latches as an edge.
    fn inject_pending(&self) -> Result<(), VcpuError> {
        for line in lines(self.interrupts.take()) {
            for level in [true, false] {
                self.vm
                    .set_irq_line(line, level)
                    .map_err(|source| VcpuError::IrqLine {
                        index: self.index,
                        line,
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Run until the guest halts for good or the vCPU fails.
    ///
    /// Blocks the calling thread, which becomes the target of kicks from
    /// [`IrqSender`](crate::interrupt::IrqSender)s for the duration.
    pub fn run(&mut self) -> Result<VcpuExitReason, VcpuError> {
        info!("vCPU {} running", self.index);
        let attached = ThreadAttachment::new(self.interrupts.clone());
        // SAFETY: `self.fd` is borrowed for the whole loop and the binding
        // is dropped before this function returns.
        let binding = unsafe { VcpuBinding::bind(&self.fd) };

        let result = self.run_loop();

        drop(binding);
        drop(attached);
        match &result {
            Ok(reason) => info!("vCPU {} stopped: {reason:?}", self.index),
            Err(e) => error!("vCPU {} stopped: {e}", self.index),
        }
        result
    }

    fn run_loop(&mut self) -> Result<VcpuExitReason, VcpuError> {
        let index = self.index;
        loop {
            self.inject_pending()?;

            match self.fd.run() {
                Ok(VcpuExit::IoIn(port, data)) => self.devices.pio_read(port, data),
                Ok(VcpuExit::IoOut(port, data)) => self.devices.pio_write(port, data),
                Ok(VcpuExit::MmioRead(addr, data)) => self.devices.mmio_read(addr, data),
                Ok(VcpuExit::MmioWrite(addr, data)) => self.devices.mmio_write(addr, data),
                Ok(VcpuExit::Hlt) => {
                    if self.num_vcpus == 1 {
                        return Ok(VcpuExitReason::Halted);
                    }
                    debug!("vCPU {index} halted, waiting for an interrupt");
                    self.interrupts.wait_for_pending();
                }
                Ok(VcpuExit::Intr) => self.fd.set_kvm_immediate_exit(0),
                Ok(VcpuExit::Shutdown) => return Err(VcpuError::Shutdown { index }),
                Ok(VcpuExit::FailEntry(reason, _cpu)) => {
                    return Err(VcpuError::FailEntry { index, reason })
                }
                Ok(VcpuExit::InternalError) => return Err(VcpuError::InternalError { index }),
                Ok(other) => {
                    return Err(VcpuError::UnhandledExit {
                        index,
                        exit: format!("{other:?}"),
                    })
                }
                Err(e) if is_kick(&e) => self.fd.set_kvm_immediate_exit(0),
                Err(source) => return Err(VcpuError::Run { index, source }),
            }
        }
    }
}

/// `KVM_RUN` returned because a kick signal arrived or was already
/// pending through `immediate_exit`.
fn is_kick(e: &kvm_ioctls::Error) -> bool {
    matches!(e.errno(), libc::EINTR | libc::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use kvm_bindings::kvm_userspace_memory_region;
    use kvm_ioctls::Kvm;

    use crate::boot::{write_gdt, write_page_tables};
    use crate::cpu::supported_cpuid;
    use crate::devices::BusDevice;
    use crate::memory::GuestMemoryManager;

    #[test]
    fn interrupted_run_is_a_kick() {
        assert!(is_kick(&kvm_ioctls::Error::new(libc::EINTR)));
        assert!(is_kick(&kvm_ioctls::Error::new(libc::EAGAIN)));
        assert!(!is_kick(&kvm_ioctls::Error::new(libc::EFAULT)));
    }

    #[test]
    fn errors_name_the_vcpu() {
        let e = VcpuError::Shutdown { index: 3 };
        assert!(e.to_string().contains("vCPU 3"));
        let e = VcpuError::UnhandledExit {
            index: 1,
            exit: "Debug".into(),
        };
        assert_eq!(e.to_string(), "vCPU 1: unhandled exit Debug");
    }

    #[derive(Default)]
    struct Capture(Vec<u8>);

    impl BusDevice for Capture {
        fn read(&mut self, _offset: u64, data: &mut [u8]) {
            data.fill(0);
        }

        fn write(&mut self, _offset: u64, data: &[u8]) {
            self.0.extend_from_slice(data);
        }
    }

    /// 64-bit code: write "OK" to port 0x3f8, then halt.
    const GUEST_CODE: &[u8] = &[
        0x66, 0xba, 0xf8, 0x03, // mov dx, 0x3f8
        0xb0, b'O', // mov al, 'O'
        0xee, // out dx, al
        0xb0, b'K', // mov al, 'K'
        0xee, // out dx, al
        0xf4, // hlt
    ];

    const CODE_ADDR: u64 = 0x10_0000;

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn boots_long_mode_and_halts() {
        let kvm = Kvm::new().unwrap();
        let vm = Arc::new(kvm.create_vm().unwrap());
        let mem = GuestMemoryManager::anonymous(4 << 20).unwrap();
        for (slot, region) in mem.host_regions().iter().enumerate() {
            let region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: region.guest_phys_addr,
                memory_size: region.size,
                userspace_addr: region.host_addr,
                flags: 0,
            };
            unsafe { vm.set_user_memory_region(region).unwrap() };
        }
        write_gdt(&mem).unwrap();
        write_page_tables(&mem).unwrap();
        mem.write_slice(GUEST_CODE, CODE_ADDR).unwrap();

        let capture = Arc::new(Mutex::new(Capture::default()));
        let mut devices = DeviceManager::new();
        devices.pio.insert(capture.clone(), 0x3f8, 8).unwrap();

        let cpuid = supported_cpuid(&kvm).unwrap();
        let mut vcpu = Vcpu::new(
            0,
            vm,
            &cpuid,
            1,
            Arc::new(devices),
            Arc::new(InterruptSignal::new()),
        )
        .unwrap();
        vcpu.setup_boot_registers(CODE_ADDR).unwrap();

        assert_eq!(vcpu.run().unwrap(), VcpuExitReason::Halted);
        assert_eq!(capture.lock().unwrap().0, b"OK");
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn kick_before_entry_is_not_an_error() {
        let kvm = Kvm::new().unwrap();
        let vm = Arc::new(kvm.create_vm().unwrap());
        let mem = GuestMemoryManager::anonymous(4 << 20).unwrap();
        let region = mem.host_regions()[0];
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: region.guest_phys_addr,
                memory_size: region.size,
                userspace_addr: region.host_addr,
                flags: 0,
            })
            .unwrap()
        };
        write_gdt(&mem).unwrap();
        write_page_tables(&mem).unwrap();
        mem.write_slice(&[0xf4], CODE_ADDR).unwrap();

        let cpuid = supported_cpuid(&kvm).unwrap();
        let mut vcpu = Vcpu::new(
            0,
            vm,
            &cpuid,
            1,
            Arc::new(DeviceManager::new()),
            Arc::new(InterruptSignal::new()),
        )
        .unwrap();
        vcpu.setup_boot_registers(CODE_ADDR).unwrap();

        // As if the kick handler had fired just before KVM_RUN.
        vcpu.fd.set_kvm_immediate_exit(1);
        assert_eq!(vcpu.run().unwrap(), VcpuExitReason::Halted);
    }
}
