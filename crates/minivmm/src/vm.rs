//! The virtual machine: KVM setup, device wiring and vCPU threads.
//!
//! A [`Vm`] moves through `Created → MemoryMapped → KernelLoaded →
//! Running → {HaltedClean, Error}` and never backwards.  [`Vm::new`]
//! leaves it `MemoryMapped` with every device attached, [`Vm::load_kernel`]
//! makes it `KernelLoaded` and [`Vm::run`] starts one host thread per vCPU.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_PIT_SPEAKER_DUMMY};
use kvm_ioctls::{Kvm, VmFd};
use log::{error, info, warn};
use thiserror::Error;

use crate::acpi::{write_acpi_tables, AcpiError};
use crate::boot::{self, BootError, BootInfo};
use crate::cid::CidAllocator;
use crate::config::{ConfigError, VmConfig};
use crate::cpu::{supported_cpuid, CpuError};
use crate::devices::serial::{spawn_stdin_pump, SerialConsole, COM1_BASE, COM1_LEN, SERIAL_IRQ};
use crate::devices::virtio_mmio::{cmdline_entry, VirtioMmioDevice, MMIO_WINDOW_SIZE};
use crate::devices::virtio_net::{NetWorker, VirtioNet, DEFAULT_MAC};
use crate::devices::{BusError, DeviceManager};
use crate::interrupt::{register_kick_handler, InterruptError, InterruptSignal, IrqSender};
use crate::memory::{GuestMemoryManager, MemoryError, MMIO_GAP_START};
use crate::tap::{TapDevice, TapError};
use crate::vcpu::{Vcpu, VcpuError, VcpuExitReason};
use crate::vsock::{VhostVsockDevice, VsockError};

/// Three pages at the top of the 32-bit space, reserved for KVM's TSS.
/// Must be set before the irqchip is created.
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

/// Guest physical base of the virtio-net MMIO window.
pub const NET_MMIO_BASE: u64 = MMIO_GAP_START;

/// IRQ line of the virtio-net device.
pub const NET_IRQ: u32 = 5;

/// Lifecycle of a [`Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    MemoryMapped,
    KernelLoaded,
    Running,
    HaltedClean,
    Error,
}

impl VmState {
    /// Whether `self → to` is a legal step.
    pub fn can_become(self, to: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, to),
            (Created, MemoryMapped)
                | (MemoryMapped, KernelLoaded)
                | (KernelLoaded, Running)
                | (Running, HaltedClean)
                | (Created | MemoryMapped | KernelLoaded | Running, Error)
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Broad failure classes, for callers that only care which phase broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed configuration; nothing was acquired.
    Config,
    /// A named setup step failed before any guest instruction ran.
    Setup,
    /// Something did not fit: kernel, initrd or memory table.
    Capacity,
    /// A vCPU stopped on a fatal exit.
    Runtime,
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Acpi(#[from] AcpiError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Interrupt(#[from] InterruptError),

    #[error(transparent)]
    Tap(#[from] TapError),

    #[error("failed to map device")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Vsock(#[from] VsockError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error("KVM device path {path:?} contains a NUL byte")]
    KvmPath { path: PathBuf },

    #[error("KVM setup failed: {op}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to start {what} thread")]
    Thread {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("every vCPU thread exited without reporting")]
    VcpusLost,

    #[error("invalid VM state transition {from} -> {to}")]
    InvalidTransition { from: VmState, to: VmState },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::KvmPath { .. } | Self::Memory(MemoryError::Config(_)) => {
                ErrorKind::Config
            }
            Self::Boot(e) if e.is_capacity() => ErrorKind::Capacity,
            Self::Vsock(e) if e.is_capacity() => ErrorKind::Capacity,
            Self::Vcpu(
                VcpuError::Create { .. } | VcpuError::Cpuid(_) | VcpuError::Registers { .. },
            ) => ErrorKind::Setup,
            Self::Vcpu(_) | Self::VcpusLost => ErrorKind::Runtime,
            _ => ErrorKind::Setup,
        }
    }
}

fn kvm_failed(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> VmError {
    move |source| VmError::Kvm { op, source }
}

/// A configured guest and everything it owns.
pub struct Vm {
    state: VmState,
    config: VmConfig,
    cmdline: String,
    // Drop order: workers and backends before vCPUs, vCPUs before the
    // VM fd, the VM fd before the memory it maps.
    net_worker: Option<NetWorker>,
    vsock: Option<VhostVsockDevice>,
    vcpus: Vec<Vcpu>,
    devices: Arc<DeviceManager>,
    fd: Arc<VmFd>,
    _kvm: Kvm,
    memory: GuestMemoryManager,
}

impl Vm {
    /// Build a VM from `config`: map guest memory, create the in-kernel
    /// interrupt controllers, attach devices and create vCPUs.
    ///
    /// `cids` supplies the guest CID when vsock is enabled without a
    /// pinned one.  Any failure releases everything acquired so far.
    pub fn new(config: VmConfig, cids: &mut CidAllocator) -> Result<Self, VmError> {
        config.validate()?;

        let path = CString::new(config.kvm_path.as_os_str().as_bytes()).map_err(|_| {
            VmError::KvmPath {
                path: config.kvm_path.clone(),
            }
        })?;
        let kvm = Kvm::new_with_path(&path).map_err(kvm_failed("open KVM device"))?;
        let fd = Arc::new(kvm.create_vm().map_err(kvm_failed("create VM"))?);

        let memory = GuestMemoryManager::from_specs(&config.region_specs())?;
        for (slot, region) in memory.host_regions().iter().enumerate() {
            let region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: region.guest_phys_addr,
                memory_size: region.size,
                userspace_addr: region.host_addr,
                flags: 0,
            };
            // SAFETY: the mapping is owned by `memory`, which outlives
            // the VM fd (field order in `Vm`).
            unsafe { fd.set_user_memory_region(region) }
                .map_err(kvm_failed("register memory slot"))?;
        }
        info!(
            "mapped {} MiB of guest memory in {} slot(s)",
            memory.size() >> 20,
            memory.host_regions().len()
        );

        fd.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(kvm_failed("set TSS address"))?;
        fd.create_irq_chip().map_err(kvm_failed("create irqchip"))?;
        fd.create_pit2(kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        })
        .map_err(kvm_failed("create PIT"))?;
        register_kick_handler()?;

        let signals: Vec<Arc<InterruptSignal>> = (0..config.num_vcpus)
            .map(|_| Arc::new(InterruptSignal::new()))
            .collect();
        // Device IRQs are asserted by the boot vCPU; the in-kernel
        // PIC/IOAPIC routes them from there.
        let irq_target = &signals[0];

        let mut devices = DeviceManager::new();
        let serial = Arc::new(Mutex::new(SerialConsole::new(
            IrqSender::new(irq_target.clone(), SERIAL_IRQ)?,
            Box::new(io::stdout()),
        )));
        devices
            .pio
            .insert(serial.clone(), u64::from(COM1_BASE), u64::from(COM1_LEN))?;

        let mut cmdline = config.cmdline.clone();
        let mut net_worker = None;
        if let Some(name) = config.tap_name.as_deref().filter(|n| !n.is_empty()) {
            let tap = Arc::new(TapDevice::open(name)?);
            let tap_fd = tap.as_raw_fd();
            let nic = Arc::new(Mutex::new(VirtioMmioDevice::new(
                memory.inner().clone(),
                IrqSender::new(irq_target.clone(), NET_IRQ)?,
                Box::new(VirtioNet::new(tap, DEFAULT_MAC)),
            )));
            devices.mmio.insert(nic.clone(), NET_MMIO_BASE, MMIO_WINDOW_SIZE)?;
            cmdline.push(' ');
            cmdline.push_str(&cmdline_entry(NET_MMIO_BASE, NET_IRQ));
            net_worker = Some(NetWorker::spawn(tap_fd, nic).map_err(|source| {
                VmError::Thread {
                    what: "virtio-net",
                    source,
                }
            })?);
            info!("virtio-net on tap {name:?} at {NET_MMIO_BASE:#x}, IRQ {NET_IRQ}");
        }

        let vsock = match &config.vsock {
            Some(vsock) => {
                let cid = vsock.cid.unwrap_or_else(|| cids.allocate());
                Some(VhostVsockDevice::open(vsock, memory.host_regions(), cid)?)
            }
            None => None,
        };

        let devices = Arc::new(devices);
        let cpuid = supported_cpuid(&kvm)?;
        let num_vcpus = config.num_vcpus as u32;
        let vcpus = signals
            .into_iter()
            .enumerate()
            .map(|(index, signal)| {
                Vcpu::new(
                    index as u32,
                    fd.clone(),
                    &cpuid,
                    num_vcpus,
                    devices.clone(),
                    signal,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!("created {num_vcpus} vCPU(s)");

        if config.serial_input {
            // Blocked on stdin for the life of the process; never joined.
            spawn_stdin_pump(serial).map_err(|source| VmError::Thread {
                what: "serial input",
                source,
            })?;
        }

        let mut vm = Self {
            state: VmState::Created,
            config,
            cmdline,
            net_worker,
            vsock,
            vcpus,
            devices,
            fd,
            _kvm: kvm,
            memory,
        };
        vm.transition(VmState::MemoryMapped)?;
        Ok(vm)
    }

    fn transition(&mut self, to: VmState) -> Result<(), VmError> {
        if !self.state.can_become(to) {
            return Err(VmError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record a failure and hand it back.
    fn fail(&mut self, e: VmError) -> VmError {
        if self.state.can_become(VmState::Error) {
            self.state = VmState::Error;
        }
        e
    }

    /// Load the kernel, initrd and boot tables and point the boot vCPU
    /// at the kernel entry.  One shot: a second call is an invalid
    /// transition.
    pub fn load_kernel(&mut self) -> Result<BootInfo, VmError> {
        if !self.state.can_become(VmState::KernelLoaded) {
            return Err(VmError::InvalidTransition {
                from: self.state,
                to: VmState::KernelLoaded,
            });
        }
        match self.boot_guest() {
            Ok(info) => {
                self.transition(VmState::KernelLoaded)?;
                Ok(info)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn boot_guest(&self) -> Result<BootInfo, VmError> {
        if self.vcpus.len() > 1 {
            let rsdp = write_acpi_tables(&self.memory, self.vcpus.len())?;
            info!("ACPI tables for {} CPUs at {rsdp:#x}", self.vcpus.len());
        }
        let info = boot::load_kernel(
            &self.memory,
            &self.config.kernel,
            self.config.initrd.as_deref(),
            &self.cmdline,
        )?;
        let boot_vcpu = self.vcpus.first().ok_or(VmError::VcpusLost)?;
        boot_vcpu.setup_boot_registers(info.entry)?;
        info!("kernel entry at {:#x}", info.entry);
        Ok(info)
    }

    /// Start every vCPU on its own thread and wait for the first one to
    /// stop.
    ///
    /// No vCPU enters the guest until every thread has been spawned; if a
    /// spawn fails none runs.  A clean halt of the sole vCPU yields
    /// `HaltedClean`; any vCPU error yields `Error`.  Other vCPU threads are
    /// not stopped and their results are logged as they arrive; the caller
    /// is expected to end the process.
    pub fn run(&mut self) -> Result<VcpuExitReason, VmError> {
        self.transition(VmState::Running)?;

        let (tx, rx) = mpsc::channel();
        let jobs = std::mem::take(&mut self.vcpus)
            .into_iter()
            .map(|mut vcpu| {
                let tx = tx.clone();
                Box::new(move || {
                    let index = vcpu.index();
                    let result = vcpu.run();
                    if let Err(mpsc::SendError((index, late))) = tx.send((index, result)) {
                        log_late_stop(index, &late);
                    }
                }) as Job
            })
            .collect();
        drop(tx);

        let spawned = spawn_gated(jobs, |index, job| {
            thread::Builder::new()
                .name(format!("vcpu-{index}"))
                .spawn(job)
        });
        if let Err(source) = spawned {
            return Err(self.fail(VmError::Thread {
                what: "vCPU",
                source,
            }));
        }

        let first = rx.recv();
        let reaper = thread::Builder::new()
            .name("vcpu-reaper".into())
            .spawn(move || {
                for (index, late) in rx {
                    log_late_stop(index, &late);
                }
            });
        if let Err(e) = reaper {
            warn!("cannot watch the remaining vCPUs: {e}");
        }

        match first {
            Ok((_, Ok(reason))) => {
                self.transition(VmState::HaltedClean)?;
                Ok(reason)
            }
            Ok((_, Err(e))) => {
                error!("VM stopped: {e}");
                Err(self.fail(e.into()))
            }
            Err(_) => Err(self.fail(VmError::VcpusLost)),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The kernel command line as it will be written to the guest,
    /// including device announcements.
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn memory(&self) -> &GuestMemoryManager {
        &self.memory
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn vm_fd(&self) -> &VmFd {
        &self.fd
    }

    pub fn vsock(&self) -> Option<&VhostVsockDevice> {
        self.vsock.as_ref()
    }

    pub fn vsock_mut(&mut self) -> Option<&mut VhostVsockDevice> {
        self.vsock.as_mut()
    }

    /// The guest CID, when vsock is enabled.
    pub fn cid(&self) -> Option<u32> {
        self.vsock.as_ref().map(|v| v.cid())
    }

    pub fn has_network(&self) -> bool {
        self.net_worker.is_some()
    }
}

fn log_late_stop(index: u32, result: &Result<VcpuExitReason, VcpuError>) {
    match result {
        Ok(reason) => info!("vCPU {index} stopped after the VM: {reason:?}"),
        Err(e) => error!("vCPU {index} failed after the VM stopped: {e}"),
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Holds a set of threads until they are all released or cancelled.
#[derive(Default)]
struct StartGate {
    go: Mutex<Option<bool>>,
    opened: Condvar,
}

impl StartGate {
    fn open(&self, go: bool) {
        *self.go.lock().unwrap_or_else(|e| e.into_inner()) = Some(go);
        self.opened.notify_all();
    }

    /// Block until opened; `true` means run.
    fn wait(&self) -> bool {
        let mut go = self.go.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(go) = *go {
                return go;
            }
            go = self.opened.wait(go).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Spawn one thread per job with `spawn`, releasing the jobs only once
/// every spawn succeeded.
///
/// On the first spawn error no job runs: the threads already started are
/// cancelled and joined before the error is returned.
fn spawn_gated<S>(jobs: Vec<Job>, mut spawn: S) -> io::Result<()>
where
    S: FnMut(usize, Job) -> io::Result<JoinHandle<()>>,
{
    let gate = Arc::new(StartGate::default());
    let mut handles = Vec::with_capacity(jobs.len());
    for (index, job) in jobs.into_iter().enumerate() {
        let held = gate.clone();
        let gated: Job = Box::new(move || {
            if held.wait() {
                job();
            }
        });
        match spawn(index, gated) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                gate.open(false);
                for handle in handles {
                    if handle.join().is_err() {
                        warn!("cancelled thread panicked");
                    }
                }
                return Err(e);
            }
        }
    }
    gate.open(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless() -> VmConfig {
        VmConfig {
            kernel: PathBuf::from("/nonexistent/bzImage"),
            initrd: None,
            tap_name: None,
            serial_input: false,
            memory_size: 64 << 20,
            ..VmConfig::default()
        }
    }

    fn counting_jobs(n: usize, ran: &Arc<std::sync::atomic::AtomicUsize>) -> Vec<Job> {
        (0..n)
            .map(|_| {
                let ran = ran.clone();
                Box::new(move || {
                    ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }) as Job
            })
            .collect()
    }

    #[test]
    fn gated_jobs_wait_for_every_spawn() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let ran = Arc::new(AtomicUsize::new(0));
        spawn_gated(counting_jobs(4, &ran), |_, job| {
            thread::sleep(std::time::Duration::from_millis(5));
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            Ok(thread::spawn(job))
        })
        .unwrap();
        while ran.load(Ordering::SeqCst) != 4 {
            thread::yield_now();
        }
    }

    #[test]
    fn failed_spawn_runs_no_job() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let ran = Arc::new(AtomicUsize::new(0));
        let err = spawn_gated(counting_jobs(4, &ran), |index, job| {
            if index == 2 {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            Ok(thread::spawn(job))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
        // Both spawned threads were joined before the error came back.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lifecycle_is_one_way() {
        use VmState::*;
        let path = [Created, MemoryMapped, KernelLoaded, Running, HaltedClean];
        for pair in path.windows(2) {
            assert!(pair[0].can_become(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_become(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
        assert!(!Created.can_become(Running));
        assert!(!MemoryMapped.can_become(Running));
        assert!(Running.can_become(Error));
        assert!(!HaltedClean.can_become(Error));
        assert!(!Error.can_become(Running));
        assert!(!Error.can_become(Error));
    }

    #[test]
    fn invalid_config_fails_before_kvm() {
        let config = VmConfig {
            num_vcpus: 0,
            kvm_path: PathBuf::from("/nonexistent/kvm"),
            ..headless()
        };
        let err = Vm::new(config, &mut CidAllocator::seeded(1))
            .err()
            .unwrap();
        assert!(matches!(err, VmError::Config(ConfigError::VcpuCount { count: 0 })));
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn missing_kvm_device_is_setup_error() {
        let config = VmConfig {
            kvm_path: PathBuf::from("/nonexistent/kvm"),
            ..headless()
        };
        let err = Vm::new(config, &mut CidAllocator::seeded(1))
            .err()
            .unwrap();
        assert!(matches!(err, VmError::Kvm { op: "open KVM device", .. }));
        assert_eq!(err.kind(), ErrorKind::Setup);
    }

    #[test]
    fn error_kinds() {
        let capacity = VmError::Boot(BootError::InitrdTooLarge {
            size: 2 << 20,
            available: 1 << 20,
        });
        assert_eq!(capacity.kind(), ErrorKind::Capacity);

        let vsock = VmError::Vsock(VsockError::Capacity { needed: 65, max: 64 });
        assert_eq!(vsock.kind(), ErrorKind::Capacity);

        let runtime = VmError::Vcpu(VcpuError::Shutdown { index: 0 });
        assert_eq!(runtime.kind(), ErrorKind::Runtime);

        let parse = VmError::Memory(MemoryError::Config(ConfigError::SizeSyntax {
            input: "12q".into(),
        }));
        assert_eq!(parse.kind(), ErrorKind::Config);

        let step = VmError::Boot(BootError::UnknownFormat);
        assert_eq!(step.kind(), ErrorKind::Setup);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn missing_kernel_moves_to_error() {
        let mut vm = Vm::new(headless(), &mut CidAllocator::seeded(1)).unwrap();
        assert_eq!(vm.state(), VmState::MemoryMapped);
        assert!(!vm.has_network());
        assert_eq!(vm.cid(), None);

        let err = vm.load_kernel().unwrap_err();
        assert!(matches!(err, VmError::Boot(BootError::Kernel { .. })));
        assert_eq!(vm.state(), VmState::Error);
        assert!(matches!(
            vm.run().unwrap_err(),
            VmError::InvalidTransition {
                from: VmState::Error,
                to: VmState::Running
            }
        ));
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn smp_vm_creates_every_vcpu() {
        let config = VmConfig {
            num_vcpus: 4,
            ..headless()
        };
        let vm = Vm::new(config, &mut CidAllocator::seeded(1)).unwrap();
        assert_eq!(vm.vcpus.len(), 4);
        assert_eq!(vm.memory().size(), 64 << 20);
    }
}
