//! minivmm: a minimal KVM virtual machine monitor.
//!
//! Boots a Linux kernel directly (no firmware), runs one host thread per
//! vCPU and gives the guest a serial console, a tap-backed virtio-net
//! device and an in-kernel accelerated vsock transport.
//!
//! # Architecture
//!
//! - [`vm`]: KVM setup, device wiring, the VM lifecycle
//! - [`vcpu`]: boot registers and the per-vCPU run loop
//! - [`interrupt`]: cross-thread IRQ injection into running vCPUs
//! - [`memory`]: guest memory regions and their host mappings
//! - [`boot`]: kernel and initrd loading, boot parameters
//! - [`devices`]: port-I/O and MMIO buses, serial, virtio-mmio, virtio-net
//! - [`vsock`] and [`vhost`]: vhost-vsock bring-up and the vhost ABI
//! - [`tap`]: raw Ethernet I/O on a tap interface
//! - [`config`]: VM configuration and its string grammars

pub mod acpi;
pub mod boot;
pub mod cid;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod interrupt;
pub mod memory;
pub mod tap;
pub mod vcpu;
pub mod vhost;
pub mod vm;
pub mod vsock;

pub use config::VmConfig;
pub use vm::{ErrorKind, Vm, VmError, VmState};
