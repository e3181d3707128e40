//! Virtio MMIO transport (version 2, no legacy interface).
//!
//! [`VirtioMmioDevice`] implements the register window a guest virtio
//! driver discovers, negotiates features through, and sets up split
//! virtqueues with.  Device behaviour is delegated to a
//! [`VirtioBackend`].  A `QUEUE_NOTIFY` write is handled synchronously on
//! the exiting vCPU thread; backends with host-side events (tap RX) are
//! driven from their own thread through [`VirtioMmioDevice::poll_queue`].

use std::sync::atomic::{fence, Ordering};

use log::{debug, info, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::BusDevice;
use crate::interrupt::IrqSender;

// ─── Register offsets ────────────────────────────────────────────────

const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00C;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_READY: u64 = 0x044;
const QUEUE_NOTIFY: u64 = 0x050;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const QUEUE_DESC_LOW: u64 = 0x080;
const QUEUE_DESC_HIGH: u64 = 0x084;
const QUEUE_DRIVER_LOW: u64 = 0x090;
const QUEUE_DRIVER_HIGH: u64 = 0x094;
const QUEUE_DEVICE_LOW: u64 = 0x0A0;
const QUEUE_DEVICE_HIGH: u64 = 0x0A4;
const CONFIG_GENERATION: u64 = 0x0FC;
const CONFIG: u64 = 0x100;

/// "virt", little-endian.
const MAGIC: u32 = 0x7472_6976;
const MMIO_VERSION: u32 = 2;
const VENDOR: u32 = 0x554D_4551;

/// Largest queue the driver may configure.
pub const QUEUE_SIZE_MAX: u16 = 256;

/// Size of one device's register window.
pub const MMIO_WINDOW_SIZE: u64 = 0x1000;

/// Feature bit every modern device offers.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

const STATUS_FEATURES_OK: u32 = 8;
const STATUS_DRIVER_OK: u32 = 4;

const INT_VRING: u32 = 1;

/// The `virtio_mmio.device=` kernel parameter announcing a device.
pub fn cmdline_entry(base: u64, irq: u32) -> String {
    format!("virtio_mmio.device={}K@{:#x}:{}", MMIO_WINDOW_SIZE >> 10, base, irq)
}

// ─── Split virtqueue ─────────────────────────────────────────────────

/// One entry of a descriptor table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    /// The device writes this buffer; otherwise it only reads it.
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// Device-side view of a split virtqueue configured by the driver.
#[derive(Clone, Debug)]
pub struct Queue {
    size: u16,
    ready: bool,
    desc_table: u64,
    avail_ring: u64,
    used_ring: u64,
    next_avail: u16,
    next_used: u16,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            size: QUEUE_SIZE_MAX,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            next_avail: 0,
            next_used: 0,
        }
    }
}

impl Queue {
    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn is_valid(&self) -> bool {
        self.ready && self.size > 0 && self.size <= QUEUE_SIZE_MAX && self.size.is_power_of_two()
    }

    /// Head index of the next chain the driver made available.
    pub fn pop_avail(&mut self, mem: &GuestMemoryMmap) -> Option<u16> {
        if !self.is_valid() {
            return None;
        }
        let avail_idx: u16 = mem.read_obj(GuestAddress(self.avail_ring + 2)).ok()?;
        if avail_idx == self.next_avail {
            return None;
        }
        // Ring entries are only valid after the index that published them.
        fence(Ordering::Acquire);
        let slot = u64::from(self.next_avail % self.size);
        let head = mem.read_obj(GuestAddress(self.avail_ring + 4 + slot * 2)).ok()?;
        self.next_avail = self.next_avail.wrapping_add(1);
        Some(head)
    }

    /// Whether the driver has published chains not yet popped.
    pub fn has_avail(&self, mem: &GuestMemoryMmap) -> bool {
        self.is_valid()
            && mem
                .read_obj::<u16>(GuestAddress(self.avail_ring + 2))
                .is_ok_and(|idx| idx != self.next_avail)
    }

    fn descriptor(&self, mem: &GuestMemoryMmap, index: u16) -> Option<Descriptor> {
        if index >= self.size {
            return None;
        }
        let mut raw = [0u8; 16];
        mem.read_slice(&mut raw, GuestAddress(self.desc_table + u64::from(index) * 16))
            .ok()?;
        Some(Descriptor {
            addr: u64::from_le_bytes(raw[0..8].try_into().ok()?),
            len: u32::from_le_bytes(raw[8..12].try_into().ok()?),
            flags: u16::from_le_bytes(raw[12..14].try_into().ok()?),
            next: u16::from_le_bytes(raw[14..16].try_into().ok()?),
        })
    }

    /// Descriptors of the chain starting at `head`.
    ///
    /// `None` if the chain runs off the table or is longer than the
    /// queue, which is how a loop shows up.
    pub fn chain(&self, mem: &GuestMemoryMmap, head: u16) -> Option<Vec<Descriptor>> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            let desc = self.descriptor(mem, index)?;
            chain.push(desc);
            if chain.len() > usize::from(self.size) {
                return None;
            }
            if !desc.has_next() {
                return Some(chain);
            }
            index = desc.next;
        }
    }

    /// Return chain `head` to the driver with `len` bytes written.
    pub fn add_used(&mut self, mem: &GuestMemoryMmap, head: u16, len: u32) -> bool {
        if !self.is_valid() {
            return false;
        }
        let slot = u64::from(self.next_used % self.size);
        let elem = self.used_ring + 4 + slot * 8;
        if mem.write_obj(u32::from(head), GuestAddress(elem)).is_err()
            || mem.write_obj(len, GuestAddress(elem + 4)).is_err()
        {
            return false;
        }
        self.next_used = self.next_used.wrapping_add(1);
        // The element must be visible before the index that publishes it.
        fence(Ordering::Release);
        mem.write_obj(self.next_used, GuestAddress(self.used_ring + 2))
            .is_ok()
    }
}

// ─── Backend ─────────────────────────────────────────────────────────

/// Device-specific half of a virtio device.
pub trait VirtioBackend: Send {
    /// Virtio device type (1 = net).
    fn device_type(&self) -> u32;

    /// Feature bits offered to the driver.
    fn features(&self) -> u64;

    fn num_queues(&self) -> usize;

    /// Consume whatever queue `index` has available.
    ///
    /// Returns `true` if any chain was returned to the driver, so the
    /// transport should interrupt.
    fn process_queue(&mut self, index: usize, queue: &mut Queue, mem: &GuestMemoryMmap) -> bool;

    /// Read device config space; `offset` is relative to 0x100.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    /// The driver reset the device.
    fn reset(&mut self) {}
}

// ─── Transport ───────────────────────────────────────────────────────

/// A virtio device behind an MMIO register window.
pub struct VirtioMmioDevice {
    mem: GuestMemoryMmap,
    irq: IrqSender,
    backend: Box<dyn VirtioBackend>,
    queues: Vec<Queue>,
    queue_sel: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    status: u32,
    interrupt_status: u32,
    config_generation: u32,
}

impl VirtioMmioDevice {
    pub fn new(mem: GuestMemoryMmap, irq: IrqSender, backend: Box<dyn VirtioBackend>) -> Self {
        let queues = vec![Queue::default(); backend.num_queues()];
        Self {
            mem,
            irq,
            backend,
            queues,
            queue_sel: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            status: 0,
            interrupt_status: 0,
            config_generation: 0,
        }
    }

    /// Whether the driver finished initialisation.
    pub fn is_activated(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0
    }

    /// Features the driver acknowledged.
    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    /// Run queue `index` from outside a guest exit and interrupt if it
    /// produced anything.
    pub fn poll_queue(&mut self, index: usize) {
        if !self.is_activated() || index >= self.queues.len() {
            return;
        }
        if self
            .backend
            .process_queue(index, &mut self.queues[index], &self.mem)
        {
            self.signal_used();
        }
    }

    fn signal_used(&mut self) {
        self.interrupt_status |= INT_VRING;
        if let Err(e) = self.irq.trigger() {
            warn!("virtio IRQ {} not delivered: {e}", self.irq.line());
        }
    }

    fn selected(&mut self) -> Option<&mut Queue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn set_status(&mut self, val: u32) {
        if val == 0 {
            self.reset();
            return;
        }
        let mut val = val;
        if val & STATUS_FEATURES_OK != 0 && self.driver_features & !self.backend.features() != 0 {
            warn!(
                "driver accepted unoffered features {:#x}",
                self.driver_features & !self.backend.features()
            );
            val &= !STATUS_FEATURES_OK;
        }
        if val & STATUS_DRIVER_OK != 0 && !self.is_activated() {
            info!(
                "virtio device type {} activated, features {:#x}",
                self.backend.device_type(),
                self.driver_features
            );
        }
        self.status = val;
    }

    fn reset(&mut self) {
        debug!("virtio device type {} reset", self.backend.device_type());
        self.queues.fill(Queue::default());
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.status = 0;
        self.interrupt_status = 0;
        self.backend.reset();
    }
}

fn set_low(addr: &mut u64, val: u32) {
    *addr = (*addr & !0xFFFF_FFFF) | u64::from(val);
}

fn set_high(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xFFFF_FFFF) | (u64::from(val) << 32);
}

/// Write one 32-bit half of a queue address register.
fn set_queue_address(q: &mut Queue, offset: u64, val: u32) {
    match offset {
        QUEUE_DESC_LOW => set_low(&mut q.desc_table, val),
        QUEUE_DESC_HIGH => set_high(&mut q.desc_table, val),
        QUEUE_DRIVER_LOW => set_low(&mut q.avail_ring, val),
        QUEUE_DRIVER_HIGH => set_high(&mut q.avail_ring, val),
        QUEUE_DEVICE_LOW => set_low(&mut q.used_ring, val),
        QUEUE_DEVICE_HIGH => set_high(&mut q.used_ring, val),
        _ => {}
    }
}

impl BusDevice for VirtioMmioDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= CONFIG {
            self.backend.read_config(offset - CONFIG, data);
            return;
        }
        let val = match offset {
            MAGIC_VALUE => MAGIC,
            VERSION => MMIO_VERSION,
            DEVICE_ID => self.backend.device_type(),
            VENDOR_ID => VENDOR,
            DEVICE_FEATURES => match self.device_features_sel {
                0 => self.backend.features() as u32,
                1 => (self.backend.features() >> 32) as u32,
                _ => 0,
            },
            QUEUE_NUM_MAX => self.selected().map_or(0, |_| u32::from(QUEUE_SIZE_MAX)),
            QUEUE_READY => self.selected().map_or(0, |q| u32::from(q.ready)),
            INTERRUPT_STATUS => self.interrupt_status,
            STATUS => self.status,
            CONFIG_GENERATION => self.config_generation,
            _ => 0,
        };
        let bytes = val.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        data[len..].fill(0);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if offset >= CONFIG {
            self.backend.write_config(offset - CONFIG, data);
            return;
        }
        let mut buf = [0u8; 4];
        let len = data.len().min(4);
        buf[..len].copy_from_slice(&data[..len]);
        let val = u32::from_le_bytes(buf);

        match offset {
            DEVICE_FEATURES_SEL => self.device_features_sel = val,
            DRIVER_FEATURES => match self.driver_features_sel {
                0 => set_low(&mut self.driver_features, val),
                1 => set_high(&mut self.driver_features, val),
                _ => {}
            },
            DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            QUEUE_SEL => self.queue_sel = val,
            QUEUE_NUM => {
                if let Some(q) = self.selected() {
                    q.size = val as u16;
                }
            }
            QUEUE_READY => {
                if let Some(q) = self.selected() {
                    q.ready = val == 1;
                }
            }
            QUEUE_DESC_LOW
            | QUEUE_DESC_HIGH
            | QUEUE_DRIVER_LOW
            | QUEUE_DRIVER_HIGH
            | QUEUE_DEVICE_LOW
            | QUEUE_DEVICE_HIGH => {
                if let Some(q) = self.selected() {
                    set_queue_address(q, offset, val);
                }
            }
            QUEUE_NOTIFY => self.poll_queue(val as usize),
            INTERRUPT_ACK => self.interrupt_status &= !val,
            STATUS => self.set_status(val),
            _ => debug!("virtio write to read-only register {offset:#x}"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::interrupt::InterruptSignal;
    use std::sync::{Arc, Mutex};

    /// Returns every available chain and records their heads.
    struct Echo {
        features: u64,
        seen: Arc<Mutex<Vec<(usize, u16)>>>,
        resets: Arc<Mutex<u32>>,
    }

    impl VirtioBackend for Echo {
        fn device_type(&self) -> u32 {
            1
        }
        fn features(&self) -> u64 {
            self.features
        }
        fn num_queues(&self) -> usize {
            2
        }
        fn process_queue(
            &mut self,
            index: usize,
            queue: &mut Queue,
            mem: &GuestMemoryMmap,
        ) -> bool {
            let mut any = false;
            while let Some(head) = queue.pop_avail(mem) {
                self.seen.lock().unwrap().push((index, head));
                any |= queue.add_used(mem, head, 7);
            }
            any
        }
        fn read_config(&self, offset: u64, data: &mut [u8]) {
            data.fill(offset as u8 + 0x10);
        }
        fn reset(&mut self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    struct Fixture {
        dev: VirtioMmioDevice,
        mem: GuestMemoryMmap,
        signal: Arc<InterruptSignal>,
        seen: Arc<Mutex<Vec<(usize, u16)>>>,
        resets: Arc<Mutex<u32>>,
    }

    fn fixture() -> Fixture {
        let mem = memory();
        let signal = Arc::new(InterruptSignal::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let resets = Arc::new(Mutex::new(0));
        let backend = Echo {
            features: VIRTIO_F_VERSION_1 | 0x20,
            seen: seen.clone(),
            resets: resets.clone(),
        };
        let dev = VirtioMmioDevice::new(
            mem.clone(),
            IrqSender::new(signal.clone(), 5).unwrap(),
            Box::new(backend),
        );
        Fixture {
            dev,
            mem,
            signal,
            seen,
            resets,
        }
    }

    fn reg(dev: &mut VirtioMmioDevice, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        dev.read(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn set(dev: &mut VirtioMmioDevice, offset: u64, val: u32) {
        dev.write(offset, &val.to_le_bytes());
    }

    /// Configure queue 0 the way a Linux driver does.
    fn bring_up(dev: &mut VirtioMmioDevice) {
        set(dev, STATUS, 1 | 2);
        set(dev, DRIVER_FEATURES_SEL, 1);
        set(dev, DRIVER_FEATURES, 1);
        set(dev, DRIVER_FEATURES_SEL, 0);
        set(dev, DRIVER_FEATURES, 0x20);
        set(dev, STATUS, 1 | 2 | STATUS_FEATURES_OK);
        set(dev, QUEUE_SEL, 0);
        set(dev, QUEUE_NUM, u32::from(SIZE));
        set(dev, QUEUE_DESC_LOW, DESC as u32);
        set(dev, QUEUE_DESC_HIGH, 0);
        set(dev, QUEUE_DRIVER_LOW, AVAIL as u32);
        set(dev, QUEUE_DEVICE_LOW, USED as u32);
        set(dev, QUEUE_READY, 1);
        set(dev, STATUS, 1 | 2 | STATUS_FEATURES_OK | STATUS_DRIVER_OK);
    }

    #[test]
    fn identification_registers() {
        let mut f = fixture();
        assert_eq!(reg(&mut f.dev, MAGIC_VALUE), MAGIC);
        assert_eq!(reg(&mut f.dev, VERSION), 2);
        assert_eq!(reg(&mut f.dev, DEVICE_ID), 1);
        assert_eq!(reg(&mut f.dev, VENDOR_ID), VENDOR);
        assert_eq!(reg(&mut f.dev, QUEUE_NUM_MAX), u32::from(QUEUE_SIZE_MAX));
        set(&mut f.dev, QUEUE_SEL, 2);
        assert_eq!(reg(&mut f.dev, QUEUE_NUM_MAX), 0, "no third queue");
    }

    #[test]
    fn queue_addresses_are_written_in_halves() {
        let mut f = fixture();
        set(&mut f.dev, QUEUE_SEL, 1);
        set(&mut f.dev, QUEUE_DESC_LOW, 0x1000);
        set(&mut f.dev, QUEUE_DESC_HIGH, 0x2);
        set(&mut f.dev, QUEUE_DRIVER_HIGH, 0x3);
        set(&mut f.dev, QUEUE_DRIVER_LOW, 0x4000);
        set(&mut f.dev, QUEUE_DEVICE_LOW, 0x5000);
        let q = &f.dev.queues[1];
        assert_eq!(q.desc_table, 0x2_0000_1000);
        assert_eq!(q.avail_ring, 0x3_0000_4000);
        assert_eq!(q.used_ring, 0x5000);
        assert_eq!(f.dev.queues[0].desc_table, 0);
    }

    #[test]
    fn features_are_read_in_halves() {
        let mut f = fixture();
        assert_eq!(reg(&mut f.dev, DEVICE_FEATURES), 0x20);
        set(&mut f.dev, DEVICE_FEATURES_SEL, 1);
        assert_eq!(reg(&mut f.dev, DEVICE_FEATURES), 1);
        set(&mut f.dev, DEVICE_FEATURES_SEL, 2);
        assert_eq!(reg(&mut f.dev, DEVICE_FEATURES), 0);
    }

    #[test]
    fn unoffered_features_fail_negotiation() {
        let mut f = fixture();
        set(&mut f.dev, DRIVER_FEATURES, 0x40);
        set(&mut f.dev, STATUS, 1 | 2 | STATUS_FEATURES_OK);
        assert_eq!(reg(&mut f.dev, STATUS) & STATUS_FEATURES_OK, 0);
    }

    #[test]
    fn notify_processes_queue_and_interrupts() {
        let mut f = fixture();
        bring_up(&mut f.dev);
        assert!(f.dev.is_activated());
        assert_eq!(f.dev.driver_features(), VIRTIO_F_VERSION_1 | 0x20);
        let _ = f.signal.take();

        write_desc(&f.mem, 3, readable(BUFFERS, 64, None));
        publish(&f.mem, 3);
        set(&mut f.dev, QUEUE_NOTIFY, 0);

        assert_eq!(*f.seen.lock().unwrap(), vec![(0, 3)]);
        assert_eq!(used(&f.mem, 0), (3, 7, 1));
        assert_eq!(reg(&mut f.dev, INTERRUPT_STATUS), INT_VRING);
        assert_eq!(f.signal.take(), 1 << 5);

        set(&mut f.dev, INTERRUPT_ACK, INT_VRING);
        assert_eq!(reg(&mut f.dev, INTERRUPT_STATUS), 0);
    }

    #[test]
    fn notify_before_driver_ok_is_ignored() {
        let mut f = fixture();
        publish(&f.mem, 0);
        set(&mut f.dev, QUEUE_NOTIFY, 0);
        assert!(f.seen.lock().unwrap().is_empty());
        assert_eq!(f.signal.take(), 0);
    }

    #[test]
    fn status_zero_resets() {
        let mut f = fixture();
        bring_up(&mut f.dev);
        set(&mut f.dev, STATUS, 0);
        assert!(!f.dev.is_activated());
        assert_eq!(f.dev.driver_features(), 0);
        assert_eq!(reg(&mut f.dev, QUEUE_READY), 0);
        assert_eq!(*f.resets.lock().unwrap(), 1);
    }

    #[test]
    fn config_space_goes_to_backend() {
        let mut f = fixture();
        let mut buf = [0u8; 2];
        f.dev.read(CONFIG + 4, &mut buf);
        assert_eq!(buf, [0x14, 0x14]);
    }

    #[test]
    fn chain_follows_next_links() {
        let mem = memory();
        let q = queue();
        write_desc(&mem, 0, readable(BUFFERS, 12, Some(5)));
        write_desc(&mem, 5, writable(BUFFERS + 0x100, 1500, None));
        let chain = q.chain(&mem, 0).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(!chain[0].is_write_only());
        assert!(chain[1].is_write_only());
        assert_eq!(chain[1].len, 1500);
    }

    #[test]
    fn looping_or_out_of_table_chain_is_rejected() {
        let mem = memory();
        let q = queue();
        write_desc(&mem, 0, readable(BUFFERS, 1, Some(1)));
        write_desc(&mem, 1, readable(BUFFERS, 1, Some(0)));
        assert!(q.chain(&mem, 0).is_none());

        write_desc(&mem, 2, readable(BUFFERS, 1, Some(SIZE)));
        assert!(q.chain(&mem, 2).is_none());
        assert!(q.chain(&mem, SIZE).is_none());
    }

    #[test]
    fn avail_ring_wraps() {
        let mem = memory();
        let mut q = queue();
        for n in 0..(SIZE + 3) {
            publish(&mem, n % SIZE);
            assert!(q.has_avail(&mem));
            assert_eq!(q.pop_avail(&mem), Some(n % SIZE));
            assert!(q.add_used(&mem, n % SIZE, 1));
        }
        assert_eq!(q.pop_avail(&mem), None);
        assert_eq!(used(&mem, SIZE + 2).2, SIZE + 3);
    }

    #[test]
    fn non_power_of_two_queue_is_unusable() {
        let mem = memory();
        let mut q = queue();
        q.size = 12;
        publish(&mem, 0);
        assert_eq!(q.pop_avail(&mem), None);
        assert!(!q.add_used(&mem, 0, 0));
    }

    #[test]
    fn cmdline_announces_window() {
        assert_eq!(cmdline_entry(0xd000_0000, 5), "virtio_mmio.device=4K@0xd0000000:5");
    }
}
