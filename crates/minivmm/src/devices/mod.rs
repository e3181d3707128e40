//! Guest-visible devices and the exit-dispatch buses they sit on.
//!
//! A vCPU exit for a port or MMIO access is routed through a [`Bus`]: an
//! ordered map from non-overlapping address ranges to devices.  The
//! device sees the access as an offset from the start of its range.
//! [`DeviceManager`] holds one bus for port I/O and one for MMIO and is
//! shared by every vCPU thread.

pub mod serial;
pub mod virtio_mmio;
pub mod virtio_net;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

/// A device reachable through a [`Bus`].
pub trait BusDevice: Send {
    /// Guest read of `data.len()` bytes at `offset` into the range.
    fn read(&mut self, offset: u64, data: &mut [u8]);
    /// Guest write of `data` at `offset` into the range.
    fn write(&mut self, offset: u64, data: &[u8]);
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("range [{base:#x}, +{len:#x}) overlaps an existing device")]
    Overlap { base: u64, len: u64 },
    #[error("device range at {base:#x} is empty or wraps")]
    BadRange { base: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Range {
    base: u64,
    len: u64,
}

/// Address ranges mapped to devices.
#[derive(Default)]
pub struct Bus {
    devices: BTreeMap<Range, Arc<Mutex<dyn BusDevice>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `device` at `[base, base + len)`.
    pub fn insert(
        &mut self,
        device: Arc<Mutex<dyn BusDevice>>,
        base: u64,
        len: u64,
    ) -> Result<(), BusError> {
        let end = base
            .checked_add(len)
            .filter(|_| len > 0)
            .ok_or(BusError::BadRange { base })?;
        let collides = self
            .devices
            .keys()
            .any(|r| base < r.base + r.len && r.base < end);
        if collides {
            return Err(BusError::Overlap { base, len });
        }
        self.devices.insert(Range { base, len }, device);
        Ok(())
    }

    /// The device covering `addr`, with `addr`'s offset into its range.
    fn resolve(&self, addr: u64) -> Option<(u64, &Arc<Mutex<dyn BusDevice>>)> {
        let (range, dev) = self
            .devices
            .range(..=Range {
                base: addr,
                len: u64::MAX,
            })
            .next_back()?;
        (addr - range.base < range.len).then(|| (addr - range.base, dev))
    }

    /// Dispatch a read.  Returns `false` if nothing is mapped at `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, dev)) => {
                dev.lock().unwrap_or_else(|e| e.into_inner()).read(offset, data);
                true
            }
            None => false,
        }
    }

    /// Dispatch a write.  Returns `false` if nothing is mapped at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, dev)) => {
                dev.lock().unwrap_or_else(|e| e.into_inner()).write(offset, data);
                true
            }
            None => false,
        }
    }
}

/// The port-I/O and MMIO buses of one VM.
#[derive(Default)]
pub struct DeviceManager {
    pub pio: Bus,
    pub mmio: Bus,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port read.  Unclaimed ports float high (all ones).
    pub fn pio_read(&self, port: u16, data: &mut [u8]) {
        if !self.pio.read(u64::from(port), data) {
            debug!("unhandled port read {port:#x} ({} bytes)", data.len());
            data.fill(0xff);
        }
    }

    pub fn pio_write(&self, port: u16, data: &[u8]) {
        if !self.pio.write(u64::from(port), data) {
            debug!("unhandled port write {port:#x}: {data:02x?}");
        }
    }

    /// MMIO read.  Unclaimed addresses read as zero.
    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) {
        if !self.mmio.read(addr, data) {
            debug!("unhandled MMIO read {addr:#x} ({} bytes)", data.len());
            data.fill(0);
        }
    }

    pub fn mmio_write(&self, addr: u64, data: &[u8]) {
        if !self.mmio.write(addr, data) {
            debug!("unhandled MMIO write {addr:#x}: {data:02x?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remembers the last write and answers reads with its offset.
    #[derive(Default)]
    struct Recording {
        last_write: Option<(u64, Vec<u8>)>,
    }

    impl BusDevice for Recording {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            data.fill(offset as u8);
        }
        fn write(&mut self, offset: u64, data: &[u8]) {
            self.last_write = Some((offset, data.to_vec()));
        }
    }

    #[test]
    fn dispatch_by_range_with_offsets() {
        let recording = Arc::new(Mutex::new(Recording::default()));
        let mut bus = Bus::new();
        bus.insert(recording.clone(), 0x3f8, 8).unwrap();

        let mut data = [0u8; 1];
        assert!(bus.read(0x3fd, &mut data));
        assert_eq!(data[0], 5);
        assert!(bus.write(0x3f8, &[0x41]));
        assert_eq!(recording.lock().unwrap().last_write, Some((0, vec![0x41])));

        assert!(!bus.read(0x3f7, &mut data));
        assert!(!bus.read(0x400, &mut data));
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let mut bus = Bus::new();
        bus.insert(Arc::new(Mutex::new(Recording::default())), 0x1000, 0x100)
            .unwrap();
        for (base, len) in [(0x1000, 1), (0x10ff, 0x10), (0xf00, 0x101), (0xf00, 0x1000)] {
            assert_eq!(
                bus.insert(Arc::new(Mutex::new(Recording::default())), base, len),
                Err(BusError::Overlap { base, len })
            );
        }
        bus.insert(Arc::new(Mutex::new(Recording::default())), 0x1100, 0x100)
            .unwrap();
        bus.insert(Arc::new(Mutex::new(Recording::default())), 0xf00, 0x100)
            .unwrap();
        assert!(bus.insert(Arc::new(Mutex::new(Recording::default())), 0, 0).is_err());
    }

    #[test]
    fn adjacent_devices_resolve_independently() {
        let a = Arc::new(Mutex::new(Recording::default()));
        let b = Arc::new(Mutex::new(Recording::default()));
        let mut bus = Bus::new();
        bus.insert(a.clone(), 0x100, 0x10).unwrap();
        bus.insert(b.clone(), 0x110, 0x10).unwrap();
        bus.write(0x10f, &[1]);
        bus.write(0x110, &[2]);
        assert_eq!(a.lock().unwrap().last_write, Some((0xf, vec![1])));
        assert_eq!(b.lock().unwrap().last_write, Some((0, vec![2])));
    }

    #[test]
    fn unclaimed_accesses_have_fixed_values() {
        let devices = DeviceManager::new();
        let mut port = [0u8; 2];
        devices.pio_read(0x80, &mut port);
        assert_eq!(port, [0xff, 0xff]);

        let mut mmio = [0xaau8; 4];
        devices.mmio_read(0xfeed_0000, &mut mmio);
        assert_eq!(mmio, [0; 4]);

        devices.pio_write(0x80, &[1]);
        devices.mmio_write(0xfeed_0000, &[1]);
    }
}
