//! Virtio network device whose wire is a host tap interface.
//!
//! Two queues: receiveq (0) and transmitq (1).  Every buffer starts with
//! a 12-byte `virtio_net_hdr_v1`; TX strips it before the frame reaches
//! the tap and RX prepends a zeroed one.  Frames read from the tap wait
//! in a bounded backlog until the guest posts receive buffers, and a
//! [`NetWorker`] thread polls receiveq whenever the tap becomes readable.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use super::virtio_mmio::{Descriptor, Queue, VirtioBackend, VirtioMmioDevice, VIRTIO_F_VERSION_1};
use crate::tap::{TapDevice, TapError};

/// Virtio device type for network cards.
pub const VIRTIO_ID_NET: u32 = 1;

const VIRTIO_NET_F_MAC: u64 = 1 << 5;

pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;

/// `sizeof(struct virtio_net_hdr_v1)`.
pub const NET_HDR_LEN: usize = 12;

/// Largest frame read from the tap.
const MAX_FRAME_LEN: usize = 65562;

/// Frames held while the guest has no receive buffers posted.
pub const RX_BACKLOG_FRAMES: usize = 256;

/// Locally administered MAC used unless the caller picks one.
pub const DEFAULT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Frame-at-a-time host side of the NIC.
pub trait Wire: Send + Sync {
    /// One frame, or `None` if none is ready.
    fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<usize>, TapError>;
    fn send_frame(&self, frame: &[u8]) -> Result<usize, TapError>;
}

impl Wire for TapDevice {
    fn recv_frame(&self, buf: &mut [u8]) -> Result<Option<usize>, TapError> {
        self.read(buf)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<usize, TapError> {
        self.write(frame)
    }
}

pub struct VirtioNet<W: Wire = TapDevice> {
    wire: Arc<W>,
    mac: [u8; 6],
    backlog: VecDeque<Vec<u8>>,
    dropped: u64,
}

impl<W: Wire> VirtioNet<W> {
    pub fn new(wire: Arc<W>, mac: [u8; 6]) -> Self {
        Self {
            wire,
            mac,
            backlog: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Frames discarded because the backlog was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Move everything the tap has into the backlog.
    fn drain_wire(&mut self) {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            match self.wire.recv_frame(&mut buf) {
                Ok(Some(0)) | Ok(None) => return,
                Ok(Some(n)) => {
                    if self.backlog.len() >= RX_BACKLOG_FRAMES {
                        self.dropped += 1;
                        warn!("virtio-net RX backlog full, dropped {n}-byte frame");
                        continue;
                    }
                    self.backlog.push_back(buf[..n].to_vec());
                }
                Err(e) => {
                    warn!("virtio-net RX: {e}");
                    return;
                }
            }
        }
    }

    fn process_rx(&mut self, queue: &mut Queue, mem: &GuestMemoryMmap) -> bool {
        self.drain_wire();
        let mut used = false;
        while !self.backlog.is_empty() {
            let Some(head) = queue.pop_avail(mem) else {
                break;
            };
            let written = match queue.chain(mem, head) {
                Some(chain) => {
                    let Some(frame) = self.backlog.pop_front() else {
                        break;
                    };
                    let hdr = [0u8; NET_HDR_LEN];
                    write_chain(mem, &chain, &[&hdr, &frame])
                }
                None => {
                    warn!("virtio-net RX: malformed chain at head {head}");
                    0
                }
            };
            used |= queue.add_used(mem, head, written);
        }
        used
    }

    fn process_tx(&mut self, queue: &mut Queue, mem: &GuestMemoryMmap) -> bool {
        let mut used = false;
        while let Some(head) = queue.pop_avail(mem) {
            match queue.chain(mem, head).map(|chain| read_chain(mem, &chain)) {
                Some(Some(packet)) if packet.len() > NET_HDR_LEN => {
                    if let Err(e) = self.wire.send_frame(&packet[NET_HDR_LEN..]) {
                        warn!("virtio-net TX: {e}");
                    }
                }
                Some(Some(packet)) => {
                    debug!("virtio-net TX: {}-byte chain has no frame", packet.len())
                }
                _ => warn!("virtio-net TX: malformed chain at head {head}"),
            }
            used |= queue.add_used(mem, head, 0);
        }
        used
    }
}

/// Gather the device-readable part of a chain.
fn read_chain(mem: &GuestMemoryMmap, chain: &[Descriptor]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for desc in chain.iter().filter(|d| !d.is_write_only()) {
        let start = out.len();
        out.resize(start + desc.len as usize, 0);
        mem.read_slice(&mut out[start..], GuestAddress(desc.addr)).ok()?;
    }
    Some(out)
}

/// Scatter `parts` into the device-writable part of a chain.  Returns
/// the bytes written; anything that does not fit is truncated.
fn write_chain(mem: &GuestMemoryMmap, chain: &[Descriptor], parts: &[&[u8]]) -> u32 {
    let mut bufs = chain.iter().filter(|d| d.is_write_only());
    let mut current = bufs.next().map(|d| (d.addr, d.len as usize));
    let mut written = 0usize;
    for part in parts {
        let mut part = *part;
        while !part.is_empty() {
            let Some((addr, room)) = current.as_mut() else {
                return written as u32;
            };
            if *room == 0 {
                current = bufs.next().map(|d| (d.addr, d.len as usize));
                continue;
            }
            let n = part.len().min(*room);
            if mem.write_slice(&part[..n], GuestAddress(*addr)).is_err() {
                return written as u32;
            }
            *addr += n as u64;
            *room -= n;
            written += n;
            part = &part[n..];
        }
    }
    written as u32
}

impl<W: Wire + 'static> VirtioBackend for VirtioNet<W> {
    fn device_type(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_NET_F_MAC
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn process_queue(&mut self, index: usize, queue: &mut Queue, mem: &GuestMemoryMmap) -> bool {
        match index {
            RX_QUEUE => self.process_rx(queue, mem),
            TX_QUEUE => self.process_tx(queue, mem),
            _ => false,
        }
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // Only the MAC is populated; status and the rest read as zero.
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = usize::try_from(offset)
                .ok()
                .and_then(|o| self.mac.get(o + i))
                .copied()
                .unwrap_or(0);
        }
    }

    fn reset(&mut self) {
        self.backlog.clear();
    }
}

// ─── Readiness worker ────────────────────────────────────────────────

const TOKEN_TAP: u64 = 0;
const TOKEN_STOP: u64 = 1;

/// Polls receiveq of a NIC whenever its tap has frames.
pub struct NetWorker {
    stop: EventFd,
    handle: Option<JoinHandle<()>>,
}

impl NetWorker {
    pub fn spawn(tap: RawFd, device: Arc<Mutex<VirtioMmioDevice>>) -> io::Result<Self> {
        let stop = EventFd::new(libc::EFD_NONBLOCK)?;
        let epoll = Epoll::new()?;
        // Edge-triggered: receiveq is drained to WouldBlock on every poll,
        // and frames that arrive before the driver is up wait in the tap
        // until the first receiveq notify.
        epoll.ctl(
            ControlOperation::Add,
            tap,
            EpollEvent::new(EventSet::IN | EventSet::EDGE_TRIGGERED, TOKEN_TAP),
        )?;
        epoll.ctl(
            ControlOperation::Add,
            stop.as_raw_fd(),
            EpollEvent::new(EventSet::IN, TOKEN_STOP),
        )?;
        let handle = thread::Builder::new()
            .name("virtio-net".into())
            .spawn(move || run_worker(epoll, device))?;
        info!("virtio-net worker started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.stop.write(1) {
                warn!("virtio-net worker stop signal failed: {e}");
                return;
            }
            let _ = handle.join();
            info!("virtio-net worker stopped");
        }
    }
}

impl Drop for NetWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(epoll: Epoll, device: Arc<Mutex<VirtioMmioDevice>>) {
    let mut events = [EpollEvent::default(); 4];
    loop {
        let n = match epoll.wait(-1, &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("virtio-net worker epoll failed: {e}");
                return;
            }
        };
        for event in &events[..n] {
            match event.data() {
                TOKEN_STOP => return,
                TOKEN_TAP => device
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .poll_queue(RX_QUEUE),
                _ => {}
            }
        }
    }
}
