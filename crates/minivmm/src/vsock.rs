//! Vhost-accelerated vsock transport.
//!
//! Bring-up hands a `/dev/vhost-vsock` backend everything it needs to move
//! packets on its own: the memory table, two fully populated virtqueues
//! (RX = 0, TX = 1) and a kick/call eventfd pair per queue.  The order of
//! control calls is fixed:
//!
//! ```text
//! open → SET_OWNER → [SET_FEATURES] GET_FEATURES → SET_MEM_TABLE
//!      → SET_VRING_KICK/CALL → SET_VRING_NUM/BASE/ADDR → SET_GUEST_CID
//!      → SET_RUNNING(1)
//! ```
//!
//! A failure stops the sequence and names the step.  The handle is then
//! dropped, which closes the control fd and releases the backend's
//! partial state; nothing is retried.  Once running, the host never
//! touches the rings again.
//!
//! Ring memory lives outside guest RAM.  Each ring mapping is entered in
//! the memory table at guest address == host address, so the buffer
//! addresses written into its descriptors translate for the backend.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{info, warn};
use thiserror::Error;
use vm_memory::{Bytes, MmapRegion, VolatileMemory};
use vmm_sys_util::eventfd::EventFd;

use crate::config::{VsockConfig, VsockRoute};
use crate::memory::{HostRegion, PAGE_SIZE};
use crate::vhost::{
    self, VhostControl, VhostMemory, VhostMemoryRegion, VhostVringAddr, VhostVsockFd,
};

/// Virtqueues used by vhost-vsock: RX and TX.
pub const NUM_QUEUES: u32 = 2;

/// Entries per virtqueue.
pub const QUEUE_SIZE: u16 = 256;

/// Bytes per packet buffer.
pub const BUFFER_SIZE: u64 = 2048;

/// Descriptor table, used ring, available ring, log.
pub const HEADER_PAGES: u64 = 4;

/// Pages holding the packet buffers.
pub const BUFFER_PAGES: u64 = QUEUE_SIZE as u64 * BUFFER_SIZE / PAGE_SIZE;

const VRING_DESC_F_WRITE: u16 = 2;

/// Bring-up steps, in order, followed by the stop of a running device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    Open,
    SetOwner,
    Features,
    RingAllocation,
    MemoryTable,
    Notifiers,
    Vrings,
    GuestCid,
    Running,
    Stop,
}

impl fmt::Display for BringUpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::SetOwner => "ownership claim",
            Self::Features => "feature negotiation",
            Self::RingAllocation => "ring allocation",
            Self::MemoryTable => "memory-table registration",
            Self::Notifiers => "notifier registration",
            Self::Vrings => "vring setup",
            Self::GuestCid => "CID assignment",
            Self::Running => "start",
            Self::Stop => "stop",
        })
    }
}

#[derive(Error, Debug)]
pub enum VsockError {
    #[error("vhost-vsock {step} failed")]
    Step {
        step: BringUpStep,
        #[source]
        source: io::Error,
    },

    #[error("failed to map ring memory for virtqueue {index}")]
    Ring {
        index: u32,
        #[source]
        source: vm_memory::mmap::MmapRegionError,
    },

    #[error("failed to populate descriptors of virtqueue {index}")]
    RingWrite { index: u32 },

    #[error("ring memory for virtqueue {index} at {addr:#x} collides with guest memory")]
    RingCollision { index: u32, addr: u64 },

    #[error("memory table needs {needed} regions but the backend accepts {max}")]
    Capacity { needed: usize, max: usize },
}

impl VsockError {
    /// The bring-up step that failed.
    pub fn step(&self) -> BringUpStep {
        match self {
            Self::Step { step, .. } => *step,
            Self::Ring { .. } | Self::RingWrite { .. } => BringUpStep::RingAllocation,
            Self::RingCollision { .. } | Self::Capacity { .. } => BringUpStep::MemoryTable,
        }
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

fn failed(step: BringUpStep) -> impl FnOnce(io::Error) -> VsockError {
    move |source| VsockError::Step { step, source }
}

// ─── Virtqueue ───────────────────────────────────────────────────────

/// Shared ring memory for one vhost virtqueue.
///
/// ```text
/// base + 0 pages   descriptor table (QUEUE_SIZE × 16 bytes)
/// base + 1 page    used ring
/// base + 2 pages   available ring
/// base + 3 pages   log (kept for layout, logging stays off)
/// base + 4 pages   QUEUE_SIZE buffers of BUFFER_SIZE bytes
/// ```
pub struct Virtqueue {
    index: u32,
    ring: MmapRegion,
}

impl Virtqueue {
    /// Map populated, page-aligned ring memory with every descriptor
    /// already pointing at its buffer.
    pub fn new(index: u32) -> Result<Self, VsockError> {
        let len = ((HEADER_PAGES + BUFFER_PAGES) * PAGE_SIZE) as usize;
        let ring = MmapRegion::build(
            None,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
        )
        .map_err(|source| VsockError::Ring { index, source })?;
        let queue = Self { index, ring };
        queue
            .populate()
            .map_err(|_| VsockError::RingWrite { index })?;
        Ok(queue)
    }

    fn populate(&self) -> Result<(), vm_memory::VolatileMemoryError> {
        // RX buffers are filled by the device.
        let flags = if self.index == 0 { VRING_DESC_F_WRITE } else { 0 };
        let table = self.ring.as_volatile_slice();
        for n in 0..QUEUE_SIZE {
            let at = usize::from(n) * 16;
            table.write_obj(self.buffer_addr(n), at)?;
            table.write_obj(BUFFER_SIZE as u32, at + 8)?;
            table.write_obj(flags, at + 12)?;
        }
        Ok(())
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Host address of the first page.
    pub fn base(&self) -> u64 {
        self.ring.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.ring.size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.ring.size() == 0
    }

    pub fn desc_addr(&self) -> u64 {
        self.base()
    }

    pub fn used_addr(&self) -> u64 {
        self.base() + PAGE_SIZE
    }

    pub fn avail_addr(&self) -> u64 {
        self.base() + 2 * PAGE_SIZE
    }

    pub fn log_addr(&self) -> u64 {
        self.base() + 3 * PAGE_SIZE
    }

    /// Address of packet buffer `n`.
    pub fn buffer_addr(&self, n: u16) -> u64 {
        self.base() + HEADER_PAGES * PAGE_SIZE + u64::from(n) * BUFFER_SIZE
    }

    /// `(addr, len, flags)` of descriptor `n` as written to the table.
    pub fn descriptor(&self, n: u16) -> Option<(u64, u32, u16)> {
        if n >= QUEUE_SIZE {
            return None;
        }
        let table = self.ring.as_volatile_slice();
        let at = usize::from(n) * 16;
        Some((
            table.read_obj(at).ok()?,
            table.read_obj(at + 8).ok()?,
            table.read_obj(at + 12).ok()?,
        ))
    }

    pub fn vring_addr(&self) -> VhostVringAddr {
        VhostVringAddr {
            index: self.index,
            flags: 0,
            desc_user_addr: self.desc_addr(),
            used_user_addr: self.used_addr(),
            avail_user_addr: self.avail_addr(),
            log_guest_addr: self.log_addr(),
        }
    }

    /// Identity-mapped memory-table entry for this ring.
    fn table_region(&self) -> VhostMemoryRegion {
        VhostMemoryRegion {
            guest_phys_addr: self.base(),
            memory_size: self.len(),
            userspace_addr: self.base(),
            flags_padding: 0,
        }
    }
}

/// The backend's memory table: guest regions, then the ring mappings.
fn memory_table(
    guest: &[HostRegion],
    queues: &[Virtqueue],
    max_regions: usize,
) -> Result<VhostMemory, VsockError> {
    let needed = guest.len() + queues.len();
    let max = max_regions.min(vhost::VHOST_MAX_MEM_REGIONS);
    if needed > max {
        return Err(VsockError::Capacity { needed, max });
    }
    for q in queues {
        let (start, end) = (q.base(), q.base() + q.len());
        if guest
            .iter()
            .any(|r| start < r.guest_phys_addr + r.size && r.guest_phys_addr < end)
        {
            return Err(VsockError::RingCollision {
                index: q.index,
                addr: start,
            });
        }
    }
    let mut table = VhostMemory::default();
    let regions = guest
        .iter()
        .map(VhostMemoryRegion::from)
        .chain(queues.iter().map(Virtqueue::table_region));
    for region in regions {
        table
            .push(region)
            .map_err(|_| VsockError::Capacity { needed, max })?;
    }
    Ok(table)
}

// ─── Device ──────────────────────────────────────────────────────────

/// A running (or stopped) vhost-vsock device.
///
/// Dropping it stops the backend and closes the control fd before the
/// ring memory is unmapped.
pub struct VhostVsockDevice<C: VhostControl = VhostVsockFd> {
    control: C,
    features: u64,
    table: VhostMemory,
    queues: Vec<Virtqueue>,
    kick: Vec<EventFd>,
    call: Vec<EventFd>,
    cid: u32,
    running: bool,
    routes: Vec<VsockRoute>,
}

impl VhostVsockDevice<VhostVsockFd> {
    /// Open the configured control device and bring it up.
    pub fn open(config: &VsockConfig, guest: &[HostRegion], cid: u32) -> Result<Self, VsockError> {
        let control = VhostVsockFd::open(&config.device).map_err(failed(BringUpStep::Open))?;
        info!("vhost-vsock: opened {:?}", config.device);
        Self::bring_up(
            control,
            guest,
            config.features,
            cid,
            config.routes.clone(),
            vhost::max_mem_regions(),
        )
    }
}

impl<C: VhostControl> VhostVsockDevice<C> {
    /// Run the bring-up sequence on an open control handle.
    pub fn bring_up(
        mut control: C,
        guest: &[HostRegion],
        features: Option<u64>,
        cid: u32,
        routes: Vec<VsockRoute>,
        max_regions: usize,
    ) -> Result<Self, VsockError> {
        control.set_owner().map_err(failed(BringUpStep::SetOwner))?;
        info!("vhost-vsock: ownership claimed");

        if let Some(wanted) = features {
            control
                .set_features(wanted)
                .map_err(failed(BringUpStep::Features))?;
        }
        let features = control
            .get_features()
            .map_err(failed(BringUpStep::Features))?;
        info!("vhost-vsock: features {features:#x}");

        let queues = (0..NUM_QUEUES)
            .map(Virtqueue::new)
            .collect::<Result<Vec<_>, _>>()?;

        let table = memory_table(guest, &queues, max_regions)?;
        control
            .set_mem_table(&table)
            .map_err(failed(BringUpStep::MemoryTable))?;
        info!("vhost-vsock: memory table set, {} regions", table.len());

        let mut kick = Vec::with_capacity(queues.len());
        let mut call = Vec::with_capacity(queues.len());
        for q in &queues {
            let notifier = || {
                EventFd::new(libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
                    .map_err(failed(BringUpStep::Notifiers))
            };
            let k = notifier()?;
            let c = notifier()?;
            control
                .set_vring_kick(q.index(), k.as_raw_fd())
                .map_err(failed(BringUpStep::Notifiers))?;
            control
                .set_vring_call(q.index(), c.as_raw_fd())
                .map_err(failed(BringUpStep::Notifiers))?;
            kick.push(k);
            call.push(c);
        }
        info!("vhost-vsock: kick/call eventfds registered for {} queues", queues.len());

        for q in &queues {
            control
                .set_vring_num(q.index(), QUEUE_SIZE)
                .and_then(|()| control.set_vring_base(q.index(), 0))
                .and_then(|()| control.set_vring_addr(&q.vring_addr()))
                .map_err(failed(BringUpStep::Vrings))?;
            info!("vhost-vsock: vring {} at {:#x}", q.index(), q.base());
        }

        control
            .set_guest_cid(u64::from(cid))
            .map_err(failed(BringUpStep::GuestCid))?;
        info!("vhost-vsock: guest CID {cid}");

        control
            .set_running(true)
            .map_err(failed(BringUpStep::Running))?;
        info!("vhost-vsock: running, {} routes", routes.len());
        for route in &routes {
            info!("vhost-vsock: route {route}");
        }

        Ok(Self {
            control,
            features,
            table,
            queues,
            kick,
            call,
            cid,
            running: true,
            routes,
        })
    }

    /// Stop the backend.  No-op if already stopped.
    pub fn stop(&mut self) -> Result<(), VsockError> {
        if self.running {
            self.control
                .set_running(false)
                .map_err(failed(BringUpStep::Stop))?;
            self.running = false;
            info!("vhost-vsock: stopped");
        }
        Ok(())
    }

    /// Restart a stopped backend.
    pub fn start(&mut self) -> Result<(), VsockError> {
        if !self.running {
            self.control
                .set_running(true)
                .map_err(failed(BringUpStep::Running))?;
            self.running = true;
            info!("vhost-vsock: restarted");
        }
        Ok(())
    }

    /// Move the device to a new CID, stopping it around the change.
    pub fn reassign_cid(&mut self, cid: u32) -> Result<(), VsockError> {
        let was_running = self.running;
        self.stop()?;
        self.control
            .set_guest_cid(u64::from(cid))
            .map_err(failed(BringUpStep::GuestCid))?;
        self.cid = cid;
        info!("vhost-vsock: guest CID {cid}");
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Feature bits the backend accepted.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn routes(&self) -> &[VsockRoute] {
        &self.routes
    }

    pub fn memory_table(&self) -> &VhostMemory {
        &self.table
    }

    pub fn queues(&self) -> &[Virtqueue] {
        &self.queues
    }

    /// Guest-to-host notifier of queue `index`.
    pub fn kick_fd(&self, index: usize) -> Option<RawFd> {
        self.kick.get(index).map(AsRawFd::as_raw_fd)
    }

    /// Host-to-guest notifier of queue `index`.
    pub fn call_fd(&self, index: usize) -> Option<RawFd> {
        self.call.get(index).map(AsRawFd::as_raw_fd)
    }
}

impl<C: VhostControl> Drop for VhostVsockDevice<C> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Owner,
        GetFeatures,
        SetFeatures(u64),
        MemTable(Vec<VhostMemoryRegion>),
        Kick(u32),
        Notify(u32),
        Num(u32, u16),
        Base(u32, u16),
        Addr(VhostVringAddr),
        Cid(u64),
        Running(bool),
    }

    /// Records every control call; optionally fails the first matching one.
    #[derive(Clone)]
    struct Recorder {
        log: Arc<Mutex<Vec<Call>>>,
        fail: Option<fn(&Call) -> bool>,
        accepted: u64,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                fail: None,
                accepted: 0x1_0000_0000,
            }
        }

        fn failing(fail: fn(&Call) -> bool) -> Self {
            Self {
                fail: Some(fail),
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.log.lock().unwrap().clone()
        }

        fn record(&mut self, call: Call) -> io::Result<()> {
            let fail = self.fail.is_some_and(|f| f(&call));
            self.log.lock().unwrap().push(call);
            if fail {
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            } else {
                Ok(())
            }
        }
    }

    impl VhostControl for Recorder {
        fn set_owner(&mut self) -> io::Result<()> {
            self.record(Call::Owner)
        }
        fn get_features(&mut self) -> io::Result<u64> {
            self.record(Call::GetFeatures).map(|()| self.accepted)
        }
        fn set_features(&mut self, features: u64) -> io::Result<()> {
            self.record(Call::SetFeatures(features))
        }
        fn set_mem_table(&mut self, table: &VhostMemory) -> io::Result<()> {
            self.record(Call::MemTable(table.regions().to_vec()))
        }
        fn set_vring_num(&mut self, index: u32, num: u16) -> io::Result<()> {
            self.record(Call::Num(index, num))
        }
        fn set_vring_base(&mut self, index: u32, base: u16) -> io::Result<()> {
            self.record(Call::Base(index, base))
        }
        fn set_vring_addr(&mut self, addr: &VhostVringAddr) -> io::Result<()> {
            self.record(Call::Addr(*addr))
        }
        fn set_vring_kick(&mut self, index: u32, _fd: RawFd) -> io::Result<()> {
            self.record(Call::Kick(index))
        }
        fn set_vring_call(&mut self, index: u32, _fd: RawFd) -> io::Result<()> {
            self.record(Call::Notify(index))
        }
        fn set_guest_cid(&mut self, cid: u64) -> io::Result<()> {
            self.record(Call::Cid(cid))
        }
        fn set_running(&mut self, running: bool) -> io::Result<()> {
            self.record(Call::Running(running))
        }
    }

    fn guest() -> Vec<HostRegion> {
        vec![HostRegion {
            guest_phys_addr: 0,
            size: 256 << 20,
            host_addr: 0x7f12_0000_0000,
        }]
    }

    fn bring_up(control: Recorder) -> Result<VhostVsockDevice<Recorder>, VsockError> {
        VhostVsockDevice::bring_up(control, &guest(), None, 42, Vec::new(), 64)
    }

    fn position(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().position(pred).unwrap()
    }

    #[test]
    fn bring_up_calls_in_order() {
        let rec = Recorder::new();
        let dev = bring_up(rec.clone()).unwrap();
        let calls = rec.calls();

        assert_eq!(calls[0], Call::Owner);
        let table = position(&calls, |c| matches!(c, Call::MemTable(_)));
        let cid = position(&calls, |c| matches!(c, Call::Cid(_)));
        assert!(position(&calls, |c| *c == Call::GetFeatures) < table);
        assert!(table < cid);
        for q in 0..NUM_QUEUES {
            let kick = position(&calls, |c| *c == Call::Kick(q));
            let notify = position(&calls, |c| *c == Call::Notify(q));
            let num = position(&calls, |c| *c == Call::Num(q, QUEUE_SIZE));
            let addr = position(&calls, |c| matches!(c, Call::Addr(a) if a.index == q));
            assert!(table < kick && table < notify);
            assert!(kick < num && notify < num && num < addr && addr < cid);
        }
        assert_eq!(calls.last(), Some(&Call::Running(true)));
        assert_eq!(calls[cid], Call::Cid(42));

        assert!(dev.is_running());
        assert_eq!(dev.cid(), 42);
        assert_eq!(dev.features(), 0x1_0000_0000);
        assert!(dev.kick_fd(1).is_some() && dev.call_fd(1).is_some());
        assert!(dev.kick_fd(2).is_none());
    }

    #[test]
    fn desired_features_are_written_before_read_back() {
        let rec = Recorder::new();
        let _dev = VhostVsockDevice::bring_up(rec.clone(), &guest(), Some(0x5), 3, Vec::new(), 64)
            .unwrap();
        let calls = rec.calls();
        assert_eq!(calls[1], Call::SetFeatures(0x5));
        assert_eq!(calls[2], Call::GetFeatures);
    }

    #[test]
    fn failure_names_step_and_stops_sequence() {
        let rec = Recorder::failing(|c| matches!(c, Call::MemTable(_)));
        let err = bring_up(rec.clone()).err().unwrap();
        assert_eq!(err.step(), BringUpStep::MemoryTable);
        assert!(err.to_string().contains("memory-table registration"));
        assert!(matches!(rec.calls().last(), Some(Call::MemTable(_))));
        assert!(!rec.calls().iter().any(|c| matches!(c, Call::Cid(_) | Call::Running(_))));
    }

    #[test]
    fn failed_start_is_not_stopped_again() {
        let rec = Recorder::failing(|c| *c == Call::Running(true));
        let err = bring_up(rec.clone()).err().unwrap();
        assert_eq!(err.step(), BringUpStep::Running);
        assert_eq!(
            rec.calls().iter().filter(|c| matches!(c, Call::Running(_))).count(),
            1
        );
    }

    #[test]
    fn failed_stop_names_stop_step() {
        let rec = Recorder::failing(|c| *c == Call::Running(false));
        let mut dev = bring_up(rec.clone()).unwrap();
        let err = dev.stop().unwrap_err();
        assert_eq!(err.step(), BringUpStep::Stop);
        assert_eq!(err.to_string(), "vhost-vsock stop failed");
        assert!(dev.is_running());
    }

    #[test]
    fn memory_table_lists_guest_then_rings() {
        let rec = Recorder::new();
        let dev = bring_up(rec.clone()).unwrap();
        let regions = dev.memory_table().regions();
        assert_eq!(regions.len(), 1 + NUM_QUEUES as usize);
        assert_eq!(regions[0].userspace_addr, 0x7f12_0000_0000);
        for (region, q) in regions[1..].iter().zip(dev.queues()) {
            assert_eq!(region.guest_phys_addr, q.base());
            assert_eq!(region.userspace_addr, q.base());
            assert_eq!(region.memory_size, (HEADER_PAGES + BUFFER_PAGES) * PAGE_SIZE);
        }
        let submitted = rec.calls().into_iter().find_map(|c| match c {
            Call::MemTable(r) => Some(r),
            _ => None,
        });
        assert_eq!(submitted.as_deref(), Some(regions));
    }

    #[test]
    fn too_many_regions_is_capacity_error() {
        let regions: Vec<HostRegion> = (0..63u64)
            .map(|n| HostRegion {
                guest_phys_addr: n << 20,
                size: 1 << 20,
                host_addr: 0x7f00_0000_0000 + (n << 20),
            })
            .collect();
        let rec = Recorder::new();
        let err = VhostVsockDevice::bring_up(rec.clone(), &regions, None, 3, Vec::new(), 64)
            .err()
            .unwrap();
        assert!(err.is_capacity());
        assert!(matches!(err, VsockError::Capacity { needed: 65, max: 64 }));
        assert!(!rec.calls().iter().any(|c| matches!(c, Call::MemTable(_))));

        // A lower kernel limit applies too.
        let err = VhostVsockDevice::bring_up(Recorder::new(), &regions[..3], None, 3, Vec::new(), 4)
            .err()
            .unwrap();
        assert!(matches!(err, VsockError::Capacity { needed: 5, max: 4 }));
    }

    #[test]
    fn drop_stops_running_device_once() {
        let rec = Recorder::new();
        let mut dev = bring_up(rec.clone()).unwrap();
        dev.stop().unwrap();
        dev.stop().unwrap();
        drop(dev);
        let stops = rec
            .calls()
            .into_iter()
            .filter(|c| *c == Call::Running(false))
            .count();
        assert_eq!(stops, 1);

        let rec = Recorder::new();
        drop(bring_up(rec.clone()).unwrap());
        assert_eq!(rec.calls().last(), Some(&Call::Running(false)));
    }

    #[test]
    fn cid_reassignment_restarts() {
        let rec = Recorder::new();
        let mut dev = bring_up(rec.clone()).unwrap();
        let before = rec.calls().len();
        dev.reassign_cid(99).unwrap();
        assert_eq!(
            rec.calls()[before..],
            [Call::Running(false), Call::Cid(99), Call::Running(true)]
        );
        assert_eq!(dev.cid(), 99);
        assert!(dev.is_running());
    }

    #[test]
    fn routes_are_carried() {
        let routes = crate::config::parse_routes("17010=unix:port").unwrap();
        let dev =
            VhostVsockDevice::bring_up(Recorder::new(), &guest(), None, 3, routes.clone(), 64)
                .unwrap();
        assert_eq!(dev.routes(), routes.as_slice());
    }

    #[test]
    fn virtqueue_layout() {
        let q = Virtqueue::new(1).unwrap();
        assert_eq!(q.base() % PAGE_SIZE, 0);
        assert_eq!(q.len(), 132 * PAGE_SIZE);
        assert_eq!(q.used_addr(), q.base() + PAGE_SIZE);
        assert_eq!(q.avail_addr(), q.base() + 2 * PAGE_SIZE);
        assert_eq!(q.log_addr(), q.base() + 3 * PAGE_SIZE);
        for n in 0..QUEUE_SIZE {
            let want = q.base() + 4 * PAGE_SIZE + u64::from(n) * 2048;
            assert_eq!(q.buffer_addr(n), want);
            assert_eq!(q.descriptor(n), Some((want, 2048, 0)));
        }
        assert_eq!(q.buffer_addr(QUEUE_SIZE - 1) + BUFFER_SIZE, q.base() + q.len());
        assert!(q.descriptor(QUEUE_SIZE).is_none());

        let addr = q.vring_addr();
        assert_eq!(addr.index, 1);
        assert_eq!(addr.desc_user_addr, q.base());
        assert_eq!(addr.used_user_addr, q.used_addr());
        assert_eq!(addr.avail_user_addr, q.avail_addr());
        assert_eq!(addr.flags, 0);
    }

    #[test]
    fn rx_descriptors_are_device_writable() {
        let q = Virtqueue::new(0).unwrap();
        assert_eq!(q.descriptor(7).map(|d| d.2), Some(VRING_DESC_F_WRITE));
    }

    #[test]
    fn ring_overlapping_guest_is_rejected() {
        let q = Virtqueue::new(1).unwrap();
        let alias = [HostRegion {
            guest_phys_addr: q.base() - PAGE_SIZE,
            size: 2 * PAGE_SIZE,
            host_addr: 0x1000,
        }];
        let err = memory_table(&alias, std::slice::from_ref(&q), 64).err().unwrap();
        assert!(matches!(err, VsockError::RingCollision { index: 1, .. }));
    }

    #[test]
    #[ignore = "needs /dev/vhost-vsock"]
    fn bring_up_real_backend() {
        let mem = crate::memory::GuestMemoryManager::anonymous(16 << 20).unwrap();
        let config = VsockConfig {
            device: vhost::VHOST_VSOCK_DEVICE.into(),
            cid: None,
            features: None,
            routes: Vec::new(),
        };
        let cid = crate::cid::CidAllocator::from_entropy().allocate();
        let mut dev = VhostVsockDevice::open(&config, mem.host_regions(), cid).unwrap();
        assert!(dev.is_running());
        dev.stop().unwrap();
    }
}
