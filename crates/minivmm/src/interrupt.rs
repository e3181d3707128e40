//! Cross-thread interrupt injection.
//!
//! Devices never touch a vCPU directly.  Each vCPU owns an
//! [`InterruptSignal`]: a bitmask of pending IRQ lines plus a way to get
//! the vCPU's attention.  An [`IrqSender`] (held by a device, possibly on
//! another thread) sets a bit and kicks the vCPU thread; the vCPU drains
//! the mask at its next safe dispatch point, after an exit and before
//! re-entering `KVM_RUN`, and asserts the lines on the in-kernel PIC.
//!
//! Kicking uses a real-time signal.  The handler runs on the vCPU thread
//! and sets `immediate_exit` in that thread's `kvm_run`, so a kick that
//! lands just before `KVM_RUN` is entered still makes the ioctl return at
//! once with `EINTR`.  A raise therefore cannot be lost.  The raiser holds
//! the signal's mutex while it notifies and kicks, which also keeps the
//! vCPU thread from detaching and exiting under the kick.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_ioctls::VcpuFd;
use thiserror::Error;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

/// Number of distinct IRQ lines a signal can carry.
pub const IRQ_LINES: u32 = 32;

/// Offset from `SIGRTMIN` of the vCPU kick signal.
const KICK_SIGNAL_OFFSET: libc::c_int = 0;

#[derive(Error, Debug)]
pub enum InterruptError {
    #[error("IRQ line {line} is outside 0..{IRQ_LINES}")]
    LineOutOfRange { line: u32 },

    #[error("failed to install the vCPU kick signal handler")]
    Handler(#[source] vmm_sys_util::errno::Error),

    #[error("failed to kick vCPU thread")]
    Kick(#[source] io::Error),
}

/// The real-time signal used to kick vCPU threads out of `KVM_RUN`.
pub fn kick_signal() -> libc::c_int {
    SIGRTMIN() + KICK_SIGNAL_OFFSET
}

thread_local! {
    static CURRENT_VCPU: Cell<*const VcpuFd> = const { Cell::new(std::ptr::null()) };
}

extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    CURRENT_VCPU.with(|current| {
        let fd = current.get();
        if !fd.is_null() {
            // SAFETY: the pointer is installed by `VcpuBinding` on this
            // thread and cleared before the `VcpuFd` it points to can move
            // or drop.
            unsafe { (*fd.cast_mut()).set_kvm_immediate_exit(1) };
        }
    });
}

/// Install the process-wide kick handler.  Idempotent.
pub fn register_kick_handler() -> Result<(), InterruptError> {
    register_signal_handler(kick_signal(), handle_kick).map_err(InterruptError::Handler)
}

/// Associates the calling thread with a vCPU for the kick handler.
///
/// Cleared on drop.
pub(crate) struct VcpuBinding {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl VcpuBinding {
    /// # Safety
    ///
    /// `fd` must stay at the same address and alive until the returned
    /// binding is dropped.
    pub(crate) unsafe fn bind(fd: &VcpuFd) -> Self {
        CURRENT_VCPU.with(|current| current.set(fd as *const VcpuFd));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for VcpuBinding {
    fn drop(&mut self) {
        CURRENT_VCPU.with(|current| current.set(std::ptr::null()));
    }
}

// ─── InterruptSignal ─────────────────────────────────────────────────

/// Pending-IRQ mailbox for one vCPU.
pub struct InterruptSignal {
    pending: AtomicU32,
    lock: Mutex<()>,
    wake: Condvar,
    /// `pthread_t` of the owning vCPU thread, 0 until it starts.
    thread: AtomicU64,
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            lock: Mutex::new(()),
            wake: Condvar::new(),
            thread: AtomicU64::new(0),
        }
    }

    /// Record the calling thread as the one to kick.
    pub fn attach_current_thread(&self) {
        // SAFETY: pthread_self has no preconditions.
        let me = unsafe { libc::pthread_self() };
        self.thread.store(me as u64, Ordering::Release);
    }

    /// Forget the owning thread; later raises only set the pending bit.
    ///
    /// Waits out any raise that is kicking the thread, so once this returns
    /// the thread may exit.
    pub fn detach_thread(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.thread.store(0, Ordering::Release);
    }

    /// Mark `line` pending and make sure the owning vCPU notices.
    ///
    /// Never waits for the vCPU.
    pub fn raise(&self, line: u32) -> Result<(), InterruptError> {
        if line >= IRQ_LINES {
            return Err(InterruptError::LineOutOfRange { line });
        }
        self.pending.fetch_or(1 << line, Ordering::AcqRel);

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wake.notify_all();

        let target = self.thread.load(Ordering::Acquire);
        // SAFETY: pthread_self has no preconditions.
        let me = unsafe { libc::pthread_self() } as u64;
        if target != 0 && target != me {
            // SAFETY: `target` was recorded by the vCPU thread itself, and
            // `detach_thread` cannot clear it while `_guard` is held, so the
            // thread has not yet exited.
            let ret = unsafe { libc::pthread_kill(target as libc::pthread_t, kick_signal()) };
            if ret != 0 {
                return Err(InterruptError::Kick(io::Error::from_raw_os_error(ret)));
            }
        }
        Ok(())
    }

    /// Take every pending line, leaving none pending.
    pub fn take(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Whether any line is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Block until at least one line is pending.
    pub fn wait_for_pending(&self) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_pending() {
            guard = self.wake.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Keeps the calling thread attached to a signal until dropped, including
/// on unwind.
pub(crate) struct ThreadAttachment(Arc<InterruptSignal>);

impl ThreadAttachment {
    pub(crate) fn new(signal: Arc<InterruptSignal>) -> Self {
        signal.attach_current_thread();
        Self(signal)
    }
}

impl Drop for ThreadAttachment {
    fn drop(&mut self) {
        self.0.detach_thread();
    }
}

// ─── IrqSender ───────────────────────────────────────────────────────

/// A clonable handle that raises one IRQ line on one vCPU.
#[derive(Clone)]
pub struct IrqSender {
    signal: Arc<InterruptSignal>,
    line: u32,
}

impl IrqSender {
    pub fn new(signal: Arc<InterruptSignal>, line: u32) -> Result<Self, InterruptError> {
        if line >= IRQ_LINES {
            return Err(InterruptError::LineOutOfRange { line });
        }
        Ok(Self { signal, line })
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn trigger(&self) -> Result<(), InterruptError> {
        self.signal.raise(self.line)
    }
}

impl vm_superio::Trigger for IrqSender {
    type E = io::Error;

    fn trigger(&self) -> Result<(), Self::E> {
        IrqSender::trigger(self).map_err(io::Error::other)
    }
}

/// Iterate the line numbers set in a pending mask, lowest first.
pub fn lines(mut mask: u32) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let line = mask.trailing_zeros();
        mask &= mask - 1;
        Some(line)
    })
}
