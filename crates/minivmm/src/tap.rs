//! Linux tap interface: one Ethernet frame per `read`/`write`.
//!
//! The device is opened through `/dev/net/tun` and bound to an interface
//! name with `TUNSETIFF` in `IFF_TAP | IFF_NO_PI` mode, so frames carry no
//! packet-information prefix.  The descriptor is non-blocking, and
//! `O_ASYNC` with `F_SETSIG 0` arranges asynchronous readiness
//! notification, so one thread can multiplex many taps through
//! [`AsRawFd`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

/// The tun/tap clone device.
pub const TUN_DEVICE: &str = "/dev/net/tun";

const TUNTAP: u32 = b'T' as u32;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, libc::c_int);

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
// `<fcntl.h>` value; not exported by the `libc` crate for glibc targets.
const F_SETSIG: libc::c_int = 10;

/// `struct ifreq` as consumed by `TUNSETIFF`.
#[repr(C)]
#[derive(Default)]
struct Ifreq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

#[derive(Error, Debug)]
pub enum TapError {
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("interface name {name:?} must be 1..{} bytes without NUL", libc::IFNAMSIZ)]
    InvalidName { name: String },

    #[error("TUNSETIFF failed for {name:?}")]
    SetIff {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("fcntl({op}) failed on tap {name:?}")]
    Fcntl {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("tap {name:?} I/O failed")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// An open tap interface.
#[derive(Debug)]
pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    /// Open `/dev/net/tun` and attach to (or create) interface `name`.
    pub fn open(name: &str) -> Result<Self, TapError> {
        Self::open_at(Path::new(TUN_DEVICE), name)
    }

    /// Like [`open`](Self::open) with an explicit clone-device path.
    pub fn open_at(device: &Path, name: &str) -> Result<Self, TapError> {
        let mut ifr = ifreq_for(name)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(device)
            .map_err(|source| TapError::Open {
                path: device.to_path_buf(),
                source,
            })?;

        ifr.ifr_flags = IFF_TAP | IFF_NO_PI;
        // SAFETY: TUNSETIFF reads and writes a `struct ifreq`, which
        // `Ifreq` matches in size and layout.
        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut ifr) };
        if ret < 0 {
            return Err(TapError::SetIff {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let name = ifname(&ifr.ifr_name);

        let fcntl = |op: &'static str, cmd, arg: libc::c_int| {
            // SAFETY: plain fcntl on a descriptor we own.
            let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, arg) };
            if ret < 0 {
                Err(TapError::Fcntl {
                    name: name.clone(),
                    op,
                    source: io::Error::last_os_error(),
                })
            } else {
                Ok(ret)
            }
        };
        fcntl("F_SETSIG", F_SETSIG, 0)?;
        let flags = fcntl("F_GETFL", libc::F_GETFL, 0)?;
        fcntl("F_SETFL", libc::F_SETFL, flags | libc::O_NONBLOCK | libc::O_ASYNC)?;

        info!("Tap interface {name} opened");
        Ok(Self { file, name })
    }

    /// Read one frame.  `Ok(None)` means no frame is ready.
    pub fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, TapError> {
        read_frame(&self.file, buf).map_err(|source| self.io_error(source))
    }

    /// Write one frame; returns the bytes the kernel accepted.
    pub fn write(&self, frame: &[u8]) -> Result<usize, TapError> {
        (&self.file)
            .write(frame)
            .map_err(|source| self.io_error(source))
    }

    /// Close the descriptor.  Dropping the device does the same.
    pub fn close(self) {
        info!("Tap interface {} closed", self.name);
    }

    /// Interface name as reported back by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn io_error(&self, source: io::Error) -> TapError {
        TapError::Io {
            name: self.name.clone(),
            source,
        }
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// One non-blocking read, restarted when a signal interrupts it.
fn read_frame(mut src: impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match src.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn ifreq_for(name: &str) -> Result<Ifreq, TapError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(TapError::InvalidName {
            name: name.to_string(),
        });
    }
    let mut ifr = Ifreq::default();
    ifr.ifr_name[..bytes.len()].copy_from_slice(bytes);
    Ok(ifr)
}

fn ifname(raw: &[u8; libc::IFNAMSIZ]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}
